use std::fmt;
use std::io;
use thiserror::Error;

/// The point of the SOCKS negotiation at which a handshake failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStage {
    Greeting,
    MethodSelection,
    AuthSubnegotiation,
    CommandRequest,
    Reply,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HandshakeStage::Greeting => "greeting",
            HandshakeStage::MethodSelection => "method selection",
            HandshakeStage::AuthSubnegotiation => "auth subnegotiation",
            HandshakeStage::CommandRequest => "command request",
            HandshakeStage::Reply => "reply",
        };
        f.write_str(s)
    }
}

/// Errors produced by the portway data plane.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("handshake failed at {stage}: {reason}")]
    Handshake {
        stage: HandshakeStage,
        reason: String,
    },

    #[error("unsupported command: {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("dispatch denied: {0}")]
    Dispatch(String),

    #[error("{context}: {source}")]
    Relay {
        context: &'static str,
        #[source]
        source: Box<ProxyError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

impl ProxyError {
    pub fn handshake(stage: HandshakeStage, reason: impl Into<String>) -> Self {
        ProxyError::Handshake {
            stage,
            reason: reason.into(),
        }
    }

    /// Wrap `self` with a short description of what was being attempted.
    pub fn context(self, context: &'static str) -> Self {
        ProxyError::Relay {
            context,
            source: Box::new(self),
        }
    }

    /// Whether this error originates from cancellation (idle timeout or
    /// shutdown) rather than from I/O.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ProxyError::Cancelled => true,
            ProxyError::Io(e) => e.kind() == io::ErrorKind::Interrupted,
            ProxyError::Relay { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// SOCKS 5 reply status for this error (RFC 1928 §6).
    pub fn socks_reply_code(&self) -> u8 {
        match self {
            ProxyError::Dispatch(_) => 0x02,
            ProxyError::UnsupportedCommand(_) => 0x07,
            ProxyError::UnsupportedAddressType(_) => 0x08,
            ProxyError::Timeout(_) => 0x06,
            ProxyError::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => 0x05,
                io::ErrorKind::NotFound | io::ErrorKind::HostUnreachable => 0x04,
                io::ErrorKind::NetworkUnreachable => 0x03,
                io::ErrorKind::TimedOut => 0x06,
                _ => 0x01,
            },
            ProxyError::Relay { source, .. } => source.socks_reply_code(),
            _ => 0x01,
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
