//! Access-event sink.
//!
//! Handlers record one [`AccessMessage`] per accepted or rejected request.
//! The sink is injected; nothing here is global.

use crate::net::Destination;
use crate::session::SessionId;
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Accepted,
    Rejected,
}

impl fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessStatus::Accepted => "accepted",
            AccessStatus::Rejected => "rejected",
        })
    }
}

#[derive(Debug, Clone)]
pub struct AccessMessage {
    pub session: SessionId,
    pub from: Option<Destination>,
    pub to: Option<Destination>,
    pub status: AccessStatus,
    pub reason: String,
    pub inbound_tag: String,
    pub email: String,
}

impl fmt::Display for AccessMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.from {
            Some(from) => write!(f, "from {from}")?,
            None => f.write_str("from unknown")?,
        }
        write!(f, " {}", self.status)?;
        if let Some(to) = &self.to {
            write!(f, " {to}")?;
        }
        if !self.inbound_tag.is_empty() {
            write!(f, " [{}]", self.inbound_tag)?;
        }
        if !self.reason.is_empty() {
            write!(f, " {}", self.reason)?;
        }
        if !self.email.is_empty() {
            write!(f, " email: {}", self.email)?;
        }
        Ok(())
    }
}

/// Fire-and-forget recorder of access events. Implementations must not
/// block.
pub trait AccessLog: Send + Sync {
    fn record(&self, msg: AccessMessage);
}

/// Emits access events as `tracing` records under the `access` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAccessLog;

impl AccessLog for TracingAccessLog {
    fn record(&self, msg: AccessMessage) {
        info!(target: "access", session = %msg.session, status = %msg.status, "{msg}");
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAccessLog;

impl AccessLog for NoopAccessLog {
    fn record(&self, _msg: AccessMessage) {}
}
