//! Per-connection session context.
//!
//! A [`Session`] is created when a connection is accepted, is owned by that
//! connection's task, and is dropped when the task returns. It carries the
//! correlation id used in every log line, where the connection came from,
//! which inbound accepted it, the sniffing directives for the router, and
//! the idle timer once relay has started.

use crate::net::Destination;
use crate::signal::IdleTimer;
use rand::Rng;
use std::fmt;
use tokio_util::sync::CancellationToken;

/// Correlation id, unique per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(u32);

impl SessionId {
    /// Allocate a random non-zero id.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let id: u32 = rng.gen();
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

/// The user a connection is attributed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryUser {
    /// Policy level; selects timeouts and buffer sizes.
    pub level: u32,
    /// Identity learned during authentication (e.g. a SOCKS username).
    pub email: String,
}

/// Where the connection entered the system.
#[derive(Debug, Clone, Default)]
pub struct Inbound {
    /// Remote peer address.
    pub source: Option<Destination>,
    /// Local listen address and port.
    pub gateway: Option<Destination>,
    /// Tag of the inbound that accepted the connection.
    pub tag: String,
    /// Protocol name set by the handler (e.g. `"socks"`).
    pub name: &'static str,
    pub user: MemoryUser,
    /// Set by the relay once it starts.
    pub timer: Option<IdleTimer>,
}

/// Outbound hints gathered before dispatch.
#[derive(Debug, Clone, Default)]
pub struct Outbound {
    /// Pre-NAT destination recovered in transparent-proxy modes.
    pub target: Option<Destination>,
}

/// Content-sniffing directives. Passed through to routing; not acted on
/// here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SniffingRequest {
    pub enabled: bool,
    pub override_destination_for_protocol: Vec<String>,
    pub exclude_for_domain: Vec<String>,
    pub metadata_only: bool,
    pub route_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Content {
    pub sniffing: SniffingRequest,
}

/// Metadata bundle threaded through handshake, dispatch and relay.
#[derive(Debug)]
pub struct Session {
    pub id: SessionId,
    pub inbound: Inbound,
    pub outbound: Outbound,
    pub content: Content,
    token: CancellationToken,
}

impl Session {
    /// New session whose lifetime is tied to `token`.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            id: SessionId::new(),
            inbound: Inbound::default(),
            outbound: Outbound::default(),
            content: Content::default(),
            token,
        }
    }

    /// Cancellation token for the whole connection.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// A token cancelled together with this session, which can also be
    /// cancelled on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
