//! SOCKS 5 inbound: handshake state machine and relay.

pub mod protocol;
pub mod server;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

pub use protocol::{Command, HandshakeRequest, ServerSession};
pub use server::Server;

/// Authentication method the inbound requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    NoAuth,
    Password,
}

/// Static configuration of one SOCKS inbound.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub auth_type: AuthType,
    /// Username to password.
    pub accounts: HashMap<String, String>,
    /// Address advertised in UDP ASSOCIATE replies. Defaults to the
    /// connection's local address.
    pub address: Option<IpAddr>,
    pub udp_enabled: bool,
    pub user_level: u32,
    /// Deprecated idle timeout override.
    pub timeout: Option<Duration>,
}

impl ServerConfig {
    pub fn has_account(&self, user: &str, pass: &str) -> bool {
        self.accounts.get(user).is_some_and(|p| p == pass)
    }
}
