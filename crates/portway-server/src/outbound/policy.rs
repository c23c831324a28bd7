//! Outbound access control: which destinations may be dialed and how many
//! dialed connections may be open at once.
//!
//! [`DestinationPolicy`] holds the rules; [`PolicyEnforcer`] owns them plus
//! the live connection count.

use portway_core::{Address, Destination};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Static outbound rules.
///
/// `allowed_destinations` accepts three forms:
///
/// | Pattern             | Matches                          |
/// |---------------------|----------------------------------|
/// | `"*"`               | anything                         |
/// | `"example.com"`     | that host on any port            |
/// | `"example.com:443"` | that host and port only          |
///
/// Hosts compare case-insensitively. An empty list allows nothing.
#[derive(Debug, Clone)]
pub struct DestinationPolicy {
    pub allowed_destinations: Vec<String>,
    pub max_connections: usize,
}

impl Default for DestinationPolicy {
    fn default() -> Self {
        Self {
            allowed_destinations: vec!["*".to_string()],
            max_connections: 1024,
        }
    }
}

/// Runtime counterpart of [`DestinationPolicy`].
pub struct PolicyEnforcer {
    max_connections: usize,
    active: Arc<AtomicUsize>,
    allowed: HashSet<String>,
    allow_all: bool,
}

impl PolicyEnforcer {
    pub fn new(policy: DestinationPolicy) -> Self {
        let allow_all = policy.allowed_destinations.iter().any(|d| d == "*");
        let allowed = policy
            .allowed_destinations
            .iter()
            .map(|d| d.to_ascii_lowercase())
            .collect();
        Self {
            max_connections: policy.max_connections,
            active: Arc::new(AtomicUsize::new(0)),
            allowed,
            allow_all,
        }
    }

    /// Whether `destination` matches the allowlist.
    pub fn check(&self, destination: &Destination) -> Result<(), String> {
        if self.allow_all {
            return Ok(());
        }
        let host = match &destination.address {
            // Bare form, so "::1" and "::1:443" style entries can match.
            Address::Ip(ip) => ip.to_string(),
            other => other.to_string().to_ascii_lowercase(),
        };
        let host_port = format!("{}:{}", host, destination.port);
        let bracketed = format!("{}:{}", destination.address, destination.port).to_ascii_lowercase();
        if self.allowed.contains(&host)
            || self.allowed.contains(&host_port)
            || self.allowed.contains(&bracketed)
        {
            return Ok(());
        }
        Err(format!("destination not allowed: {destination}"))
    }

    /// Take a connection slot, released when the guard drops.
    pub fn try_acquire(&self) -> Result<ConnectionGuard, String> {
        let max = self.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .map_err(|n| format!("connection limit reached ({n}/{max})"))?;
        Ok(ConnectionGuard {
            counter: self.active.clone(),
        })
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

/// Holds one connection slot.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
