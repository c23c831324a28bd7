//! Per-level session policy.

use crate::buf::DEFAULT_BUFFER_SIZE;
use std::collections::HashMap;
use std::time::Duration;

/// Timeouts applied to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Limit on the whole handshake.
    pub handshake: Duration,
    /// Idle limit while both directions are open.
    pub connection_idle: Duration,
    /// Idle limit once the downlink has finished.
    pub uplink_only: Duration,
    /// Idle limit once the uplink has finished.
    pub downlink_only: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(4),
            connection_idle: Duration::from_secs(300),
            uplink_only: Duration::from_secs(1),
            downlink_only: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPolicy {
    /// Relay buffer size per direction, in bytes.
    pub per_connection: usize,
}

impl Default for BufferPolicy {
    fn default() -> Self {
        Self {
            per_connection: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionPolicy {
    pub timeouts: Timeouts,
    pub buffer: BufferPolicy,
}

/// Maps user levels to session policies.
#[derive(Debug, Clone, Default)]
pub struct PolicyManager {
    levels: HashMap<u32, SessionPolicy>,
    default: SessionPolicy,
}

impl PolicyManager {
    pub fn new(default: SessionPolicy) -> Self {
        Self {
            levels: HashMap::new(),
            default,
        }
    }

    pub fn set_level(&mut self, level: u32, policy: SessionPolicy) {
        self.levels.insert(level, policy);
    }

    /// Policy for `level`, falling back to the default.
    pub fn for_level(&self, level: u32) -> SessionPolicy {
        self.levels.get(&level).copied().unwrap_or(self.default)
    }
}
