//! Connection identifiers.
//!
//! Every accepted socket gets a process-unique id that tags its log lines and
//! is handed to the message sinks.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counter shared by every listener.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one accepted connection.
///
/// Format: `conn-{counter}` where counter is zero-padded to 16 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id. Unique within a single process.
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{:016x}", self.0)
    }
}
