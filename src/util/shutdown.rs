//! Cooperative drain and force-close signalling.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Two-stage stop signal shared by a listener and all of its connections.
///
/// `begin_drain` asks everyone to stop at the next read boundary; `force`
/// additionally tells connections to drop their sockets immediately.
#[derive(Clone, Debug, Default)]
pub struct DrainSignal {
    drain: CancellationToken,
    force: CancellationToken,
}

impl DrainSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop accepting and stop reading.
    pub fn begin_drain(&self) {
        self.drain.cancel();
    }

    /// Abandon in-flight work. Implies `begin_drain`.
    pub fn force(&self) {
        self.drain.cancel();
        self.force.cancel();
    }

    #[cfg(test)]
    fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    #[cfg(test)]
    fn is_forced(&self) -> bool {
        self.force.is_cancelled()
    }

    /// Resolves once a drain has begun.
    pub fn draining(&self) -> WaitForCancellationFuture<'_> {
        self.drain.cancelled()
    }

    /// Resolves once the drain has been escalated to a force-close.
    pub fn forced(&self) -> WaitForCancellationFuture<'_> {
        self.force.cancelled()
    }
}

/// Resolved once a listener has fully closed.
#[derive(Clone, Debug, Default)]
pub struct CloseSignal {
    closed: CancellationToken,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the listener has closed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }
}
