use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A one-shot readiness latch that many tasks can wait on.
///
/// Backed by a [`CancellationToken`], which has exactly the wanted shape:
/// many waiters, one irreversible trigger.
#[derive(Clone, Debug, Default)]
pub struct ReadyToken(CancellationToken);

impl ReadyToken {
    /// Create an unready token
    #[must_use]
    pub fn new() -> Self {
        Self(CancellationToken::new())
    }

    /// Whether the token has been made ready
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Resolves once the token is made ready
    pub fn ready(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }

    /// Make the token ready, releasing all waiters
    pub fn make_ready(&self) {
        self.0.cancel();
    }
}
