//! Idempotent session termination
//!
//! Several tasks may notice that a session is over at the same moment (the
//! client closed, the process exited, a relay direction failed). All of them
//! call [`Terminator::terminate`]; only the first call has any effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Shared, level-triggered termination signal
#[derive(Clone, Debug, Default)]
pub struct Terminator {
    fired: Arc<AtomicBool>,
    token: CancellationToken,
}

impl Terminator {
    /// Create an untriggered terminator
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal termination
    ///
    /// Returns true only for the call that actually fired the signal.
    pub fn terminate(&self) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!("session terminated");
        self.token.cancel();
        true
    }

    /// Whether termination has been signalled
    pub fn is_terminated(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait until termination is signalled
    ///
    /// Completes immediately if it already was.
    pub async fn terminated(&self) {
        self.token.cancelled().await
    }
}
