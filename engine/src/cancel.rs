//! Task-level abort handle.

use tokio_util::sync::CancellationToken;

/// Cloneable handle that aborts one task.
///
/// Aborting cancels the session token. The open event stream observes it on
/// its next poll and drops the connection; running tools observe it through
/// their child tokens.
#[derive(Debug, Clone, Default)]
pub struct CancellationController {
    token: CancellationToken,
}

impl CancellationController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn abort(&self) {
        if !self.token.is_cancelled() {
            tracing::info!("Task abort requested");
        }
        self.token.cancel();
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled with this controller but cancellable on its own.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}
