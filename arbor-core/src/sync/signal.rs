//! Abort Signals
//!
//! Every suspension point exposed to callers takes an [`AbortSignal`]: an
//! optional cancellation token plus an optional deadline. Waiting on a signal
//! allocates nothing that outlives the wait; the deadline timer is a local
//! `Sleep` dropped together with the waiting future.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CancelError;

/// Cancellation source for a single wait.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: Option<CancellationToken>,
    deadline: Option<Instant>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self::default()
    }

    /// A signal that fires when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token: Some(token),
            deadline: None,
        }
    }

    /// A signal that fires once `timeout` has elapsed from now.
    pub fn timeout(timeout: Duration) -> Self {
        Self::never().with_deadline(Instant::now() + timeout)
    }

    /// Add (or tighten) a deadline.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Add a cancellation token, replacing any previous one.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Returns the reason if the signal has already fired.
    pub fn check(&self) -> Result<(), CancelError> {
        if self.token.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(CancelError::Aborted);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CancelError::DeadlineExceeded);
        }
        Ok(())
    }

    /// True if the signal has already fired.
    pub fn is_aborted(&self) -> bool {
        self.check().is_err()
    }

    /// Completes when the signal fires. Never completes for [`AbortSignal::never`].
    pub async fn fired(&self) -> CancelError {
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => CancelError::Aborted,
            _ = expired => CancelError::DeadlineExceeded,
        }
    }
}

impl From<CancellationToken> for AbortSignal {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}
