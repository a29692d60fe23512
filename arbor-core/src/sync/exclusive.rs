//! Single-Flight Dispatch
//!
//! [`ExclusiveRequest`] wraps an async operation so that at most one call is
//! in flight at a time. A call that arrives while another is running waits
//! for it; when the running call finishes, only the most recent waiting call
//! proceeds and every call it superseded resolves to `None`.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

/// An async operation that drops superseded concurrent calls.
pub struct ExclusiveRequest<F> {
    request: F,
    latest: AtomicU64,
    in_flight: Mutex<()>,
}

impl<F> ExclusiveRequest<F> {
    pub fn new(request: F) -> Self {
        Self {
            request,
            latest: AtomicU64::new(0),
            in_flight: Mutex::new(()),
        }
    }

    /// Dispatch a call.
    ///
    /// Returns `Some(result)` if the call ran, or `None` if a newer call was
    /// issued before this one got its turn.
    pub async fn call<A, Fut>(&self, arg: A) -> Option<Fut::Output>
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        let ticket = self.latest.fetch_add(1, Ordering::SeqCst) + 1;

        // tokio's mutex is fair, so waiters get their turn in call order.
        let _running = self.in_flight.lock().await;
        if self.latest.load(Ordering::SeqCst) != ticket {
            return None;
        }

        Some((self.request)(arg).await)
    }
}
