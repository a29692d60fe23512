//! Synchronization Primitives
//!
//! Small building blocks the graph runtime is assembled from:
//!
//! - [`AwaitLock`] / [`AdvisoryLocks`]: FIFO asynchronous locks, single or keyed
//! - [`CallersCounter`]: set-based reference count gating resource lifecycle
//! - [`ExclusiveRequest`]: single-flight wrapper dropping superseded calls
//! - [`AbortSignal`]: cancellation token plus deadline for any wait

mod callers;
mod exclusive;
mod lock;
mod signal;

pub use callers::CallersCounter;
pub use exclusive::ExclusiveRequest;
pub use lock::{AdvisoryLocks, AwaitLock, LockToken};
pub use signal::AbortSignal;
