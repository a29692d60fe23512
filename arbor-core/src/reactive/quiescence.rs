//! Quiescence Policies
//!
//! A recomputed value is only promoted to `Stable` once the replica has
//! settled for the epoch it was computed at. What "settled" means depends on
//! the remote: some servers send an explicit completion signal per mutation
//! wave, others just go quiet. The runtime asks a [`QuiescencePolicy`] and
//! never decides on its own.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Decides whether the replica has settled at a given epoch.
pub trait QuiescencePolicy: Send + Sync + 'static {
    /// True if no mutation wave affecting `epoch` is still in flight.
    fn is_quiescent(&self, epoch: u64) -> bool;

    /// The replica published a new epoch.
    fn on_epoch(&self, _epoch: u64) {}

    /// The remote reported that every mutation up to `epoch` has landed.
    fn on_wave_complete(&self, _epoch: u64) {}

    /// True if settling results must be rechecked on a timer. Policies that
    /// only change their answer in `on_wave_complete` return `false`; the
    /// graph rechecks every node when a wave completes.
    fn rechecks_settling(&self) -> bool {
        true
    }
}

/// Every epoch is quiescent as soon as it is observed.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysQuiescent;

impl QuiescencePolicy for AlwaysQuiescent {
    fn is_quiescent(&self, _epoch: u64) -> bool {
        true
    }
}

/// An epoch is quiescent once it is the latest one and no newer epoch has
/// appeared for `window`.
#[derive(Debug)]
pub struct SettleWindow {
    window: Duration,
    last: Mutex<(u64, Instant)>,
}

impl SettleWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new((0, Instant::now())),
        }
    }
}

impl QuiescencePolicy for SettleWindow {
    fn is_quiescent(&self, epoch: u64) -> bool {
        let (latest, since) = *self.last.lock();
        epoch >= latest && since.elapsed() >= self.window
    }

    fn on_epoch(&self, epoch: u64) {
        let mut last = self.last.lock();
        if epoch > last.0 {
            *last = (epoch, Instant::now());
        }
    }
}

/// An epoch is quiescent once the remote has reported its wave complete.
#[derive(Debug, Default)]
pub struct ExplicitCompletion {
    completed: Mutex<u64>,
}

impl ExplicitCompletion {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QuiescencePolicy for ExplicitCompletion {
    fn is_quiescent(&self, epoch: u64) -> bool {
        epoch <= *self.completed.lock()
    }

    fn on_wave_complete(&self, epoch: u64) {
        let mut completed = self.completed.lock();
        *completed = (*completed).max(epoch);
    }

    fn rechecks_settling(&self) -> bool {
        false
    }
}
