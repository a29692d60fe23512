//! Advisory Locks
//!
//! An advisory lock serializes logically conflicting operations that share a
//! key. The storage layer does not enforce it; cooperating callers do.
//!
//! # Fairness
//!
//! Waiters are served in strict FIFO order. A release hands the lock directly
//! to the longest-waiting acquirer instead of clearing the held flag and
//! letting everyone race for it, so a slow mutator can't be starved by a fast
//! path that keeps re-acquiring the same key.
//!
//! # Cancellation
//!
//! Dropping a pending `acquire` future removes its queue slot. If the lock was
//! already handed to that waiter when it was dropped, the lock is passed on to
//! the next waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::LockMisuseError;

/// Tickets are unique across all locks so a token can never match a lock it
/// was not issued by.
fn next_ticket() -> u64 {
    static TICKETS: AtomicU64 = AtomicU64::new(1);
    TICKETS.fetch_add(1, Ordering::Relaxed)
}

/// Proof of a successful acquisition. Pass it back to `release`.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a lock token must be released"]
pub struct LockToken {
    key: String,
    ticket: u64,
}

impl LockToken {
    /// The key this token was issued for.
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug, Default)]
struct LockState {
    holder: Option<u64>,
    queue: VecDeque<(u64, oneshot::Sender<()>)>,
}

/// A single asynchronous FIFO lock.
#[derive(Debug)]
pub struct AwaitLock {
    key: String,
    state: Mutex<LockState>,
}

impl AwaitLock {
    pub fn new() -> Self {
        Self::named("")
    }

    /// Create a lock whose tokens and errors carry `key`.
    pub fn named(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquire the lock, waiting behind earlier acquirers if it is held.
    pub async fn acquire(&self) -> LockToken {
        let ticket = next_ticket();

        let rx = {
            let mut state = self.state.lock();
            if state.holder.is_none() {
                state.holder = Some(ticket);
                return self.token(ticket);
            }
            let (tx, rx) = oneshot::channel();
            state.queue.push_back((ticket, tx));
            trace!(key = %self.key, ticket, queued = state.queue.len(), "lock contended");
            rx
        };

        let mut slot = QueueSlot {
            lock: self,
            ticket,
            owned: false,
        };
        // The sender is only dropped unsent after this slot left the queue,
        // which can't happen while we're still waiting on it.
        let _ = rx.await;
        slot.owned = true;

        self.token(ticket)
    }

    /// Release the lock held by `token`.
    ///
    /// Hands the lock to the longest-waiting acquirer, or marks it free if
    /// nobody is waiting.
    pub fn release(&self, token: LockToken) -> Result<(), LockMisuseError> {
        let mut state = self.state.lock();
        if state.holder != Some(token.ticket) {
            return Err(LockMisuseError {
                key: self.key.clone(),
            });
        }
        Self::hand_off(&mut state);
        Ok(())
    }

    /// True if the lock is currently held.
    pub fn is_held(&self) -> bool {
        self.state.lock().holder.is_some()
    }

    /// Number of acquirers waiting.
    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.holder.is_none() && state.queue.is_empty()
    }

    fn token(&self, ticket: u64) -> LockToken {
        LockToken {
            key: self.key.clone(),
            ticket,
        }
    }

    fn hand_off(state: &mut LockState) {
        while let Some((ticket, tx)) = state.queue.pop_front() {
            state.holder = Some(ticket);
            if tx.send(()).is_ok() {
                return;
            }
        }
        state.holder = None;
    }
}

impl Default for AwaitLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes an abandoned waiter from the queue, or passes on a lock that was
/// handed to it after it stopped listening.
struct QueueSlot<'a> {
    lock: &'a AwaitLock,
    ticket: u64,
    owned: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.owned {
            return;
        }
        let mut state = self.lock.state.lock();
        let before = state.queue.len();
        state.queue.retain(|(ticket, _)| *ticket != self.ticket);
        if state.queue.len() == before && state.holder == Some(self.ticket) {
            AwaitLock::hand_off(&mut state);
        }
    }
}

/// Keyed registry of advisory locks, owned by one graph instance.
///
/// Locks are created on first use and evicted once nobody holds or waits on
/// them.
#[derive(Debug, Default)]
pub struct AdvisoryLocks {
    locks: DashMap<String, Arc<AwaitLock>>,
}

impl AdvisoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`.
    ///
    /// An acquisition abandoned before it completes evicts the entry if it
    /// left the lock idle.
    pub async fn acquire(&self, key: &str) -> LockToken {
        let lock = self
            .locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(AwaitLock::named(key)))
            .clone();
        let mut pending = PendingAcquire {
            locks: self,
            key,
            lock,
            done: false,
        };
        let token = pending.lock.acquire().await;
        pending.done = true;
        token
    }

    /// Release a token obtained from [`acquire`](Self::acquire).
    pub fn release(&self, token: LockToken) -> Result<(), LockMisuseError> {
        let key = token.key.clone();
        let lock = self
            .locks
            .get(&key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LockMisuseError { key: key.clone() })?;
        lock.release(token)?;
        drop(lock);

        self.evict_if_idle(&key);
        Ok(())
    }

    /// Run `operation` while holding the lock for `key`.
    pub async fn with_lock<F, T>(&self, key: &str, operation: F) -> Result<T, LockMisuseError>
    where
        F: Future<Output = T>,
    {
        let mut held = HeldLock {
            locks: self,
            token: Some(self.acquire(key).await),
        };
        let result = operation.await;
        if let Some(token) = held.token.take() {
            self.release(token)?;
        }
        Ok(result)
    }

    /// True if the lock for `key` is currently held.
    pub fn is_held(&self, key: &str) -> bool {
        self.locks.get(key).is_some_and(|lock| lock.is_held())
    }

    /// Number of keys with a live lock entry.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn evict_if_idle(&self, key: &str) {
        self.locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1 && lock.is_idle());
    }
}

/// Evicts the registry entry of an acquisition dropped before it completed.
struct PendingAcquire<'a> {
    locks: &'a AdvisoryLocks,
    key: &'a str,
    lock: Arc<AwaitLock>,
    done: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        // Evict only if the registry and this acquisition are the last owners.
        self.locks.locks.remove_if(self.key, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2 && lock.is_idle()
        });
    }
}

/// Releases the lock of a `with_lock` section that was dropped mid-way.
struct HeldLock<'a> {
    locks: &'a AdvisoryLocks,
    token: Option<LockToken>,
}

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            trace!(key = token.key(), "critical section abandoned; releasing");
            // The token came from this registry, so release can't fail.
            let _ = self.locks.release(token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn uncontended_acquire_is_immediate() {
        let lock = AwaitLock::new();
        let token = lock.acquire().await;
        assert!(lock.is_held());

        lock.release(token).unwrap();
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn release_with_foreign_token_fails() {
        let a = AwaitLock::named("a");
        let b = AwaitLock::named("b");

        let token = a.acquire().await;
        let err = b.release(token).unwrap_err();
        assert_eq!(err.key, "b");
        assert!(a.is_held());
    }

    #[tokio::test]
    async fn registry_release_of_unknown_key_fails() {
        let locks = AdvisoryLocks::new();
        let other = AwaitLock::named("nowhere");
        let token = other.acquire().await;

        assert!(locks.release(token).is_err());
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let locks = Arc::new(AdvisoryLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = locks.acquire("k").await;

        let mut handles = Vec::new();
        for i in 0..5 {
            let task_locks = locks.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let token = task_locks.acquire("k").await;
                order.lock().push(i);
                task_locks.release(token).unwrap();
            }));
            // Let the task enqueue before spawning the next one.
            while locks.locks.get("k").map(|l| l.queue_len()).unwrap_or(0) < i + 1 {
                tokio::task::yield_now().await;
            }
        }

        locks.release(first).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn dropped_waiter_leaves_no_slot() {
        let lock = Arc::new(AwaitLock::new());
        let token = lock.acquire().await;

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move {
                let _token = lock.acquire().await;
            })
        };
        while lock.queue_len() == 0 {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = waiter.await;

        assert_eq!(lock.queue_len(), 0);
        lock.release(token).unwrap();
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn aborted_section_releases_its_key() {
        let locks = Arc::new(AdvisoryLocks::new());

        let section = {
            let locks = locks.clone();
            tokio::spawn(async move {
                locks
                    .with_lock("k", tokio::time::sleep(Duration::from_secs(60)))
                    .await
            })
        };
        while !locks.is_held("k") {
            tokio::task::yield_now().await;
        }
        section.abort();
        assert!(section.await.unwrap_err().is_cancelled());

        assert!(!locks.is_held("k"));
        let token = tokio::time::timeout(Duration::from_millis(200), locks.acquire("k"))
            .await
            .expect("key stayed held after the section was dropped");
        locks.release(token).unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn abandoned_handoff_evicts_the_key() {
        let locks = Arc::new(AdvisoryLocks::new());
        let token = locks.acquire("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let token = locks.acquire("k").await;
                locks.release(token).unwrap();
            })
        };
        while locks.locks.get("k").map(|l| l.queue_len()).unwrap_or(0) == 0 {
            tokio::task::yield_now().await;
        }

        // Hand the lock to the waiter, then drop the waiter before it runs.
        locks.release(token).unwrap();
        waiter.abort();
        let _ = waiter.await;

        assert!(!locks.is_held("k"));
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let locks = AdvisoryLocks::new();
        let a = locks.acquire("a").await;
        let b = locks.acquire("b").await;

        assert!(locks.is_held("a"));
        assert!(locks.is_held("b"));
        locks.release(a).unwrap();
        locks.release(b).unwrap();
        assert!(locks.is_empty());
    }

    async fn contended_section(active: &AtomicUsize) -> bool {
        let concurrent = active.fetch_add(1, Ordering::SeqCst) > 0;
        tokio::time::sleep(Duration::from_millis(1)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        concurrent
    }

    #[tokio::test]
    async fn lock_prevents_concurrent_sections() {
        let locks = Arc::new(AdvisoryLocks::new());
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let locks = locks.clone();
            let active = active.clone();
            handles.push(tokio::spawn(async move {
                locks
                    .with_lock("shared", contended_section(&active))
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert!(!handle.await.unwrap(), "locked section ran concurrently");
        }
    }

    #[tokio::test]
    async fn control_without_lock_observes_concurrency() {
        let active = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let active = active.clone();
            handles.push(tokio::spawn(async move { contended_section(&active).await }));
        }

        let mut violations = 0;
        for handle in handles {
            if handle.await.unwrap() {
                violations += 1;
            }
        }
        assert!(violations > 0);
    }
}
