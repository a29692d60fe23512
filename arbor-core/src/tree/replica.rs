//! Tree Replica
//!
//! A local, partial, versioned mirror of the remote resource tree.
//!
//! # Epochs
//!
//! The replica keeps a global epoch that advances by one for every applied
//! delta and every resolved fetch. Each slot remembers the epoch at which it
//! last changed. A computation stamped with epoch `E` is stale as soon as any
//! slot it read has `changed_at > E`.
//!
//! Commits write the slots first (stamped `E + 1`) and publish the new epoch
//! last, so a reader that snapshots the epoch mid-commit sees `E` and detects
//! every slot it read from the commit in progress.
//!
//! # Pending reads
//!
//! [`TreeReplica::read`] never blocks. An unknown resource is marked pending,
//! fetched in the background with retry and backoff, and announced on the
//! change stream once the fetch resolves either way.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::config::FetchConfig;
use crate::error::ReplicaFetchError;
use crate::instrument::{Instrumentation, TreeStats};
use crate::tree::{Change, Delta, ResourceId, ResourceSource, TreeNode};

/// Capacity of the change broadcast before slow receivers start lagging.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// Result of a non-blocking read.
#[derive(Debug, Clone)]
pub enum Read {
    /// The node is present.
    Ready(Arc<TreeNode>),
    /// The node is being fetched.
    Pending,
    /// The node is known not to exist.
    Absent,
    /// Fetching the node failed after all retries.
    Failed(ReplicaFetchError),
}

impl Read {
    pub fn is_pending(&self) -> bool {
        matches!(self, Read::Pending)
    }

    /// The node, if present.
    pub fn node(&self) -> Option<&Arc<TreeNode>> {
        match self {
            Read::Ready(node) => Some(node),
            _ => None,
        }
    }
}

/// Resources whose content changed at `epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    pub epoch: u64,
    pub changed: BTreeSet<ResourceId>,
}

#[derive(Debug, Clone)]
struct Slot {
    read: Read,
    /// Last version seen for the resource, removals included.
    version: Option<u64>,
    changed_at: u64,
}

/// Local mirror of the remote tree.
pub struct TreeReplica {
    slots: DashMap<ResourceId, Slot>,
    epoch: AtomicU64,
    /// Serializes commits so slot stamps and the published epoch agree.
    commit: Mutex<()>,
    roots: DashSet<ResourceId>,
    reachable: DashSet<ResourceId>,
    source: Arc<dyn ResourceSource>,
    fetch: FetchConfig,
    changes: broadcast::Sender<ChangeSet>,
    instruments: Arc<Instrumentation>,
    this: Weak<TreeReplica>,
}

impl TreeReplica {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        fetch: FetchConfig,
        instruments: Arc<Instrumentation>,
    ) -> Arc<Self> {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new_cyclic(|this| Self {
            slots: DashMap::new(),
            epoch: AtomicU64::new(0),
            commit: Mutex::new(()),
            roots: DashSet::new(),
            reachable: DashSet::new(),
            source,
            fetch,
            changes,
            instruments,
            this: this.clone(),
        })
    }

    /// The last published epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Alias of [`epoch`](Self::epoch), used to stamp computations.
    pub fn snapshot(&self) -> u64 {
        self.epoch()
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeSet> {
        self.changes.subscribe()
    }

    /// Read a node without blocking.
    ///
    /// An unknown resource is marked pending and fetched in the background.
    pub fn read(&self, id: ResourceId) -> Read {
        if let Some(slot) = self.slots.get(&id) {
            return slot.read.clone();
        }
        if self.mark_pending(id) {
            self.spawn_fetch(id);
        }
        self.slots
            .get(&id)
            .map(|slot| slot.read.clone())
            .unwrap_or(Read::Pending)
    }

    /// Read a node without scheduling a fetch. `None` if the replica has no
    /// slot for it.
    pub fn peek(&self, id: ResourceId) -> Option<Read> {
        self.slots.get(&id).map(|slot| slot.read.clone())
    }

    /// Epoch at which `id` last changed.
    pub fn changed_at(&self, id: ResourceId) -> Option<u64> {
        self.slots.get(&id).map(|slot| slot.changed_at)
    }

    /// True if `id` changed after `epoch`.
    pub fn changed_since(&self, id: ResourceId, epoch: u64) -> bool {
        self.changed_at(id).is_some_and(|at| at > epoch)
    }

    /// Register a root. Everything reachable from a root is kept present or
    /// pending.
    pub fn register_root(&self, root: ResourceId) {
        if !self.roots.insert(root) {
            return;
        }
        self.reachable.insert(root);
        if let Read::Ready(node) = self.read(root) {
            self.expand(&node);
        }
    }

    /// Merge a delta into the replica.
    ///
    /// Bumps the epoch and returns the resources whose content changed.
    /// Records not newer than the stored version are ignored.
    pub fn apply_delta(&self, delta: Delta) -> ChangeSet {
        let mut stats = TreeStats {
            deltas: 1,
            records: delta.records.len() as u64,
            ..TreeStats::default()
        };
        let mut changed = BTreeSet::new();
        let mut landed = Vec::new();

        let epoch = {
            let _commit = self.commit.lock();
            let next = self.epoch() + 1;

            for record in delta.records {
                let id = record.id;
                let fresh = self
                    .slots
                    .get(&id)
                    .and_then(|slot| slot.version)
                    .map_or(true, |known| record.version > known);
                if !fresh {
                    stats.stale += 1;
                    continue;
                }

                let read = match record.change {
                    Change::Upsert {
                        kind,
                        payload,
                        children,
                    } => {
                        let node = Arc::new(TreeNode {
                            id,
                            version: record.version,
                            kind,
                            payload,
                            children,
                        });
                        landed.push(node.clone());
                        Read::Ready(node)
                    }
                    Change::Removed => Read::Absent,
                };

                match self.slots.entry(id) {
                    Entry::Occupied(mut entry) => {
                        match (&entry.get().read, &read) {
                            (_, Read::Absent) => stats.removed += 1,
                            (Read::Ready(_), _) => stats.updated += 1,
                            _ => stats.added += 1,
                        }
                        entry.insert(Slot {
                            read,
                            version: Some(record.version),
                            changed_at: next,
                        });
                    }
                    Entry::Vacant(entry) => {
                        if matches!(read, Read::Absent) {
                            stats.removed += 1;
                        } else {
                            stats.added += 1;
                        }
                        entry.insert(Slot {
                            read,
                            version: Some(record.version),
                            changed_at: next,
                        });
                    }
                }
                changed.insert(id);
            }

            self.epoch.store(next, Ordering::Release);
            next
        };

        debug!(epoch, root = %delta.root, changed = changed.len(), "delta applied");
        self.instruments.on_delta(epoch, &stats);
        if !changed.is_empty() && self.instruments.take_initial_dump() {
            self.instruments.dump_tree(epoch, &self.nodes());
        }

        for node in &landed {
            if self.reachable.contains(&node.id) {
                self.expand(node);
            }
        }

        let set = ChangeSet { epoch, changed };
        if !set.changed.is_empty() {
            // No receivers is fine: nothing is listening yet.
            let _ = self.changes.send(set.clone());
        }
        set
    }

    /// A resource gained its first reader.
    pub fn activate(&self, id: ResourceId) {
        trace!(resource = %id, "resource activated");
        self.source.subscribe(id);
    }

    /// A resource lost its last reader. Drops it from the replica unless it
    /// is reachable from a registered root.
    pub fn deactivate(&self, id: ResourceId) {
        trace!(resource = %id, "resource deactivated");
        self.source.unsubscribe(id);
        if !self.reachable.contains(&id) {
            self.slots.remove(&id);
        }
    }

    /// All present nodes, ordered by id.
    pub fn nodes(&self) -> Vec<Arc<TreeNode>> {
        let mut nodes: Vec<_> = self
            .slots
            .iter()
            .filter_map(|slot| slot.read.node().cloned())
            .collect();
        nodes.sort_by_key(|node| node.id);
        nodes
    }

    /// Number of slots, including pending and absent ones.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Make sure the children of a reachable node are present or pending.
    fn expand(&self, node: &TreeNode) {
        for child in node.children.values() {
            self.reachable.insert(*child);
            if self.mark_pending(*child) {
                self.spawn_fetch(*child);
            }
        }
    }

    /// Insert a pending slot if none exists. Returns true if inserted.
    fn mark_pending(&self, id: ResourceId) -> bool {
        match self.slots.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(Slot {
                    read: Read::Pending,
                    version: None,
                    changed_at: self.epoch(),
                });
                true
            }
        }
    }

    fn spawn_fetch(&self, id: ResourceId) {
        let Some(replica) = self.this.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(replica.fetch_with_retry(id));
            }
            Err(_) => warn!(resource = %id, "no async runtime; resource stays pending"),
        }
    }

    async fn fetch_with_retry(self: Arc<Self>, id: ResourceId) {
        let attempts = self.fetch.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            self.instruments.on_fetch();
            match self.source.fetch(id).await {
                Ok(Some(node)) => {
                    self.resolve(id, Read::Ready(Arc::new(node)));
                    return;
                }
                Ok(None) => {
                    self.resolve(id, Read::Absent);
                    return;
                }
                Err(err) => {
                    debug!(resource = %id, attempt, error = %err, "fetch failed");
                    last_error = err.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.fetch.backoff(attempt)).await;
                    }
                }
            }
        }

        warn!(resource = %id, attempts, error = %last_error, "giving up on resource");
        self.instruments.on_fetch_failure();
        self.resolve(
            id,
            Read::Failed(ReplicaFetchError {
                resource: id,
                attempts,
                message: last_error,
            }),
        );
    }

    /// Fill a pending slot with a fetch result and announce it.
    fn resolve(&self, id: ResourceId, read: Read) {
        let landed = read.node().cloned();

        let epoch = {
            let _commit = self.commit.lock();
            let next = self.epoch() + 1;
            match self.slots.get_mut(&id) {
                // Evicted, or overtaken by a delta while the fetch was running.
                Some(mut slot) if slot.read.is_pending() => {
                    slot.version = read.node().map(|node| node.version);
                    slot.read = read;
                    slot.changed_at = next;
                }
                _ => return,
            }
            self.epoch.store(next, Ordering::Release);
            next
        };

        trace!(resource = %id, epoch, "pending resource resolved");
        if let Some(node) = landed {
            if self.reachable.contains(&id) {
                self.expand(&node);
            }
        }
        let _ = self.changes.send(ChangeSet {
            epoch,
            changed: BTreeSet::from([id]),
        });
    }
}

impl std::fmt::Debug for TreeReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeReplica")
            .field("epoch", &self.epoch())
            .field("slots", &self.slots.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::MemorySource;
    use serde_json::json;
    use std::time::Duration;

    fn rid(raw: u64) -> ResourceId {
        ResourceId::new(raw)
    }

    fn replica_with(source: Arc<MemorySource>) -> Arc<TreeReplica> {
        let fetch = FetchConfig {
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 40,
        };
        TreeReplica::new(source, fetch, Instrumentation::disabled())
    }

    async fn wait_for_change(rx: &mut broadcast::Receiver<ChangeSet>) -> ChangeSet {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a change")
            .expect("change stream closed")
    }

    #[tokio::test]
    async fn apply_delta_bumps_epoch_and_reports_changes() {
        let replica = replica_with(MemorySource::new());
        assert_eq!(replica.epoch(), 0);

        let set = replica.apply_delta(
            Delta::new(rid(1))
                .upsert(TreeNode::collection(rid(1), 1, [("x", rid(2))]))
                .upsert(TreeNode::value(rid(2), 1, json!(1))),
        );

        assert_eq!(set.epoch, 1);
        assert_eq!(set.changed, BTreeSet::from([rid(1), rid(2)]));
        assert_eq!(replica.epoch(), 1);
        assert_eq!(replica.changed_at(rid(2)), Some(1));
        assert!(replica.changed_since(rid(2), 0));
        assert!(!replica.changed_since(rid(2), 1));
    }

    #[tokio::test]
    async fn stale_records_are_ignored() {
        let replica = replica_with(MemorySource::new());
        replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 5, json!("new"))));

        let set = replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 4, json!("old"))));

        assert!(set.changed.is_empty());
        assert_eq!(set.epoch, 2);
        let node = replica.read(rid(1)).node().cloned().unwrap();
        assert_eq!(node.payload, json!("new"));
    }

    #[tokio::test]
    async fn removal_leaves_an_absent_slot() {
        let replica = replica_with(MemorySource::new());
        replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 1, json!(1))));
        let set = replica.apply_delta(Delta::new(rid(1)).remove(rid(1), 2));

        assert_eq!(set.changed, BTreeSet::from([rid(1)]));
        assert!(matches!(replica.read(rid(1)), Read::Absent));
    }

    #[tokio::test]
    async fn removals_fence_off_older_upserts() {
        let replica = replica_with(MemorySource::new());
        replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 1, json!("v1"))));
        replica.apply_delta(Delta::new(rid(1)).remove(rid(1), 4));

        let set = replica.apply_delta(
            Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 3, json!("v3-stale"))),
        );
        assert!(set.changed.is_empty());
        assert!(matches!(replica.read(rid(1)), Read::Absent));

        let set = replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 5, json!("v5"))));
        assert_eq!(set.changed, BTreeSet::from([rid(1)]));
        assert_eq!(replica.read(rid(1)).node().map(|n| n.version), Some(5));
    }

    #[tokio::test]
    async fn unknown_reads_are_fetched() {
        let source = MemorySource::new();
        source.insert(TreeNode::value(rid(7), 3, json!(42)));
        let replica = replica_with(source.clone());
        let mut changes = replica.subscribe();

        assert!(replica.read(rid(7)).is_pending());
        let set = wait_for_change(&mut changes).await;

        assert_eq!(set.changed, BTreeSet::from([rid(7)]));
        let node = replica.read(rid(7)).node().cloned().unwrap();
        assert_eq!(node.payload, json!(42));
        assert_eq!(source.fetch_count(rid(7)), 1);
    }

    #[tokio::test]
    async fn missing_resources_resolve_absent() {
        let replica = replica_with(MemorySource::new());
        let mut changes = replica.subscribe();

        assert!(replica.read(rid(3)).is_pending());
        wait_for_change(&mut changes).await;
        assert!(matches!(replica.read(rid(3)), Read::Absent));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_retries_then_fails() {
        let source = MemorySource::new();
        source.insert(TreeNode::value(rid(5), 1, json!(1)));
        source.fail_next(rid(5), 10);
        let replica = replica_with(source.clone());
        let mut changes = replica.subscribe();

        replica.read(rid(5));
        wait_for_change(&mut changes).await;

        match replica.read(rid(5)) {
            Read::Failed(err) => {
                assert_eq!(err.resource, rid(5));
                assert_eq!(err.attempts, 3);
            }
            other => panic!("expected a failed read, got {other:?}"),
        }
        assert_eq!(source.fetch_count(rid(5)), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_recovers_within_retry_budget() {
        let source = MemorySource::new();
        source.insert(TreeNode::value(rid(5), 1, json!("ok")));
        source.fail_next(rid(5), 2);
        let replica = replica_with(source.clone());
        let mut changes = replica.subscribe();

        replica.read(rid(5));
        wait_for_change(&mut changes).await;

        assert!(replica.read(rid(5)).node().is_some());
        assert_eq!(source.fetch_count(rid(5)), 3);
    }

    #[tokio::test]
    async fn roots_pull_in_their_children() {
        let source = MemorySource::new();
        source.insert(TreeNode::collection(rid(1), 1, [("a", rid(2)), ("b", rid(3))]));
        source.insert(TreeNode::value(rid(2), 1, json!("a")));
        source.insert(TreeNode::value(rid(3), 1, json!("b")));
        let replica = replica_with(source);
        let mut changes = replica.subscribe();

        replica.register_root(rid(1));

        let mut seen = BTreeSet::new();
        while seen.len() < 3 {
            seen.extend(wait_for_change(&mut changes).await.changed);
        }
        assert_eq!(replica.nodes().len(), 3);
    }

    #[tokio::test]
    async fn deactivation_evicts_unrooted_resources() {
        let source = MemorySource::new();
        let replica = replica_with(source.clone());
        replica.apply_delta(Delta::new(rid(1)).upsert(TreeNode::value(rid(1), 1, json!(1))));

        replica.activate(rid(1));
        assert!(source.is_subscribed(rid(1)));

        replica.deactivate(rid(1));
        assert!(!source.is_subscribed(rid(1)));
        assert!(!replica.contains(rid(1)));
    }
}
