//! Graph Runtime
//!
//! The runtime connects the replica, the scheduler and the computable cells.
//!
//! # How It Works
//!
//! 1. A computable is created lazily on first request for its key and
//!    scheduled for its first run.
//!
//! 2. Every run records which resources and upstream computables the
//!    derivation read. The scheduler turns those reads into edges.
//!
//! 3. When a delta is applied, the affected nodes are invalidated before
//!    `apply_delta` returns, so no waiter can observe the old value as stable
//!    afterwards.
//!
//! 4. A driver task listens to the replica's change stream and to explicit
//!    scheduling requests, coalesces bursts over a short window, and
//!    recomputes the affected nodes in dependency order.
//!
//! # Ownership
//!
//! The graph owns its lock registry, scheduler and cells; nothing is global,
//! so independent graphs can live in one process. The driver only holds a
//! weak reference and stops once the graph is dropped.

use std::any::Any;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::config::GraphConfig;
use crate::error::{ComputableError, DeriveError, FetchError, GraphError, Result};
use crate::graph::{EdgeChanges, Node, NodeId, UpdateScheduler};
use crate::instrument::{InstrumentSnapshot, Instrumentation};
use crate::sync::AdvisoryLocks;
use crate::tree::{ChangeSet, Delta, ResourceId, ResourceSource, TreeReplica};

use super::computable::{Cell, Computable, ComputableValue, ErasedCell};
use super::context::DeriveCtx;
use super::quiescence::{AlwaysQuiescent, QuiescencePolicy};

/// Requests for the driver besides replica changes.
#[derive(Debug, Clone, Copy)]
enum Wake {
    Node(NodeId),
    All,
}

#[derive(Clone)]
struct CellEntry {
    erased: Arc<dyn ErasedCell>,
    any: Arc<dyn Any + Send + Sync>,
}

/// Work collected for one recomputation pass.
#[derive(Debug, Default)]
struct Batch {
    epoch: u64,
    changed: BTreeSet<ResourceId>,
    seeds: HashSet<NodeId>,
    all: bool,
}

impl Batch {
    fn add_changes(&mut self, set: ChangeSet) {
        self.epoch = self.epoch.max(set.epoch);
        self.changed.extend(set.changed);
    }

    fn add_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Node(id) => {
                self.seeds.insert(id);
            }
            Wake::All => self.all = true,
        }
    }

    fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.seeds.is_empty() && !self.all
    }
}

/// Point-in-time counters of a graph.
#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub epoch: u64,
    pub nodes: usize,
    /// Resources read by at least one node.
    pub watched_resources: usize,
    pub replica_slots: usize,
    pub locks: usize,
    pub instruments: InstrumentSnapshot,
}

pub(crate) struct GraphInner {
    config: GraphConfig,
    pub(crate) replica: Arc<TreeReplica>,
    scheduler: Mutex<UpdateScheduler>,
    cells: DashMap<NodeId, CellEntry>,
    keys: DashMap<String, NodeId>,
    locks: AdvisoryLocks,
    pub(crate) quiescence: Arc<dyn QuiescencePolicy>,
    pub(crate) instruments: Arc<Instrumentation>,
    wake: mpsc::UnboundedSender<Wake>,
}

impl GraphInner {
    pub(crate) fn schedule(&self, id: NodeId) {
        // The driver is gone only while the graph itself is being dropped.
        let _ = self.wake.send(Wake::Node(id));
    }

    fn erased(&self, id: NodeId) -> Option<Arc<dyn ErasedCell>> {
        self.cells.get(&id).map(|entry| Arc::clone(&entry.erased))
    }

    /// The typed cell for `id`.
    pub(crate) fn cell<T: ComputableValue>(
        &self,
        id: NodeId,
    ) -> std::result::Result<Arc<Cell<T>>, ComputableError> {
        let any = self
            .cells
            .get(&id)
            .map(|entry| Arc::clone(&entry.any))
            .ok_or(ComputableError::Released(id))?;
        any.downcast::<Cell<T>>()
            .map_err(|_| ComputableError::NotMaterializable(id))
    }

    /// Mark every node downstream of `changed` unstable.
    fn invalidate_readers(&self, changed: &BTreeSet<ResourceId>) {
        if changed.is_empty() {
            return;
        }
        let affected = self
            .scheduler
            .lock()
            .mark_changed(changed, std::iter::empty());
        for id in affected {
            if let Some(cell) = self.erased(id) {
                cell.invalidate();
            }
        }
    }

    /// Destroy a node: its waiters are released and its reads dropped.
    pub(crate) fn release_node(&self, id: NodeId) {
        let Some((_, entry)) = self.cells.remove(&id) else {
            return;
        };
        self.keys
            .remove_if(entry.erased.key(), |_, node| *node == id);
        entry.erased.release();
        let changes = self.scheduler.lock().remove_node(id);
        debug!(node = %id, key = entry.erased.key(), "computable released");
        self.apply_edges(id, changes);
    }

    fn apply_edges(&self, id: NodeId, changes: EdgeChanges) {
        for resource in changes.activated {
            self.replica.activate(resource);
        }
        for resource in changes.deactivated {
            self.replica.deactivate(resource);
        }

        let caller = id.to_string();
        for upstream in changes.linked {
            if let Some(cell) = self.erased(upstream) {
                cell.add_caller(caller.clone());
            }
        }
        for upstream in changes.unlinked {
            let emptied = self
                .erased(upstream)
                .is_some_and(|cell| cell.remove_caller(&caller));
            if emptied {
                self.release_node(upstream);
            }
        }
    }

    fn recheck_later(&self, id: NodeId) {
        let wake = self.wake.clone();
        let delay = self.config.settle_recheck();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = wake.send(Wake::Node(id));
        });
    }

    /// Recompute everything a batch affects, dependencies first.
    fn run_pass(&self, batch: Batch) {
        if batch.epoch > 0 {
            self.quiescence.on_epoch(batch.epoch);
        }

        let order = {
            let scheduler = self.scheduler.lock();
            if batch.all {
                scheduler.all_nodes()
            } else {
                scheduler.mark_changed(&batch.changed, batch.seeds.iter().copied())
            }
        };
        if order.is_empty() {
            return;
        }
        trace!(
            nodes = order.len(),
            changed = batch.changed.len(),
            all = batch.all,
            "recompute pass"
        );

        let planned: HashSet<NodeId> = order.iter().copied().collect();
        let mut processed = HashSet::with_capacity(order.len());
        let mut followups = Vec::new();

        for id in order {
            let Some(cell) = self.erased(id) else {
                continue;
            };
            processed.insert(id);

            let outcome = cell.recompute(self);
            if let Some((reads, upstream)) = outcome.edges {
                let changes = self.scheduler.lock().set_reads(id, reads, upstream);
                self.apply_edges(id, changes);
            }
            if outcome.requeue {
                followups.push(id);
            }
            if outcome.settling && self.quiescence.rechecks_settling() {
                self.recheck_later(id);
            }
            if outcome.changed {
                let dependents: Vec<NodeId> = self
                    .scheduler
                    .lock()
                    .get_node(id)
                    .map(|node| node.dependents().iter().copied().collect())
                    .unwrap_or_default();
                followups.extend(
                    dependents
                        .into_iter()
                        .filter(|dep| processed.contains(dep) || !planned.contains(dep)),
                );
            }
        }

        for id in followups {
            self.schedule(id);
        }
    }
}

impl Drop for GraphInner {
    fn drop(&mut self) {
        for entry in self.cells.iter() {
            entry.erased.release();
        }
    }
}

/// Drives recomputation from replica changes and scheduling requests.
async fn drive(
    graph: Weak<GraphInner>,
    mut changes: broadcast::Receiver<ChangeSet>,
    mut wakes: mpsc::UnboundedReceiver<Wake>,
    window: Duration,
) {
    loop {
        let mut batch = Batch::default();
        tokio::select! {
            change = changes.recv() => match change {
                Ok(set) => batch.add_changes(set),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "change stream lagged; rechecking every node");
                    batch.all = true;
                }
                Err(RecvError::Closed) => break,
            },
            wake = wakes.recv() => match wake {
                Some(wake) => batch.add_wake(wake),
                None => break,
            },
        }

        if !window.is_zero() {
            tokio::time::sleep(window).await;
        }
        loop {
            match changes.try_recv() {
                Ok(set) => batch.add_changes(set),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "change stream lagged; rechecking every node");
                    batch.all = true;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        while let Ok(wake) = wakes.try_recv() {
            batch.add_wake(wake);
        }
        if batch.is_empty() {
            continue;
        }

        let Some(graph) = graph.upgrade() else {
            break;
        };
        graph.run_pass(batch);
    }
    debug!("graph driver stopped");
}

/// A reactive computation graph over a replicated resource tree.
///
/// Cloning a `Graph` is cheap and yields another handle to the same graph.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Create a graph whose results are stable as soon as they are computed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: GraphConfig, source: Arc<dyn ResourceSource>) -> Result<Self> {
        Self::with_policy(config, source, Arc::new(AlwaysQuiescent))
    }

    /// Create a graph with an explicit quiescence policy.
    pub fn with_policy(
        config: GraphConfig,
        source: Arc<dyn ResourceSource>,
        quiescence: Arc<dyn QuiescencePolicy>,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GraphError::NoRuntime)?;

        let instruments = Instrumentation::new(config.debug.clone());
        let replica = TreeReplica::new(source, config.fetch.clone(), Arc::clone(&instruments));
        let changes = replica.subscribe();
        let (wake, wakes) = mpsc::unbounded_channel();
        let window = config.coalesce_window();

        let inner = Arc::new(GraphInner {
            config,
            replica,
            scheduler: Mutex::new(UpdateScheduler::new()),
            cells: DashMap::new(),
            keys: DashMap::new(),
            locks: AdvisoryLocks::new(),
            quiescence,
            instruments,
            wake,
        });
        runtime.spawn(drive(Arc::downgrade(&inner), changes, wakes, window));
        debug!(?window, "graph started");

        Ok(Self { inner })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn replica(&self) -> &Arc<TreeReplica> {
        &self.inner.replica
    }

    /// The keyed lock registry mutations of this graph are serialized by.
    pub fn locks(&self) -> &AdvisoryLocks {
        &self.inner.locks
    }

    /// Get the computable for `key`, creating it with `derive` on first
    /// request.
    ///
    /// `derive` is ignored if the key already exists. Requesting an existing
    /// key with a different value type fails.
    pub fn computable<T, F>(&self, key: impl Into<String>, derive: F) -> Result<Computable<T>>
    where
        T: ComputableValue,
        F: Fn(&mut DeriveCtx<'_>) -> std::result::Result<T, DeriveError> + Send + Sync + 'static,
    {
        let key = key.into();
        let inner = &self.inner;

        let id = match inner.keys.entry(key.clone()) {
            Entry::Occupied(entry) => *entry.get(),
            Entry::Vacant(entry) => {
                let cell = Arc::new(Cell::new(
                    key.clone(),
                    Box::new(derive),
                    Arc::clone(&inner.instruments),
                ));
                let id = cell.id();
                inner.scheduler.lock().add_node(Node::new(id, key.as_str()));
                inner.cells.insert(
                    id,
                    CellEntry {
                        erased: cell.clone(),
                        any: cell.clone(),
                    },
                );
                entry.insert(id);
                debug!(node = %id, key = %key, "computable created");
                inner.schedule(id);
                return Ok(Computable::new(cell, Arc::downgrade(inner)));
            }
        };

        match inner.cell::<T>(id) {
            Ok(cell) => Ok(Computable::new(cell, Arc::downgrade(inner))),
            Err(ComputableError::Released(_)) => {
                // Released between the key lookup and now; start over.
                inner.keys.remove_if(&key, |_, node| *node == id);
                self.computable(key, derive)
            }
            Err(_) => Err(GraphError::KeyTypeMismatch { key }),
        }
    }

    /// Like [`computable`](Self::computable), and register `caller` on it.
    pub fn observe<T, F>(
        &self,
        key: impl Into<String>,
        caller: impl Into<String>,
        derive: F,
    ) -> Result<Computable<T>>
    where
        T: ComputableValue,
        F: Fn(&mut DeriveCtx<'_>) -> std::result::Result<T, DeriveError> + Send + Sync + 'static,
    {
        let computable = self.computable(key, derive)?;
        computable.subscribe(caller);
        Ok(computable)
    }

    /// Merge a delta into the replica.
    ///
    /// Serialized with other deltas for the same root. Every node downstream
    /// of a changed resource is unstable by the time this returns.
    pub async fn apply_delta(&self, delta: Delta) -> Result<ChangeSet> {
        let key = delta.lock_key();
        let inner = &self.inner;
        let set = inner
            .locks
            .with_lock(&key, async {
                let set = inner.replica.apply_delta(delta);
                inner.quiescence.on_epoch(set.epoch);
                inner.invalidate_readers(&set.changed);
                set
            })
            .await?;
        Ok(set)
    }

    /// Apply every delta of a feed in order. Returns how many were applied.
    pub async fn follow<S>(&self, deltas: S) -> Result<u64>
    where
        S: Stream<Item = std::result::Result<Delta, FetchError>>,
    {
        let mut deltas = std::pin::pin!(deltas);
        let mut applied = 0;
        while let Some(delta) = deltas.next().await {
            let delta = delta.map_err(|err| GraphError::Feed(err.to_string()))?;
            self.apply_delta(delta).await?;
            applied += 1;
        }
        debug!(applied, "delta feed ended");
        Ok(applied)
    }

    /// Apply a feed of MessagePack-encoded deltas.
    pub async fn follow_frames<S, B>(&self, frames: S) -> Result<u64>
    where
        S: Stream<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut frames = std::pin::pin!(frames);
        let mut applied = 0;
        while let Some(frame) = frames.next().await {
            let delta = Delta::decode(frame.as_ref())?;
            self.apply_delta(delta).await?;
            applied += 1;
        }
        debug!(applied, "frame feed ended");
        Ok(applied)
    }

    /// Keep everything reachable from `root` present in the replica.
    pub fn register_root(&self, root: ResourceId) {
        self.inner.replica.register_root(root);
    }

    /// The remote reported that every mutation up to `epoch` has landed.
    pub fn signal_quiescence(&self, epoch: u64) {
        self.inner.quiescence.on_wave_complete(epoch);
        let _ = self.inner.wake.send(Wake::All);
    }

    pub fn node_count(&self) -> usize {
        self.inner.cells.len()
    }

    pub fn stats(&self) -> GraphStats {
        let (nodes, watched_resources) = {
            let scheduler = self.inner.scheduler.lock();
            (scheduler.node_count(), scheduler.resource_count())
        };
        GraphStats {
            epoch: self.inner.replica.epoch(),
            nodes,
            watched_resources,
            replica_slots: self.inner.replica.len(),
            locks: self.inner.locks.len(),
            instruments: self.inner.instruments.snapshot(),
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.inner.cells.len())
            .field("replica", &self.inner.replica)
            .finish()
    }
}
