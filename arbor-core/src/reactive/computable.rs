//! Computable Nodes
//!
//! A computable wraps a pure derivation over replica reads and other
//! computables and caches its latest result as `{value, epoch, status}`.
//!
//! # Status
//!
//! ```text
//! Pending  -> Stable | Unstable | Errored
//! Stable   -> Unstable   (a dependency changed)
//! Unstable -> Pending    (recomputation started)
//! Errored  -> Unstable   (a fresh dependency change)
//! ```
//!
//! A result computed from incomplete data (a pending read, an unsettled
//! upstream, or an epoch the quiescence policy has not released yet) is stored
//! as `Unstable` together with a marker naming the reason. Only `Stable` and
//! `Errored` resolve waiters.
//!
//! # Revalidation
//!
//! An `Unstable` node whose reads and upstream versions are unchanged since its
//! last run is promoted back to its previous settled state without running the
//! derivation again. Recomputing a stable node with no dependency change is a
//! no-op that keeps it `Stable`.
//!
//! # Waiters
//!
//! Waiters are an ordered map of one-shot senders. Resolving a node drains the
//! map under the state lock, so every waiter is notified exactly once. A waiter
//! that gives up (cancelled or dropped) removes its own entry on the way out.

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace};

use crate::error::{ComputableError, DerivationError, DeriveError};
use crate::graph::{NodeId, NodeStatus};
use crate::instrument::Instrumentation;
use crate::sync::{AbortSignal, CallersCounter};
use crate::tree::ResourceId;

use super::context::{DeriveCtx, UpstreamRead};
use super::runtime::GraphInner;
use super::value::Tree;

/// Values a computable can hold.
///
/// `PartialEq` lets a recomputation that produces an equal value leave
/// dependents untouched.
pub trait ComputableValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> ComputableValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

pub(crate) type DeriveFn<T> = dyn Fn(&mut DeriveCtx<'_>) -> Result<T, DeriveError> + Send + Sync;

/// Why a result is not stable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Marker {
    Pending(ResourceId),
    Upstream(String),
    Settling,
    Custom(String),
}

impl Marker {
    /// Markers that can clear without rerunning the derivation.
    fn revalidates(&self) -> bool {
        matches!(self, Marker::Upstream(_) | Marker::Settling)
    }

    /// Markers meaning the derivation saw incomplete inputs.
    fn incomplete(&self) -> bool {
        matches!(self, Marker::Pending(_) | Marker::Upstream(_))
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Marker::Pending(id) => write!(f, "pending:{id}"),
            Marker::Upstream(key) => write!(f, "upstream:{key}"),
            Marker::Settling => f.write_str("settling"),
            Marker::Custom(marker) => f.write_str(marker),
        }
    }
}

/// Non-blocking view of a computable's cached state.
#[derive(Debug, Clone)]
pub struct ValueSnapshot<T> {
    /// The last computed value, if the last run succeeded.
    pub value: Option<T>,
    pub status: NodeStatus,
    /// Replica epoch the value was computed at.
    pub epoch: u64,
    /// Changes whenever the node stores a result or changes status.
    pub tag: u64,
    /// Why the value is not stable, if it isn't.
    pub unstable_marker: Option<String>,
    pub error: Option<DerivationError>,
}

/// What a recomputation did, for the driver.
#[derive(Debug, Default)]
pub(crate) struct Recompute {
    /// The value changed or the node settled; dependents may need a look.
    pub changed: bool,
    /// The derivation saw a torn read and must run again.
    pub requeue: bool,
    /// The result is waiting for the quiescence policy.
    pub settling: bool,
    /// Resources and upstream nodes read, if the derivation ran.
    pub edges: Option<(HashSet<ResourceId>, HashSet<NodeId>)>,
}

/// Type-erased view of a cell used by the runtime.
pub(crate) trait ErasedCell: Send + Sync + 'static {
    fn id(&self) -> NodeId;
    fn key(&self) -> &str;
    fn status(&self) -> NodeStatus;
    fn version(&self) -> u64;
    fn invalidate(&self);
    fn recompute(&self, graph: &GraphInner) -> Recompute;
    fn release(&self);
    fn add_caller(&self, caller: String) -> bool;
    /// True if removing `caller` emptied a non-empty caller set.
    fn remove_caller(&self, caller: &str) -> bool;
}

struct Deps {
    reads: Vec<ResourceId>,
    upstream: Vec<UpstreamRead>,
}

struct CellState<T> {
    value: Option<T>,
    error: Option<DerivationError>,
    status: NodeStatus,
    epoch: u64,
    tag: u64,
    marker: Option<Marker>,
    deps: Option<Deps>,
    waiters: IndexMap<u64, oneshot::Sender<Result<T, ComputableError>>>,
    next_waiter: u64,
    released: bool,
}

/// Storage behind a [`Computable`] handle.
pub(crate) struct Cell<T> {
    id: NodeId,
    key: String,
    derive: Box<DeriveFn<T>>,
    state: Mutex<CellState<T>>,
    /// Bumped whenever the stored result changes.
    version: AtomicU64,
    tags: watch::Sender<u64>,
    callers: Mutex<CallersCounter>,
    instruments: Arc<Instrumentation>,
}

impl<T: ComputableValue> Cell<T> {
    pub(crate) fn new(
        key: String,
        derive: Box<DeriveFn<T>>,
        instruments: Arc<Instrumentation>,
    ) -> Self {
        let (tags, _) = watch::channel(0);
        Self {
            id: NodeId::new(),
            key,
            derive,
            state: Mutex::new(CellState {
                value: None,
                error: None,
                status: NodeStatus::Pending,
                epoch: 0,
                tag: 0,
                marker: None,
                deps: None,
                waiters: IndexMap::new(),
                next_waiter: 0,
                released: false,
            }),
            version: AtomicU64::new(0),
            tags,
            callers: Mutex::new(CallersCounter::new()),
            instruments,
        }
    }

    /// Value, status, error and released flag, for a downstream read.
    pub(crate) fn peek(&self) -> (Option<T>, NodeStatus, Option<DerivationError>, bool) {
        let state = self.state.lock();
        (
            state.value.clone(),
            state.status,
            state.error.clone(),
            state.released,
        )
    }

    fn set_status(&self, state: &mut CellState<T>, to: NodeStatus) {
        let from = state.status;
        state.status = to;
        state.tag += 1;
        self.tags.send_replace(state.tag);
        if self.instruments.reports_status() {
            let marker = state.marker.as_ref().map(ToString::to_string);
            self.instruments
                .on_status(self.id, &self.key, from, to, marker.as_deref());
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    fn wake(state: &mut CellState<T>, result: Result<T, ComputableError>) {
        for (_, waiter) in state.waiters.drain(..) {
            // The receiver may have been dropped by a cancelled caller.
            let _ = waiter.send(result.clone());
        }
    }

    /// True if anything the last run read has changed since.
    fn deps_changed(&self, state: &CellState<T>, graph: &GraphInner) -> bool {
        let Some(deps) = &state.deps else {
            return true;
        };
        deps.reads
            .iter()
            .any(|id| graph.replica.changed_since(*id, state.epoch))
            || deps.upstream.iter().any(|read| {
                read.cell
                    .upgrade()
                    .map_or(true, |cell| cell.version() != read.version)
            })
    }

    fn upstream_stable(state: &CellState<T>) -> bool {
        state.deps.as_ref().is_some_and(|deps| {
            deps.upstream.iter().all(|read| {
                read.cell
                    .upgrade()
                    .is_some_and(|cell| cell.status() == NodeStatus::Stable)
            })
        })
    }

    /// Try to settle an unstable node without running the derivation.
    fn revalidate(&self, state: &mut CellState<T>, graph: &GraphInner) -> Option<Recompute> {
        if state.marker.as_ref().is_some_and(|m| !m.revalidates()) {
            return None;
        }
        if !Self::upstream_stable(state) {
            return None;
        }
        if !graph.quiescence.is_quiescent(state.epoch) {
            state.marker = Some(Marker::Settling);
            return Some(Recompute {
                settling: true,
                ..Recompute::default()
            });
        }

        let result = match (&state.error, &state.value) {
            (Some(error), _) => Err(ComputableError::from(error.clone())),
            (None, Some(value)) => Ok(value.clone()),
            (None, None) => return None,
        };
        state.marker = None;
        let status = if result.is_ok() {
            NodeStatus::Stable
        } else {
            NodeStatus::Errored
        };
        self.set_status(state, status);
        Self::wake(state, result);
        trace!(node = %self.id, key = %self.key, ?status, "revalidated");
        Some(Recompute {
            changed: true,
            ..Recompute::default()
        })
    }

    fn run(&self, graph: &GraphInner) -> Recompute {
        let mut outcome = Recompute::default();

        let ticket = {
            let mut state = self.state.lock();
            if state.released {
                return outcome;
            }
            let dirty = self.deps_changed(&state, graph);
            match state.status {
                NodeStatus::Stable | NodeStatus::Errored if !dirty => return outcome,
                NodeStatus::Stable | NodeStatus::Errored => {
                    self.set_status(&mut state, NodeStatus::Unstable)
                }
                NodeStatus::Pending | NodeStatus::Unstable => {}
            }
            if !dirty {
                if let Some(outcome) = self.revalidate(&mut state, graph) {
                    return outcome;
                }
            }
            self.set_status(&mut state, NodeStatus::Pending);
            state.tag
        };

        let start_epoch = graph.replica.snapshot();
        graph
            .instruments
            .on_recalculation(self.id, &self.key, start_epoch);

        let mut ctx = DeriveCtx::new(graph, self.id, start_epoch);
        let result = catch_unwind(AssertUnwindSafe(|| (self.derive)(&mut ctx)))
            .unwrap_or_else(|panic| Err(DeriveError::Panicked(panic_message(panic))));
        let (reads, upstream, marker) = ctx.finish();

        outcome.edges = Some((
            reads.iter().copied().collect(),
            upstream.iter().map(|read| read.node).collect(),
        ));

        let mut state = self.state.lock();
        if state.released || state.tag != ticket {
            // Released or reset while the derivation ran.
            return outcome;
        }

        let torn = reads
            .iter()
            .any(|id| graph.replica.changed_since(*id, start_epoch));
        if torn {
            debug!(node = %self.id, key = %self.key, epoch = start_epoch, "torn read; requeueing");
            state.deps = None;
            self.set_status(&mut state, NodeStatus::Unstable);
            outcome.requeue = true;
            return outcome;
        }

        state.epoch = start_epoch;
        state.deps = Some(Deps {
            reads: reads.into_vec(),
            upstream: upstream.into_vec(),
        });

        match result {
            Ok(value) => {
                let marker = marker.or_else(|| {
                    (!graph.quiescence.is_quiescent(start_epoch)).then_some(Marker::Settling)
                });
                if state.error.is_some() || state.value.as_ref() != Some(&value) {
                    self.bump_version();
                    outcome.changed = true;
                }
                state.error = None;
                state.value = Some(value.clone());
                let settled = marker.is_none();
                outcome.settling = marker == Some(Marker::Settling);
                state.marker = marker;
                if settled {
                    self.set_status(&mut state, NodeStatus::Stable);
                    Self::wake(&mut state, Ok(value));
                    outcome.changed = true;
                } else {
                    self.set_status(&mut state, NodeStatus::Unstable);
                }
            }
            Err(cause) => {
                let error = DerivationError {
                    node: self.id,
                    key: self.key.clone(),
                    cause,
                };
                state.value = None;
                state.error = Some(error.clone());
                self.bump_version();
                outcome.changed = true;

                if marker.as_ref().is_some_and(Marker::incomplete) {
                    // Failed on incomplete inputs; retried once they land.
                    state.marker = marker;
                    self.set_status(&mut state, NodeStatus::Unstable);
                } else {
                    debug!(node = %self.id, key = %self.key, error = %error.cause, "derivation failed");
                    state.marker = None;
                    self.set_status(&mut state, NodeStatus::Errored);
                    Self::wake(&mut state, Err(error.into()));
                }
            }
        }

        outcome
    }
}

impl<T: ComputableValue> ErasedCell for Cell<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn status(&self) -> NodeStatus {
        self.state.lock().status
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn invalidate(&self) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        if matches!(state.status, NodeStatus::Stable | NodeStatus::Errored) {
            self.set_status(&mut state, NodeStatus::Unstable);
        }
    }

    fn recompute(&self, graph: &GraphInner) -> Recompute {
        self.run(graph)
    }

    fn release(&self) {
        let mut state = self.state.lock();
        if state.released {
            return;
        }
        state.released = true;
        state.deps = None;
        Self::wake(&mut state, Err(ComputableError::Released(self.id)));
        state.tag += 1;
        self.tags.send_replace(state.tag);
    }

    fn add_caller(&self, caller: String) -> bool {
        self.callers.lock().inc(caller)
    }

    fn remove_caller(&self, caller: &str) -> bool {
        let caller = caller.to_owned();
        let mut callers = self.callers.lock();
        let present = callers.contains(&caller);
        callers.dec(&caller) && present
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Removes a waiter's slot when its wait ends, however it ends.
struct WaiterSlot<'a, T> {
    cell: &'a Cell<T>,
    id: u64,
}

impl<T> Drop for WaiterSlot<'_, T> {
    fn drop(&mut self) {
        self.cell.state.lock().waiters.shift_remove(&self.id);
    }
}

/// Handle to a node of the computation graph.
///
/// Handles are cheap to clone. They do not keep the graph alive; once the
/// graph is dropped, waits resolve with [`ComputableError::Released`].
pub struct Computable<T> {
    cell: Arc<Cell<T>>,
    graph: Weak<GraphInner>,
}

impl<T> Clone for Computable<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            graph: self.graph.clone(),
        }
    }
}

impl<T> fmt::Debug for Computable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computable")
            .field("id", &self.cell.id)
            .field("key", &self.cell.key)
            .finish()
    }
}

impl<T: ComputableValue> Computable<T> {
    pub(crate) fn new(cell: Arc<Cell<T>>, graph: Weak<GraphInner>) -> Self {
        Self { cell, graph }
    }

    pub(crate) fn cell(&self) -> &Arc<Cell<T>> {
        &self.cell
    }

    pub fn id(&self) -> NodeId {
        self.cell.id
    }

    pub fn key(&self) -> &str {
        &self.cell.key
    }

    pub fn status(&self) -> NodeStatus {
        self.cell.state.lock().status
    }

    /// Current result tag.
    pub fn tag(&self) -> u64 {
        self.cell.state.lock().tag
    }

    pub fn is_released(&self) -> bool {
        self.cell.state.lock().released
    }

    /// Wait until the node holds a stable value.
    ///
    /// Resolves immediately if the node is `Stable` (or `Errored`). Otherwise
    /// the caller is queued until the node settles or `signal` fires. A fired
    /// signal resolves only this call; the node and other waiters are left
    /// alone.
    pub async fn await_stable_value(&self, signal: &AbortSignal) -> Result<T, ComputableError> {
        signal.check()?;

        let (id, rx) = {
            let mut state = self.cell.state.lock();
            if state.released {
                return Err(ComputableError::Released(self.cell.id));
            }
            match (&state.status, &state.value, &state.error) {
                (NodeStatus::Stable, Some(value), _) => return Ok(value.clone()),
                (NodeStatus::Errored, _, Some(error)) => return Err(error.clone().into()),
                _ => {}
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.insert(id, tx);
            (id, rx)
        };
        let _slot = WaiterSlot {
            cell: &self.cell,
            id,
        };

        tokio::select! {
            biased;
            reason = signal.fired() => Err(reason.into()),
            result = rx => result.unwrap_or_else(|_| Err(ComputableError::Released(self.cell.id))),
        }
    }

    /// Wait until the result tag differs from `since_tag` and return the new
    /// tag. Resolves immediately if it already differs.
    pub async fn await_change(
        &self,
        signal: &AbortSignal,
        since_tag: u64,
    ) -> Result<u64, ComputableError> {
        signal.check()?;
        let mut tags = self.cell.tags.subscribe();

        tokio::select! {
            biased;
            reason = signal.fired() => Err(reason.into()),
            changed = tags.wait_for(|tag| *tag != since_tag) => changed
                .map(|tag| *tag)
                .map_err(|_| ComputableError::Released(self.cell.id)),
        }
    }

    /// The cached state, without waiting.
    pub fn get_value_or_error(&self) -> ValueSnapshot<T> {
        let state = self.cell.state.lock();
        ValueSnapshot {
            value: state.value.clone(),
            status: state.status,
            epoch: state.epoch,
            tag: state.tag,
            unstable_marker: state.marker.as_ref().map(ToString::to_string),
            error: state.error.clone(),
        }
    }

    /// Drop the cached result and compute from scratch.
    ///
    /// Waiters stay queued and receive the fresh result.
    pub fn reset_state(&self) {
        {
            let mut state = self.cell.state.lock();
            if state.released {
                return;
            }
            state.value = None;
            state.error = None;
            state.marker = None;
            state.deps = None;
            self.cell.bump_version();
            self.cell.set_status(&mut state, NodeStatus::Pending);
        }
        debug!(node = %self.cell.id, key = %self.cell.key, "state reset");
        if let Some(graph) = self.graph.upgrade() {
            graph.schedule(self.cell.id);
        }
    }

    /// Register a caller. Returns `true` if this activated the node.
    pub fn subscribe(&self, caller: impl Into<String>) -> bool {
        self.cell.add_caller(caller.into())
    }

    /// Unregister a caller. Returns `true` if this was the last caller, in
    /// which case the node is destroyed and pending waiters are released.
    pub fn unsubscribe(&self, caller: &str) -> bool {
        let emptied = self.cell.remove_caller(caller);
        if emptied {
            match self.graph.upgrade() {
                Some(graph) => graph.release_node(self.cell.id),
                None => self.cell.release(),
            }
        }
        emptied
    }
}

impl Computable<Tree> {
    /// Wait for a stable value and resolve nested node references up to
    /// `depth` levels, applying the same stability contract to each of them.
    ///
    /// References deeper than `depth` are left in place.
    pub async fn get_full_value(
        &self,
        depth: usize,
        signal: &AbortSignal,
    ) -> Result<Tree, ComputableError> {
        let tree = self.await_stable_value(signal).await?;
        let graph = self
            .graph
            .upgrade()
            .ok_or(ComputableError::Released(self.cell.id))?;
        materialize(graph, tree, depth, signal.clone()).await
    }
}

fn materialize(
    graph: Arc<GraphInner>,
    tree: Tree,
    depth: usize,
    signal: AbortSignal,
) -> BoxFuture<'static, Result<Tree, ComputableError>> {
    async move {
        match tree {
            Tree::Node(id) if depth > 0 => {
                let cell = graph.cell::<Tree>(id)?;
                let child = Computable::new(cell, Arc::downgrade(&graph));
                let value = child.await_stable_value(&signal).await?;
                materialize(graph, value, depth - 1, signal).await
            }
            Tree::List(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(materialize(graph.clone(), item, depth, signal.clone()).await?);
                }
                Ok(Tree::List(resolved))
            }
            Tree::Map(entries) => {
                let mut resolved = std::collections::BTreeMap::new();
                for (key, item) in entries {
                    let item = materialize(graph.clone(), item, depth, signal.clone()).await?;
                    resolved.insert(key, item);
                }
                Ok(Tree::Map(resolved))
            }
            other => Ok(other),
        }
    }
    .boxed()
}
