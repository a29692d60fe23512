//! Graph Nodes
//!
//! This module defines the node records that live in the dependency graph.
//! A record holds only structure: which resources a computable read during
//! its last derivation, and which other computables it read or is read by.
//! Values and waiters live in the computable cell itself.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::tree::ResourceId;

/// Unique identifier for a node in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(u64);

impl NodeId {
    /// Generate a new unique node ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Status of a computable's cached result.
///
/// ```text
/// Pending -> Stable | Unstable | Errored
/// Stable  -> Unstable            (a dependency changed)
/// Unstable -> Pending            (recomputation started)
/// Errored -> Unstable            (a fresh dependency change)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NodeStatus {
    /// No usable result yet, or a recomputation is in progress.
    Pending,

    /// The value is current and the replica has settled for the epoch it was
    /// computed at.
    Stable,

    /// A dependency changed, or the last result was computed from incomplete
    /// or still-moving data.
    Unstable,

    /// The derivation failed. Not retried until a dependency changes.
    Errored,
}

impl NodeStatus {
    /// True for statuses that resolve waiters.
    pub fn is_settled(&self) -> bool {
        matches!(self, NodeStatus::Stable | NodeStatus::Errored)
    }
}

/// A node in the dependency graph.
#[derive(Debug)]
pub struct Node {
    /// Unique identifier for this node.
    id: NodeId,

    /// Derivation key the node was created for.
    key: String,

    /// Resources read during the last derivation.
    reads: HashSet<ResourceId>,

    /// Nodes that this node depends on (parents in the DAG).
    dependencies: HashSet<NodeId>,

    /// Nodes that depend on this node (children in the DAG).
    dependents: HashSet<NodeId>,
}

impl Node {
    pub fn new(id: NodeId, key: impl Into<String>) -> Self {
        Self {
            id,
            key: key.into(),
            reads: HashSet::new(),
            dependencies: HashSet::new(),
            dependents: HashSet::new(),
        }
    }

    /// Get the node's ID.
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn reads(&self) -> &HashSet<ResourceId> {
        &self.reads
    }

    /// Replace the read set, returning the previous one.
    pub fn replace_reads(&mut self, reads: HashSet<ResourceId>) -> HashSet<ResourceId> {
        std::mem::replace(&mut self.reads, reads)
    }

    /// Add a dependency (a node that this node reads from).
    pub fn add_dependency(&mut self, node_id: NodeId) {
        self.dependencies.insert(node_id);
    }

    /// Remove a dependency.
    pub fn remove_dependency(&mut self, node_id: NodeId) {
        self.dependencies.remove(&node_id);
    }

    /// Get all dependencies.
    pub fn dependencies(&self) -> &HashSet<NodeId> {
        &self.dependencies
    }

    /// Add a dependent (a node that reads from this node).
    pub fn add_dependent(&mut self, node_id: NodeId) {
        self.dependents.insert(node_id);
    }

    /// Remove a dependent.
    pub fn remove_dependent(&mut self, node_id: NodeId) {
        self.dependents.remove(&node_id);
    }

    /// Get all dependents.
    pub fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }
}
