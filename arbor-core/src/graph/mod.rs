//! Dependency Graph
//!
//! This module tracks which computables read which resources and which other
//! computables.
//!
//! # Overview
//!
//! The dependency graph is a directed acyclic graph (DAG) where:
//!
//! - Nodes represent computables, identified by [`NodeId`]
//! - Edges represent dependencies: if A reads B, there is an edge from B to A
//! - A reverse index maps every [`ResourceId`](crate::tree::ResourceId) to the
//!   nodes whose last derivation read it
//!
//! When the replica reports a set of changed resources, the scheduler maps
//! them to readers, walks the dependents, and returns the affected nodes in
//! topological order so that a dependency is always recomputed before any
//! node reading it.
//!
//! Edges are rediscovered on every recomputation. The scheduler reports which
//! resources gained their first reader or lost their last one so the replica
//! can subscribe to or evict them.

mod node;
mod scheduler;

pub use node::{Node, NodeId, NodeStatus};
pub use scheduler::{EdgeChanges, UpdateScheduler};
