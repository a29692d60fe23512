//! Arbor Core
//!
//! This crate derives application state from a resource tree that lives on a
//! remote server and changes asynchronously and incrementally. It implements:
//!
//! - A local, partial, versioned replica of the remote tree
//! - Cached computations derived from the replica through pure functions
//! - Stability tracking that tells settled values from in-flight snapshots
//! - Cancellable waits that never leak queue slots or timers
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `tree`: Resource model, the replica, and the remote source interface
//! - `graph`: Dependency nodes and the update scheduler
//! - `reactive`: Computables, derivation contexts, and the graph runtime
//! - `sync`: Advisory locks, callers counters, single-flight dispatch, signals
//! - `instrument`: Debug taps on tree mutations and status transitions
//!
//! # Example
//!
//! ```rust,no_run
//! use arbor_core::config::GraphConfig;
//! use arbor_core::reactive::Graph;
//! use arbor_core::sync::AbortSignal;
//! use arbor_core::tree::{Delta, MemorySource, ResourceId, TreeNode};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = Graph::new(GraphConfig::default(), MemorySource::new())?;
//! let n1 = ResourceId::new(1);
//!
//! graph
//!     .apply_delta(Delta::new(n1).upsert(TreeNode::value(n1, 1, json!(1))))
//!     .await?;
//!
//! let doubled = graph.computable("double", move |ctx| {
//!     Ok(ctx.value::<i64>(n1)?.unwrap_or(0) * 2)
//! })?;
//!
//! assert_eq!(doubled.await_stable_value(&AbortSignal::never()).await?, 2);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod instrument;
pub mod reactive;
pub mod sync;
pub mod tree;

pub use error::{GraphError, Result};
