//! Reactive Computations
//!
//! This module implements the computation layer over the replicated tree.
//!
//! # Concepts
//!
//! ## Computables
//!
//! A [`Computable`] caches the result of a pure derivation function. The
//! derivation reads resources from the replica and values of other
//! computables through a [`DeriveCtx`], which records every read as a
//! dependency edge.
//!
//! ## Stability
//!
//! A result is `Stable` once it was computed from complete inputs at an epoch
//! the [`QuiescencePolicy`] considers settled. Callers that need a settled
//! value wait with [`Computable::await_stable_value`]; every wait takes an
//! [`AbortSignal`](crate::sync::AbortSignal).
//!
//! ## The graph
//!
//! A [`Graph`] owns the replica, the scheduler and the cells, and runs the
//! driver task that turns tree changes into recomputation passes.

mod computable;
mod context;
mod quiescence;
mod runtime;
mod value;

pub use computable::{Computable, ComputableValue, ValueSnapshot};
pub use context::DeriveCtx;
pub use quiescence::{AlwaysQuiescent, ExplicitCompletion, QuiescencePolicy, SettleWindow};
pub use runtime::{Graph, GraphStats};
pub use value::Tree;
