//! Error types.
//!
//! Errors stay local to the node or waiter that triggered them. A failing
//! derivation is captured as a [`DerivationError`] on its own node and is
//! delivered to that node's waiters; it never reaches the driver task or
//! sibling nodes.

use std::sync::Arc;

use thiserror::Error;

use crate::graph::NodeId;
use crate::tree::ResourceId;

/// A caller-initiated abort or an expired deadline.
///
/// This is not a graph fault: the node that was being awaited keeps its state
/// and other waiters on the same node are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CancelError {
    /// The caller's cancellation token fired.
    #[error("operation aborted")]
    Aborted,

    /// The caller's deadline passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// What a derivation function reports when it cannot produce a value.
#[derive(Debug, Clone, Error)]
pub enum DeriveError {
    /// A user-level failure described by a message.
    #[error("{0}")]
    Message(String),

    /// A resource the derivation read could not be fetched from the remote.
    #[error(transparent)]
    Fetch(#[from] ReplicaFetchError),

    /// An upstream computable that this derivation read has failed.
    #[error("upstream `{key}` failed: {cause}")]
    Upstream {
        /// Key of the failed upstream node.
        key: String,
        /// The upstream failure.
        cause: Arc<DeriveError>,
    },

    /// The derivation panicked.
    #[error("derivation panicked: {0}")]
    Panicked(String),
}

impl DeriveError {
    /// Build a message error from anything printable.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Message(message.to_string())
    }
}

/// A derivation failure captured on a specific node.
#[derive(Debug, Clone, Error)]
#[error("derivation of `{key}` ({node}) failed: {cause}")]
pub struct DerivationError {
    /// The node whose derivation failed.
    pub node: NodeId,
    /// The node's derivation key.
    pub key: String,
    /// What went wrong.
    pub cause: DeriveError,
}

/// `release` was called without a matching held acquisition.
///
/// This is a programmer error on the caller's side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot release lock `{key}`: not acquired by this caller")]
pub struct LockMisuseError {
    /// The lock key.
    pub key: String,
}

/// A single failed attempt to fetch a resource from the remote tree service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct FetchError(pub String);

impl FetchError {
    /// Build a fetch error from anything printable.
    pub fn new(message: impl std::fmt::Display) -> Self {
        Self(message.to_string())
    }
}

/// Fetching a pending resource failed after all retries were used up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("fetching resource {resource} failed after {attempts} attempts: {message}")]
pub struct ReplicaFetchError {
    /// The resource that could not be fetched.
    pub resource: ResourceId,
    /// Number of attempts made.
    pub attempts: u32,
    /// The last error reported by the remote.
    pub message: String,
}

/// What callers awaiting a computable can observe.
#[derive(Debug, Clone, Error)]
pub enum ComputableError {
    /// The wait was cancelled by its signal.
    #[error(transparent)]
    Cancelled(#[from] CancelError),

    /// The node's derivation failed.
    #[error(transparent)]
    Derivation(#[from] DerivationError),

    /// The node was destroyed while the caller was waiting on it.
    #[error("computable {0} was released")]
    Released(NodeId),

    /// A nested node reference does not hold a value tree.
    #[error("node {0} does not produce a materializable value tree")]
    NotMaterializable(NodeId),
}

impl ComputableError {
    /// True if this error came from the caller's own cancellation signal.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ComputableError::Cancelled(_))
    }
}

/// Errors raised by the graph runtime itself.
#[derive(Debug, Error)]
pub enum GraphError {
    /// A computable with this key already exists with a different value type.
    #[error("computable `{key}` already exists with a different value type")]
    KeyTypeMismatch {
        /// The conflicting key.
        key: String,
    },

    /// A lock was released incorrectly.
    #[error(transparent)]
    Lock(#[from] LockMisuseError),

    /// A delta frame could not be decoded.
    #[error("failed to decode delta frame: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// The delta feed reported an error.
    #[error("delta feed failed: {0}")]
    Feed(String),

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// The graph was created outside a tokio runtime.
    #[error("a graph must be created inside a tokio runtime")]
    NoRuntime,
}

/// Convenience alias for graph-level results.
pub type Result<T, E = GraphError> = std::result::Result<T, E>;
