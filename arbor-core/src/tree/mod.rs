//! Resource Tree
//!
//! The local side of the remote resource tree:
//!
//! - [`ResourceId`], [`TreeNode`] and [`Delta`]: the data model and the
//!   incremental change records the remote sends
//! - [`TreeReplica`]: the partial, versioned mirror that deltas are applied to
//! - [`ResourceSource`]: point fetches and subscriptions against the remote

mod replica;
mod resource;
mod source;

pub use replica::{ChangeSet, Read, TreeReplica};
pub use resource::{Change, Delta, DeltaRecord, ResourceId, ResourceKind, TreeNode};
pub use source::{MemorySource, ResourceSource};
