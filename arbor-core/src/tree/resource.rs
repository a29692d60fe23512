//! Resource model: identifiers, tree nodes, and the deltas the remote tree
//! service sends.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identifier of a node in the remote resource tree.
///
/// Unique within a tree and stable for the lifetime of the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u64);

impl ResourceId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ResourceId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{:#x}", self.0)
    }
}

/// What a tree node holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A plain value in `payload`.
    Value,
    /// A container whose content is in `children`.
    Collection,
    /// The server reported an error for this resource; `payload` describes it.
    Error,
}

/// One node of the replicated tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: ResourceId,
    /// Increases on every server-visible mutation of this node.
    pub version: u64,
    pub kind: ResourceKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub children: BTreeMap<String, ResourceId>,
}

impl TreeNode {
    /// A value node without children.
    pub fn value(id: ResourceId, version: u64, payload: Value) -> Self {
        Self {
            id,
            version,
            kind: ResourceKind::Value,
            payload,
            children: BTreeMap::new(),
        }
    }

    /// A collection node with the given fields.
    pub fn collection<I, S>(id: ResourceId, version: u64, children: I) -> Self
    where
        I: IntoIterator<Item = (S, ResourceId)>,
        S: Into<String>,
    {
        Self {
            id,
            version,
            kind: ResourceKind::Collection,
            payload: Value::Null,
            children: children.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Look up a child by field name.
    pub fn child(&self, field: &str) -> Option<ResourceId> {
        self.children.get(field).copied()
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResourceKind::Error
    }
}

/// The new content of a node, or its removal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Change {
    Upsert {
        kind: ResourceKind,
        #[serde(default)]
        payload: Value,
        #[serde(default)]
        children: BTreeMap<String, ResourceId>,
    },
    Removed,
}

/// A single record of the remote delta feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub id: ResourceId,
    pub version: u64,
    pub change: Change,
}

impl DeltaRecord {
    /// Record replacing `node` with its new content.
    pub fn upsert(node: TreeNode) -> Self {
        Self {
            id: node.id,
            version: node.version,
            change: Change::Upsert {
                kind: node.kind,
                payload: node.payload,
                children: node.children,
            },
        }
    }

    pub fn removed(id: ResourceId, version: u64) -> Self {
        Self {
            id,
            version,
            change: Change::Removed,
        }
    }
}

/// A batch of changes under one subtree root, applied atomically per node.
///
/// Deltas sharing a root are serialized by the advisory lock keyed by that
/// root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub root: ResourceId,
    pub records: Vec<DeltaRecord>,
}

impl Delta {
    pub fn new(root: ResourceId) -> Self {
        Self {
            root,
            records: Vec::new(),
        }
    }

    /// Builder-style: add an upsert record.
    pub fn upsert(mut self, node: TreeNode) -> Self {
        self.records.push(DeltaRecord::upsert(node));
        self
    }

    /// Builder-style: add a removal record.
    pub fn remove(mut self, id: ResourceId, version: u64) -> Self {
        self.records.push(DeltaRecord::removed(id, version));
        self
    }

    /// Decode a MessagePack frame from the delta feed.
    pub fn decode(frame: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(frame)
    }

    /// Encode as a MessagePack frame.
    pub fn encode(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// The lock key for this delta's subtree.
    pub fn lock_key(&self) -> String {
        self.root.to_string()
    }
}
