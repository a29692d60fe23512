//! Value Trees
//!
//! [`Tree`] is the value type for computables whose result is a nested
//! structure that may point at other computables. A handle-valued result is
//! cheap to produce and lets consumers resolve only what they need;
//! [`Computable::get_full_value`](crate::reactive::Computable::get_full_value)
//! resolves the references eagerly when a complete snapshot is required.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::graph::NodeId;

use super::Computable;

/// A nested value whose leaves may reference other computables.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Tree {
    Leaf(Value),
    List(Vec<Tree>),
    Map(BTreeMap<String, Tree>),
    /// A reference to another computable producing a `Tree`.
    Node(NodeId),
}

impl Tree {
    /// Reference another computable.
    pub fn node(computable: &Computable<Tree>) -> Self {
        Tree::Node(computable.id())
    }

    pub fn leaf(value: impl Into<Value>) -> Self {
        Tree::Leaf(value.into())
    }

    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Tree)>,
    {
        Tree::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// True if no node references remain.
    pub fn is_resolved(&self) -> bool {
        match self {
            Tree::Leaf(_) => true,
            Tree::List(items) => items.iter().all(Tree::is_resolved),
            Tree::Map(entries) => entries.values().all(Tree::is_resolved),
            Tree::Node(_) => false,
        }
    }

    /// Convert a fully resolved tree into plain JSON. Remaining node
    /// references become `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Tree::Leaf(value) => value.clone(),
            Tree::List(items) => Value::Array(items.iter().map(Tree::to_json).collect()),
            Tree::Map(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Tree::Node(_) => Value::Null,
        }
    }
}

impl From<Value> for Tree {
    fn from(value: Value) -> Self {
        Tree::Leaf(value)
    }
}
