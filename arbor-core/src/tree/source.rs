//! Remote Source
//!
//! The replica talks to the remote tree service through [`ResourceSource`]:
//! a point read for cold resources plus subscription notifications driven by
//! the callers counters. [`MemorySource`] is an in-process implementation for
//! tests and local tooling.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;

use crate::error::FetchError;
use crate::tree::{ResourceId, TreeNode};

/// Access to the remote tree service.
pub trait ResourceSource: Send + Sync + 'static {
    /// Fetch the current content of a resource. `Ok(None)` means the resource
    /// does not exist.
    fn fetch(&self, id: ResourceId) -> BoxFuture<'static, Result<Option<TreeNode>, FetchError>>;

    /// A resource gained its first reader; keep it updated.
    fn subscribe(&self, _id: ResourceId) {}

    /// A resource lost its last reader.
    fn unsubscribe(&self, _id: ResourceId) {}
}

/// In-memory resource source.
#[derive(Debug, Default)]
pub struct MemorySource {
    nodes: DashMap<ResourceId, TreeNode>,
    failures: DashMap<ResourceId, u32>,
    fetches: DashMap<ResourceId, u32>,
    subscribed: Mutex<HashSet<ResourceId>>,
}

impl MemorySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store a node, replacing any previous content.
    pub fn insert(&self, node: TreeNode) {
        self.nodes.insert(node.id, node);
    }

    pub fn remove(&self, id: ResourceId) {
        self.nodes.remove(&id);
    }

    /// Make the next `times` fetches of `id` fail.
    pub fn fail_next(&self, id: ResourceId, times: u32) {
        self.failures.insert(id, times);
    }

    /// How many times `id` was fetched.
    pub fn fetch_count(&self, id: ResourceId) -> u32 {
        self.fetches.get(&id).map(|count| *count).unwrap_or(0)
    }

    pub fn is_subscribed(&self, id: ResourceId) -> bool {
        self.subscribed.lock().contains(&id)
    }
}

impl ResourceSource for MemorySource {
    fn fetch(&self, id: ResourceId) -> BoxFuture<'static, Result<Option<TreeNode>, FetchError>> {
        *self.fetches.entry(id).or_insert(0) += 1;

        let failing = match self.failures.get_mut(&id) {
            Some(mut left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };
        let result = if failing {
            Err(FetchError::new(format!("injected failure for {id}")))
        } else {
            Ok(self.nodes.get(&id).map(|node| node.clone()))
        };

        async move { result }.boxed()
    }

    fn subscribe(&self, id: ResourceId) {
        self.subscribed.lock().insert(id);
    }

    fn unsubscribe(&self, id: ResourceId) {
        self.subscribed.lock().remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn fetch_returns_stored_nodes() {
        let source = MemorySource::new();
        let id = ResourceId::new(1);
        source.insert(TreeNode::value(id, 1, json!(3)));

        let node = source.fetch(id).await.unwrap().unwrap();
        assert_eq!(node.payload, json!(3));
        assert!(source.fetch(ResourceId::new(2)).await.unwrap().is_none());
        assert_eq!(source.fetch_count(id), 1);
    }

    #[tokio::test]
    async fn injected_failures_run_out() {
        let source = MemorySource::new();
        let id = ResourceId::new(1);
        source.insert(TreeNode::value(id, 1, json!(3)));
        source.fail_next(id, 2);

        assert!(source.fetch(id).await.is_err());
        assert!(source.fetch(id).await.is_err());
        assert!(source.fetch(id).await.is_ok());
    }
}
