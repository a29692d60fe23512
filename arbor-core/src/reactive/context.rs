//! Derivation Context
//!
//! The context handed to a derivation function. Every read goes through it,
//! which is how the graph discovers dependencies: the resources and upstream
//! computables a derivation touches become its edges for the next change.
//!
//! Reads never block. A resource that is not in the replica yet comes back
//! as `None` and marks the result unstable; the replica fetches it in the
//! background and the node is recomputed once it lands.

use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use smallvec::SmallVec;

use crate::error::DeriveError;
use crate::graph::{NodeId, NodeStatus};
use crate::tree::{Read, ResourceId, TreeNode};

use super::computable::{ComputableValue, ErasedCell, Marker};
use super::runtime::GraphInner;
use super::Computable;

/// An upstream computable read during a derivation, with the version seen.
pub(crate) struct UpstreamRead {
    pub node: NodeId,
    pub cell: Weak<dyn ErasedCell>,
    pub version: u64,
}

/// Read access for one run of a derivation.
pub struct DeriveCtx<'a> {
    graph: &'a GraphInner,
    node: NodeId,
    epoch: u64,
    reads: SmallVec<[ResourceId; 8]>,
    upstream: SmallVec<[UpstreamRead; 4]>,
    marker: Option<Marker>,
}

impl<'a> DeriveCtx<'a> {
    pub(crate) fn new(graph: &'a GraphInner, node: NodeId, epoch: u64) -> Self {
        Self {
            graph,
            node,
            epoch,
            reads: SmallVec::new(),
            upstream: SmallVec::new(),
            marker: None,
        }
    }

    /// The node being computed.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// The replica epoch this run started at.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Read a resource.
    ///
    /// `Ok(None)` if the resource does not exist or is still being fetched.
    /// A fetch that exhausted its retries is an error.
    pub fn read(&mut self, id: ResourceId) -> Result<Option<Arc<TreeNode>>, DeriveError> {
        if !self.reads.contains(&id) {
            self.reads.push(id);
        }
        match self.graph.replica.read(id) {
            Read::Ready(node) => Ok(Some(node)),
            Read::Absent => Ok(None),
            Read::Pending => {
                self.mark(Marker::Pending(id));
                Ok(None)
            }
            Read::Failed(err) => Err(err.into()),
        }
    }

    /// Read the child `name` of a collection.
    pub fn field(
        &mut self,
        parent: ResourceId,
        name: &str,
    ) -> Result<Option<Arc<TreeNode>>, DeriveError> {
        let Some(node) = self.read(parent)? else {
            return Ok(None);
        };
        match node.child(name) {
            Some(child) => self.read(child),
            None => Ok(None),
        }
    }

    /// Read a resource and deserialize its payload.
    ///
    /// A resource of kind `Error` fails the derivation with its payload.
    pub fn value<V: DeserializeOwned>(&mut self, id: ResourceId) -> Result<Option<V>, DeriveError> {
        let Some(node) = self.read(id)? else {
            return Ok(None);
        };
        if node.is_error() {
            return Err(DeriveError::msg(format!(
                "resource {id} reported an error: {}",
                node.payload
            )));
        }
        serde_json::from_value(node.payload.clone())
            .map(Some)
            .map_err(|err| DeriveError::msg(format!("resource {id}: {err}")))
    }

    /// Read another computable's current value.
    ///
    /// An upstream that has not settled yields its latest value, if any, and
    /// marks this result unstable. An errored upstream fails this derivation.
    pub fn get<U: ComputableValue>(&mut self, upstream: &Computable<U>) -> Result<Option<U>, DeriveError> {
        let cell = upstream.cell();
        if !self.upstream.iter().any(|read| read.node == upstream.id()) {
            let erased: Arc<dyn ErasedCell> = cell.clone();
            self.upstream.push(UpstreamRead {
                node: upstream.id(),
                cell: Arc::downgrade(&erased),
                version: erased.version(),
            });
        }

        let (value, status, error, released) = cell.peek();
        if released {
            return Err(DeriveError::msg(format!(
                "upstream `{}` was released",
                upstream.key()
            )));
        }
        match status {
            NodeStatus::Stable => Ok(value),
            NodeStatus::Errored => {
                let cause = error
                    .map(|err| err.cause)
                    .unwrap_or_else(|| DeriveError::msg("unknown failure"));
                Err(DeriveError::Upstream {
                    key: upstream.key().to_owned(),
                    cause: Arc::new(cause),
                })
            }
            NodeStatus::Pending | NodeStatus::Unstable => {
                self.mark(Marker::Upstream(upstream.key().to_owned()));
                Ok(value)
            }
        }
    }

    /// Mark the result as unstable. The first marker of a run is kept.
    pub fn mark_unstable(&mut self, marker: impl Into<String>) {
        self.mark(Marker::Custom(marker.into()));
    }

    /// True if something already marked this result unstable.
    pub fn is_unstable(&self) -> bool {
        self.marker.is_some()
    }

    fn mark(&mut self, marker: Marker) {
        if self.marker.is_none() {
            self.marker = Some(marker);
        }
    }

    pub(crate) fn finish(
        self,
    ) -> (
        SmallVec<[ResourceId; 8]>,
        SmallVec<[UpstreamRead; 4]>,
        Option<Marker>,
    ) {
        (self.reads, self.upstream, self.marker)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::GraphConfig;
    use crate::error::ComputableError;
    use crate::reactive::Graph;
    use crate::sync::AbortSignal;
    use crate::tree::{Delta, MemorySource, ResourceId, TreeNode};
    use serde_json::json;
    use std::time::Duration;

    fn rid(raw: u64) -> ResourceId {
        ResourceId::new(raw)
    }

    #[tokio::test]
    async fn fields_resolve_through_collections() {
        let graph = Graph::new(GraphConfig::default(), MemorySource::new()).unwrap();
        graph
            .apply_delta(
                Delta::new(rid(1))
                    .upsert(TreeNode::collection(rid(1), 1, [("name", rid(2))]))
                    .upsert(TreeNode::value(rid(2), 1, json!("block"))),
            )
            .await
            .unwrap();

        let name = graph
            .computable("name", |ctx| {
                let node = ctx.field(rid(1), "name")?;
                Ok(node.map(|n| n.payload.clone()))
            })
            .unwrap();

        let value = name.await_stable_value(&AbortSignal::never()).await.unwrap();
        assert_eq!(value, Some(json!("block")));
    }

    #[tokio::test]
    async fn pending_reads_mark_the_result_unstable() {
        let source = MemorySource::new();
        source.insert(TreeNode::value(rid(9), 1, json!(4)));
        let graph = Graph::new(GraphConfig::default(), source).unwrap();

        let seen = graph
            .computable("cold", |ctx| Ok(ctx.value::<i64>(rid(9))?.unwrap_or(-1)))
            .unwrap();

        let value = seen
            .await_stable_value(&AbortSignal::timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn error_resources_fail_the_derivation() {
        let graph = Graph::new(GraphConfig::default(), MemorySource::new()).unwrap();
        let mut broken = TreeNode::value(rid(3), 1, json!("quota exceeded"));
        broken.kind = crate::tree::ResourceKind::Error;
        graph
            .apply_delta(Delta::new(rid(3)).upsert(broken))
            .await
            .unwrap();

        let node = graph
            .computable("broken", |ctx| Ok(ctx.value::<String>(rid(3))?))
            .unwrap();
        let err = node
            .await_stable_value(&AbortSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ComputableError::Derivation(_)));
    }
}
