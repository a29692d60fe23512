//! Update Scheduler
//!
//! The scheduler determines the order in which affected computables should be
//! recomputed. It ensures that dependencies are always updated before their
//! dependents.
//!
//! # Algorithm
//!
//! 1. A reverse index maps each resource to the computables that read it
//!    during their last derivation. The index is rebuilt for a node every time
//!    it recomputes, so edges are discovered, not declared.
//! 2. When resources change, look up their direct readers.
//! 3. Propagate to dependents, recursively (BFS).
//! 4. Sort the collected nodes topologically (Kahn's algorithm, counting only
//!    edges inside the collected set).
//!
//! The reverse index doubles as the subscription gate: each resource entry is
//! a [`CallersCounter`] of reader nodes, and the transitions of that counter
//! decide when the resource is subscribed to or evicted from the replica.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::warn;

use super::node::{Node, NodeId};
use crate::sync::CallersCounter;
use crate::tree::ResourceId;

/// Edge changes produced by [`UpdateScheduler::set_reads`] or
/// [`UpdateScheduler::remove_node`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EdgeChanges {
    /// Resources that gained their first reader.
    pub activated: Vec<ResourceId>,
    /// Resources that lost their last reader.
    pub deactivated: Vec<ResourceId>,
    /// Upstream nodes that gained this node as a dependent.
    pub linked: Vec<NodeId>,
    /// Upstream nodes that lost this node as a dependent.
    pub unlinked: Vec<NodeId>,
}

/// The update scheduler manages the dependency graph and coordinates updates.
#[derive(Debug, Default)]
pub struct UpdateScheduler {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    /// Readers of each resource.
    readers: HashMap<ResourceId, CallersCounter<NodeId>>,
}

impl UpdateScheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges and resource reads involving this node.
    pub fn remove_node(&mut self, node_id: NodeId) -> EdgeChanges {
        let mut changes = EdgeChanges::default();
        let Some(mut node) = self.nodes.remove(&node_id) else {
            return changes;
        };

        for resource in node.replace_reads(HashSet::new()) {
            if self.drop_reader(resource, node_id) {
                changes.deactivated.push(resource);
            }
        }

        // Remove this node from its dependencies' dependent lists
        for dep_id in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
            changes.unlinked.push(*dep_id);
        }

        // Remove this node from its dependents' dependency lists
        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        changes
    }

    /// Get a reference to a node.
    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    ///
    /// This means when `dependency` changes, `dependent` may need to update.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Remove a dependency edge.
    pub fn remove_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.remove_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.remove_dependency(dependency);
        }
    }

    /// Record what a node read during its latest derivation.
    ///
    /// Replaces the node's previous read set and upstream edges and reports
    /// the resulting activations and deactivations.
    pub fn set_reads(
        &mut self,
        node_id: NodeId,
        reads: HashSet<ResourceId>,
        upstream: HashSet<NodeId>,
    ) -> EdgeChanges {
        let mut changes = EdgeChanges::default();
        let (old_reads, old_upstream) = match self.nodes.get_mut(&node_id) {
            Some(node) => (
                node.replace_reads(reads.clone()),
                node.dependencies().clone(),
            ),
            None => return changes,
        };

        for resource in reads.difference(&old_reads) {
            let counter = self.readers.entry(*resource).or_default();
            if counter.inc(node_id) {
                changes.activated.push(*resource);
            }
        }
        for resource in old_reads.difference(&reads) {
            if self.drop_reader(*resource, node_id) {
                changes.deactivated.push(*resource);
            }
        }

        for dependency in upstream.difference(&old_upstream) {
            self.add_edge(*dependency, node_id);
            changes.linked.push(*dependency);
        }
        for dependency in old_upstream.difference(&upstream) {
            self.remove_edge(*dependency, node_id);
            changes.unlinked.push(*dependency);
        }

        changes
    }

    /// Nodes that read `resource` during their last derivation.
    pub fn readers_of(&self, resource: ResourceId) -> Vec<NodeId> {
        self.readers
            .get(&resource)
            .map(|counter| counter.callers().copied().collect())
            .unwrap_or_default()
    }

    /// Collect every node affected by changes to `resources` or by a direct
    /// request to recompute `seeds`, in dependency order.
    pub fn mark_changed<'a>(
        &self,
        resources: impl IntoIterator<Item = &'a ResourceId>,
        seeds: impl IntoIterator<Item = NodeId>,
    ) -> Vec<NodeId> {
        let mut to_process = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<NodeId> = seeds.into_iter().collect();

        // Start with the direct readers of each changed resource
        for resource in resources {
            if let Some(counter) = self.readers.get(resource) {
                queue.extend(counter.callers().copied());
            }
        }

        // BFS to collect everything downstream
        while let Some(node_id) = queue.pop_front() {
            if !visited.insert(node_id) {
                continue;
            }

            if let Some(node) = self.nodes.get(&node_id) {
                to_process.push(node_id);
                queue.extend(node.dependents().iter().copied());
            }
        }

        // Sort topologically so dependencies are processed first
        self.topological_sort(to_process)
    }

    /// Every node currently in the graph, in dependency order.
    pub fn all_nodes(&self) -> Vec<NodeId> {
        self.topological_sort(self.nodes.keys().copied().collect())
    }

    /// Perform a topological sort of the given nodes.
    ///
    /// Returns nodes in order such that dependencies come before dependents.
    /// Nodes caught in a cycle are appended at the end.
    fn topological_sort(&self, nodes: Vec<NodeId>) -> Vec<NodeId> {
        let node_set: HashSet<_> = nodes.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
        let mut result = Vec::with_capacity(nodes.len());
        let mut queue = VecDeque::new();

        // Calculate in-degrees (only counting edges within the node set)
        for &node_id in &nodes {
            if let Some(node) = self.nodes.get(&node_id) {
                let degree = node
                    .dependencies()
                    .iter()
                    .filter(|d| node_set.contains(d))
                    .count();
                in_degree.insert(node_id, degree);
                if degree == 0 {
                    queue.push_back(node_id);
                }
            }
        }

        // Kahn's algorithm
        while let Some(node_id) = queue.pop_front() {
            result.push(node_id);

            if let Some(node) = self.nodes.get(&node_id) {
                for &dependent_id in node.dependents() {
                    if let Some(degree) = in_degree.get_mut(&dependent_id) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            queue.push_back(dependent_id);
                        }
                    }
                }
            }
        }

        if result.len() < in_degree.len() {
            let placed: HashSet<_> = result.iter().copied().collect();
            let cyclic: Vec<_> = nodes
                .into_iter()
                .filter(|id| in_degree.contains_key(id) && !placed.contains(id))
                .collect();
            warn!(count = cyclic.len(), "dependency cycle between computables");
            result.extend(cyclic);
        }

        result
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of resources with at least one reader.
    pub fn resource_count(&self) -> usize {
        self.readers.len()
    }

    fn drop_reader(&mut self, resource: ResourceId, node_id: NodeId) -> bool {
        let Some(counter) = self.readers.get_mut(&resource) else {
            return false;
        };
        let emptied = counter.dec(&node_id);
        if emptied {
            self.readers.remove(&resource);
        }
        emptied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(raw: u64) -> ResourceId {
        ResourceId::new(raw)
    }

    fn reads(ids: &[u64]) -> HashSet<ResourceId> {
        ids.iter().map(|id| rid(*id)).collect()
    }

    fn add(scheduler: &mut UpdateScheduler, key: &str) -> NodeId {
        scheduler.add_node(Node::new(NodeId::new(), key))
    }

    #[test]
    fn add_and_remove_nodes() {
        let mut scheduler = UpdateScheduler::new();

        let id1 = add(&mut scheduler, "a");
        let id2 = add(&mut scheduler, "b");

        assert_eq!(scheduler.node_count(), 2);

        scheduler.remove_node(id1);
        assert_eq!(scheduler.node_count(), 1);
        assert!(scheduler.get_node(id1).is_none());
        assert!(scheduler.get_node(id2).is_some());
    }

    #[test]
    fn reads_activate_and_deactivate_resources() {
        let mut scheduler = UpdateScheduler::new();
        let a = add(&mut scheduler, "a");
        let b = add(&mut scheduler, "b");

        let changes = scheduler.set_reads(a, reads(&[1, 2]), HashSet::new());
        let mut activated = changes.activated.clone();
        activated.sort();
        assert_eq!(activated, vec![rid(1), rid(2)]);

        // A second reader of the same resource activates nothing.
        let changes = scheduler.set_reads(b, reads(&[2]), HashSet::new());
        assert!(changes.activated.is_empty());

        // Dropping a shared resource from one reader keeps it alive.
        let changes = scheduler.set_reads(a, reads(&[1]), HashSet::new());
        assert!(changes.deactivated.is_empty());
        assert_eq!(scheduler.readers_of(rid(2)), vec![b]);

        let changes = scheduler.remove_node(b);
        assert_eq!(changes.deactivated, vec![rid(2)]);
        assert_eq!(scheduler.resource_count(), 1);
    }

    #[test]
    fn upstream_edges_follow_reads() {
        let mut scheduler = UpdateScheduler::new();
        let base = add(&mut scheduler, "base");
        let derived = add(&mut scheduler, "derived");

        let changes = scheduler.set_reads(derived, HashSet::new(), [base].into_iter().collect());
        assert_eq!(changes.linked, vec![base]);
        assert!(scheduler
            .get_node(base)
            .unwrap()
            .dependents()
            .contains(&derived));

        let changes = scheduler.set_reads(derived, HashSet::new(), HashSet::new());
        assert_eq!(changes.unlinked, vec![base]);
        assert!(scheduler.get_node(base).unwrap().dependents().is_empty());
    }

    #[test]
    fn mark_changed_propagates_in_order() {
        let mut scheduler = UpdateScheduler::new();

        // Chain: resource 1 -> first -> second -> third
        let first = add(&mut scheduler, "first");
        let second = add(&mut scheduler, "second");
        let third = add(&mut scheduler, "third");
        let unrelated = add(&mut scheduler, "unrelated");

        scheduler.set_reads(first, reads(&[1]), HashSet::new());
        scheduler.set_reads(second, HashSet::new(), [first].into_iter().collect());
        scheduler.set_reads(third, reads(&[1]), [second].into_iter().collect());
        scheduler.set_reads(unrelated, reads(&[2]), HashSet::new());

        let to_process = scheduler.mark_changed(&[rid(1)], []);

        assert_eq!(to_process, vec![first, second, third]);
    }

    #[test]
    fn seeds_pull_in_their_dependents() {
        let mut scheduler = UpdateScheduler::new();
        let base = add(&mut scheduler, "base");
        let derived = add(&mut scheduler, "derived");
        scheduler.set_reads(derived, HashSet::new(), [base].into_iter().collect());

        assert_eq!(scheduler.mark_changed(&[], [base]), vec![base, derived]);
    }

    #[test]
    fn cycles_are_still_scheduled() {
        let mut scheduler = UpdateScheduler::new();
        let a = add(&mut scheduler, "a");
        let b = add(&mut scheduler, "b");
        scheduler.add_edge(a, b);
        scheduler.add_edge(b, a);

        let order = scheduler.mark_changed(&[], [a]);
        assert_eq!(order.len(), 2);
    }
}
