//! Instrumentation Hooks
//!
//! Read-only taps on tree mutations, recomputations, and node status
//! transitions. Every tap first checks its [`DebugFlags`] switch and returns
//! immediately when disabled, so a quiet configuration costs one branch per
//! event and never touches the counters.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{DebugFlags, OutputStatusMode, TreeStatMode};
use crate::graph::{NodeId, NodeStatus};
use crate::tree::TreeNode;

/// Mutation statistics for one delta, or running totals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeStats {
    pub deltas: u64,
    pub records: u64,
    pub added: u64,
    pub updated: u64,
    pub removed: u64,
    /// Records ignored because their version was not newer.
    pub stale: u64,
    pub fetches: u64,
    pub fetch_failures: u64,
}

#[derive(Debug, Default)]
struct TreeCounters {
    deltas: AtomicU64,
    records: AtomicU64,
    added: AtomicU64,
    updated: AtomicU64,
    removed: AtomicU64,
    stale: AtomicU64,
    fetches: AtomicU64,
    fetch_failures: AtomicU64,
}

impl TreeCounters {
    fn add(&self, stats: &TreeStats) {
        self.deltas.fetch_add(stats.deltas, Ordering::Relaxed);
        self.records.fetch_add(stats.records, Ordering::Relaxed);
        self.added.fetch_add(stats.added, Ordering::Relaxed);
        self.updated.fetch_add(stats.updated, Ordering::Relaxed);
        self.removed.fetch_add(stats.removed, Ordering::Relaxed);
        self.stale.fetch_add(stats.stale, Ordering::Relaxed);
    }

    fn load(&self) -> TreeStats {
        TreeStats {
            deltas: self.deltas.load(Ordering::Relaxed),
            records: self.records.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            removed: self.removed.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentSnapshot {
    pub tree: TreeStats,
    pub recalculations: u64,
    pub status_transitions: u64,
}

/// Instrumentation shared by the replica and the runtime of one graph.
#[derive(Debug, Default)]
pub struct Instrumentation {
    flags: DebugFlags,
    tree: TreeCounters,
    recalculations: AtomicU64,
    status_transitions: AtomicU64,
    initial_dumped: AtomicBool,
}

impl Instrumentation {
    pub fn new(flags: DebugFlags) -> Arc<Self> {
        Arc::new(Self {
            flags,
            ..Self::default()
        })
    }

    /// Instrumentation with everything switched off.
    pub fn disabled() -> Arc<Self> {
        Self::new(DebugFlags::default())
    }

    pub fn flags(&self) -> &DebugFlags {
        &self.flags
    }

    /// A delta was applied at `epoch`.
    pub fn on_delta(&self, epoch: u64, stats: &TreeStats) {
        match self.flags.tree_stat {
            TreeStatMode::Off => {}
            TreeStatMode::PerRequest => {
                self.tree.add(stats);
                info!(epoch, ?stats, "tree mutation");
            }
            TreeStatMode::Cumulative => {
                self.tree.add(stats);
                let totals = self.tree.load();
                info!(epoch, ?totals, "tree mutation totals");
            }
        }
    }

    pub fn on_fetch(&self) {
        if self.flags.tree_stat != TreeStatMode::Off {
            self.tree.fetches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn on_fetch_failure(&self) {
        if self.flags.tree_stat != TreeStatMode::Off {
            self.tree.fetch_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// True exactly once, for the first caller, when the initial tree dump is
    /// enabled.
    pub fn take_initial_dump(&self) -> bool {
        self.flags.dump_initial_tree && !self.initial_dumped.swap(true, Ordering::AcqRel)
    }

    pub fn dump_tree(&self, epoch: u64, nodes: &[Arc<TreeNode>]) {
        let nodes: Vec<&TreeNode> = nodes.iter().map(Arc::as_ref).collect();
        let dump = serde_json::to_string(&nodes).unwrap_or_else(|err| format!("<{err}>"));
        info!(epoch, nodes = nodes.len(), %dump, "initial tree state");
    }

    /// A node ran its derivation.
    pub fn on_recalculation(&self, node: NodeId, key: &str, epoch: u64) {
        if !self.flags.log_recalculations {
            return;
        }
        let count = self.recalculations.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(%node, key, epoch, count, "output recalculated");
    }

    /// True if status transitions are reported at all.
    pub fn reports_status(&self) -> bool {
        self.flags.output_status != OutputStatusMode::Off
    }

    /// A node moved between statuses.
    pub fn on_status(
        &self,
        node: NodeId,
        key: &str,
        from: NodeStatus,
        to: NodeStatus,
        marker: Option<&str>,
    ) {
        let report = match self.flags.output_status {
            OutputStatusMode::Off => false,
            OutputStatusMode::UnstableOnly => to != NodeStatus::Stable,
            OutputStatusMode::All => true,
        };
        if !report || from == to {
            return;
        }
        self.status_transitions.fetch_add(1, Ordering::Relaxed);
        info!(%node, key, ?from, ?to, marker, "output status");
    }

    pub fn snapshot(&self) -> InstrumentSnapshot {
        InstrumentSnapshot {
            tree: self.tree.load(),
            recalculations: self.recalculations.load(Ordering::Relaxed),
            status_transitions: self.status_transitions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_delta() -> TreeStats {
        TreeStats {
            deltas: 1,
            records: 3,
            added: 2,
            updated: 1,
            ..TreeStats::default()
        }
    }

    #[test]
    fn disabled_taps_count_nothing() {
        let instruments = Instrumentation::disabled();
        instruments.on_delta(1, &one_delta());
        instruments.on_fetch();
        instruments.on_recalculation(NodeId::new(), "k", 1);
        instruments.on_status(NodeId::new(), "k", NodeStatus::Pending, NodeStatus::Stable, None);

        assert_eq!(instruments.snapshot(), InstrumentSnapshot::default());
        assert!(!instruments.take_initial_dump());
    }

    #[test]
    fn cumulative_tree_stats_accumulate() {
        let instruments = Instrumentation::new(DebugFlags {
            tree_stat: TreeStatMode::Cumulative,
            ..DebugFlags::default()
        });
        instruments.on_delta(1, &one_delta());
        instruments.on_delta(2, &one_delta());
        instruments.on_fetch();

        let tree = instruments.snapshot().tree;
        assert_eq!(tree.deltas, 2);
        assert_eq!(tree.added, 4);
        assert_eq!(tree.fetches, 1);
    }

    #[test]
    fn unstable_only_skips_stable_transitions() {
        let instruments = Instrumentation::new(DebugFlags {
            output_status: OutputStatusMode::UnstableOnly,
            ..DebugFlags::default()
        });
        let node = NodeId::new();
        instruments.on_status(node, "k", NodeStatus::Pending, NodeStatus::Stable, None);
        instruments.on_status(node, "k", NodeStatus::Stable, NodeStatus::Unstable, None);

        assert_eq!(instruments.snapshot().status_transitions, 1);
    }

    #[test]
    fn initial_dump_happens_once() {
        let instruments = Instrumentation::new(DebugFlags {
            dump_initial_tree: true,
            ..DebugFlags::default()
        });
        assert!(instruments.take_initial_dump());
        assert!(!instruments.take_initial_dump());
    }
}
