//! Graph Configuration
//!
//! A [`GraphConfig`] is built once at startup and handed to
//! [`Graph::new`](crate::reactive::Graph::new). Nothing in the crate reads the
//! environment; debug switches live in [`DebugFlags`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GraphError;

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// How long the driver waits after the first change event of a burst
    /// before it runs a recomputation pass.
    pub coalesce_window_ms: u64,

    /// How long a node that computed during a non-quiescent epoch waits
    /// before it is evaluated again.
    pub settle_recheck_ms: u64,

    /// Remote fetch retry policy.
    pub fetch: FetchConfig,

    /// Instrumentation switches.
    pub debug: DebugFlags,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            coalesce_window_ms: 5,
            settle_recheck_ms: 50,
            fetch: FetchConfig::default(),
            debug: DebugFlags::default(),
        }
    }
}

impl GraphConfig {
    /// Parse a configuration from a JSON document. Missing fields take their
    /// default values.
    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn coalesce_window(&self) -> Duration {
        Duration::from_millis(self.coalesce_window_ms)
    }

    pub fn settle_recheck(&self) -> Duration {
        Duration::from_millis(self.settle_recheck_ms)
    }
}

/// Retry policy for fetching pending resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Total attempts before a fetch is reported as failed. Zero is treated
    /// as one.
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 50,
            backoff_max_ms: 2_000,
        }
    }
}

impl FetchConfig {
    /// Delay before retrying after the given (1-based) failed attempt.
    ///
    /// Doubles from `backoff_base_ms` and saturates at `backoff_max_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let millis = self
            .backoff_base_ms
            .saturating_mul(1u64 << shift)
            .min(self.backoff_max_ms);
        Duration::from_millis(millis)
    }
}

/// How tree mutation statistics are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeStatMode {
    #[default]
    Off,
    /// Log running totals after every applied delta.
    Cumulative,
    /// Log the statistics of each applied delta on its own.
    PerRequest,
}

/// Which node status transitions are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatusMode {
    #[default]
    Off,
    /// Only transitions into a non-stable status.
    UnstableOnly,
    All,
}

/// Debug switches read by [`Instrumentation`](crate::instrument::Instrumentation).
///
/// Everything is off by default, and disabled taps cost a branch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugFlags {
    pub tree_stat: TreeStatMode,
    pub dump_initial_tree: bool,
    pub log_recalculations: bool,
    pub output_status: OutputStatusMode,
}

impl DebugFlags {
    /// True if any instrumentation is enabled.
    pub fn any(&self) -> bool {
        self.tree_stat != TreeStatMode::Off
            || self.dump_initial_tree
            || self.log_recalculations
            || self.output_status != OutputStatusMode::Off
    }
}
