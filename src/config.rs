use std::time::Duration;

/// Hard ceiling on the number of per-thread trees a process can register.
pub const MAX_TREES: usize = 128;

/// Scope names are stored inline and NUL terminated, never heap allocated.
/// Must be at least 16 bytes so a name read back through
/// `prctl(PR_GET_NAME)` always fits.
pub const MAX_NAME_LEN: usize = 32;

/// Upper bound on the number of distinct children below one scope node.
pub const MAX_SIBLINGS: usize = 16;

/// Node weights are percentages scaled by this factor so they fit in plain
/// integer counters.
pub const WEIGHT_SCALE: u64 = 10_000;

pub(crate) const DEFAULT_MAX_TREE_NODES: usize = 256;
pub(crate) const DEFAULT_MAX_TREE_LEVELS: usize = 256;

/// Default path for the JSON dump when `write_stats` receives no path.
pub const STATS_OUTPUT_JSON_ENV: &str = "MTAG_STATS_OUTPUT_JSON";

/// Default path for the Graphviz DOT dump when `write_stats` receives no path.
pub const STATS_OUTPUT_DOT_ENV: &str = "MTAG_STATS_OUTPUT_GRAPHVIZ_DOT";

/// Snapshot interval consulted when `init` is given a zero interval.
pub const SNAPSHOT_INTERVAL_ENV: &str = "MTAG_SNAPSHOT_INTERVAL_SEC";

/// Filename prefix for interval snapshots; snapshots are suppressed when the
/// caller passes no prefix and this is unset.
pub const SNAPSHOT_PREFIX_ENV: &str = "MTAG_SNAPSHOT_OUTPUT_PREFIX_FILE_PATH";

/// Controls how the engine sizes per-thread trees and paces snapshots.
#[derive(Debug, Clone)]
pub struct EngineConfig {
  /// Node pool capacity of every tree. Pools never grow; once drained, new
  /// scopes fail to push and allocations charge the nearest ancestor.
  pub max_tree_nodes: usize,
  /// Deepest scope level a push may reach (the root sits at level zero).
  pub max_tree_levels: usize,
  /// Minimum wall time between interval snapshots. Zero disables them
  /// unless `MTAG_SNAPSHOT_INTERVAL_SEC` overrides it at init.
  pub snapshot_interval: Duration,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      max_tree_nodes: DEFAULT_MAX_TREE_NODES,
      max_tree_levels: DEFAULT_MAX_TREE_LEVELS,
      snapshot_interval: Duration::ZERO,
    }
  }
}

impl EngineConfig {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn with_max_tree_nodes(mut self, max_tree_nodes: usize) -> Self {
    self.max_tree_nodes = max_tree_nodes.max(1);
    self
  }

  #[must_use]
  pub fn with_max_tree_levels(mut self, max_tree_levels: usize) -> Self {
    self.max_tree_levels = max_tree_levels;
    self
  }

  #[must_use]
  pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
    self.snapshot_interval = interval;
    self
  }

  /// The interval actually used by the engine: an explicit non-zero value
  /// wins, otherwise the environment is consulted.
  pub(crate) fn resolved_snapshot_interval(&self) -> Duration {
    if !self.snapshot_interval.is_zero() {
      return self.snapshot_interval;
    }

    interval_from_env(std::env::var(SNAPSHOT_INTERVAL_ENV).ok())
  }
}

fn interval_from_env(value: Option<String>) -> Duration {
  let secs = value
    .as_deref()
    .and_then(|raw| raw.trim().parse::<u64>().ok())
    .unwrap_or(0);

  Duration::from_secs(secs)
}
