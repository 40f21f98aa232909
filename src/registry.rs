use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::linux;
use crate::snapshot::TreeStats;
use crate::tree::ScopeTree;

/// Process-wide directory of per-thread trees.
///
/// Slots are fixed at construction and append-only: a tree registered here
/// lives until the process exits, so handles to it stay valid everywhere
/// (including thread-local caches). Slot 0 is the main-thread tree and the
/// template every secondary tree inherits its caps from.
pub(crate) struct TreeRegistry {
  slots: Box<[OnceLock<ScopeTree>]>,
  /// Published tree count. Indexes are reserved with `fetch_add` before the
  /// slot's `OnceLock` is filled, so readers must skip still-empty slots.
  count: AtomicUsize,
  shutdown_started: AtomicBool,
  started_at: OnceLock<String>,
}

impl TreeRegistry {
  pub(crate) fn new(capacity: usize) -> Self {
    Self {
      slots: (0..capacity.max(1)).map(|_| OnceLock::new()).collect(),
      count: AtomicUsize::new(0),
      shutdown_started: AtomicBool::new(false),
      started_at: OnceLock::new(),
    }
  }

  /// Registers the main-thread tree. Must be the first registration; records
  /// the profiling start wallclock as a side effect.
  pub(crate) fn register_main(
    &self,
    max_nodes: usize,
    max_levels: usize,
  ) -> Option<&ScopeTree> {
    debug_assert_eq!(
      self.count.load(Ordering::Acquire),
      0,
      "the main tree must be the first one registered"
    );

    if self.shutdown_started.load(Ordering::Acquire) {
      return None;
    }

    let tree = ScopeTree::new(max_nodes, max_levels, true);
    if self.slots[0].set(tree).is_err() {
      // Lost an init race; the winner's tree is authoritative.
      return self.slots[0].get();
    }

    let _ = self.started_at.set(linux::wallclock_string());
    self.count.store(1, Ordering::Release);
    self.slots[0].get()
  }

  /// Registers a tree for the calling (secondary) thread, inheriting the
  /// main tree's caps. `None` during shutdown or once all slots are taken;
  /// the caller's thread then simply runs untracked.
  pub(crate) fn register_secondary(&self) -> Option<&ScopeTree> {
    if self.shutdown_started.load(Ordering::Acquire) {
      return None;
    }

    let main = self.slots[0].get()?;
    let index = self.count.fetch_add(1, Ordering::AcqRel);
    if index >= self.slots.len() {
      log::warn!(
        "tree registry full ({} trees): thread {} proceeds untracked",
        self.slots.len(),
        linux::gettid()
      );
      return None;
    }

    let tree = ScopeTree::new(main.max_nodes(), main.max_levels(), false);
    if self.slots[index].set(tree).is_err() {
      debug_assert!(false, "secondary registration raced on a reserved slot");
      return None;
    }
    self.slots[index].get()
  }

  pub(crate) fn has_main(&self) -> bool {
    self.slots[0].get().is_some()
  }

  pub(crate) fn shutdown(&self) {
    self.shutdown_started.store(true, Ordering::Release);
  }

  /// Profiling start wallclock, empty before the main tree registers.
  pub(crate) fn started_at(&self) -> &str {
    self.started_at.get().map_or("", String::as_str)
  }

  fn trees(&self) -> impl Iterator<Item = &ScopeTree> {
    let published = self.count.load(Ordering::Acquire).min(self.slots.len());
    self.slots[..published].iter().filter_map(OnceLock::get)
  }

  pub(crate) fn tree_count(&self) -> usize {
    self.trees().count()
  }

  /// Bytes the profiler itself holds, dominated by the node pools. Used to
  /// subtract profiler self-cost from reports.
  pub(crate) fn total_self_memory_bytes(&self) -> u64 {
    self.trees().map(ScopeTree::memory_usage_bytes).sum()
  }

  /// Sums `(allocated, freed)` root totals across all trees. Approximate by
  /// design: each tree is observed at its own instant.
  pub(crate) fn collect_across_trees(&self) -> (u64, u64) {
    self.trees().fold((0, 0), |(alloc, freed), tree| {
      let (tree_alloc, tree_freed) = tree.totals();
      (alloc + tree_alloc, freed + tree_freed)
    })
  }

  /// One `TreeStats` per registered tree, with weights normalised against
  /// the process-wide byte total.
  pub(crate) fn tree_stats(&self, grand_total: u64) -> Vec<TreeStats> {
    self
      .trees()
      .map(|tree| tree.stats(Some(grand_total)))
      .collect()
  }

  /// Flat machine-friendly view of every tree. The reserved `.nTrees` key
  /// carries the tree count.
  pub(crate) fn collect_as_map(&self) -> BTreeMap<String, u64> {
    let (grand_total, _freed) = self.collect_across_trees();

    let mut map = BTreeMap::new();
    map.insert(".nTrees".to_string(), self.tree_count() as u64);
    for tree in self.trees() {
      tree.fill_stats_map(&mut map, grand_total);
    }
    map
  }
}
