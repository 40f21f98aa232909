use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::{MAX_NAME_LEN, MAX_SIBLINGS, WEIGHT_SCALE};
use crate::linux;

/// Allocation primitive observed on the fast path. `memalign`, `valloc` and
/// `pvalloc` are charged as [`CallKind::Malloc`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CallKind {
  Malloc,
  Realloc,
  Calloc,
  Free,
}

impl CallKind {
  pub(crate) const COUNT: usize = 4;

  pub(crate) const ALL: [Self; Self::COUNT] =
    [Self::Malloc, Self::Realloc, Self::Calloc, Self::Free];

  /// Key used for this primitive in the JSON document and the flat stat map.
  #[must_use]
  pub fn stat_key(self) -> &'static str {
    match self {
      Self::Malloc => "nCallsTo_malloc",
      Self::Realloc => "nCallsTo_realloc",
      Self::Calloc => "nCallsTo_calloc",
      Self::Free => "nCallsTo_free",
    }
  }

  pub(crate) fn index(self) -> usize {
    match self {
      Self::Malloc => 0,
      Self::Realloc => 1,
      Self::Calloc => 2,
      Self::Free => 3,
    }
  }
}

/// Inline, NUL-terminated scope tag. Longer names are truncated, never
/// reallocated; the fast path copies at most `MAX_NAME_LEN` bytes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct ScopeName {
  bytes: [u8; MAX_NAME_LEN],
}

impl ScopeName {
  pub(crate) const fn empty() -> Self {
    Self {
      bytes: [0; MAX_NAME_LEN],
    }
  }

  pub(crate) fn new(source: &[u8]) -> Self {
    let mut name = Self::empty();
    name.copy_in(source, 0);
    name
  }

  /// Builds `"<class>::<function>"`, truncated as a whole.
  pub(crate) fn qualified(class: &[u8], function: &[u8]) -> Self {
    let mut name = Self::empty();
    let mut at = name.copy_in(class, 0);
    at = name.copy_in(b"::", at);
    name.copy_in(function, at);
    name
  }

  /// Seeds the name from the calling thread's OS name.
  pub(crate) fn from_current_thread() -> Self {
    Self::new(&linux::current_thread_name())
  }

  fn copy_in(&mut self, source: &[u8], mut at: usize) -> usize {
    for &byte in source {
      if byte == 0 || at >= MAX_NAME_LEN - 1 {
        break;
      }
      self.bytes[at] = byte;
      at += 1;
    }
    at
  }

  fn len(&self) -> usize {
    self.bytes.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LEN)
  }

  pub(crate) fn as_bytes(&self) -> &[u8] {
    &self.bytes[..self.len()]
  }

  /// Owned, lossily-decoded rendition for the cold path.
  pub(crate) fn display(&self) -> String {
    String::from_utf8_lossy(&self.bytes[..self.len()]).into_owned()
  }
}

/// Index of a node inside its tree's pool. Pool slots are handed out in
/// creation order and never reused, so an id stays valid for the life of the
/// tree.
pub(crate) type NodeId = u32;

pub(crate) const ROOT_NODE: NodeId = 0;

/// Structural half of a tree node. Every field here is guarded by the owning
/// tree's structure lock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeCell {
  pub(crate) name: ScopeName,
  pub(crate) level: u16,
  pub(crate) parent: Option<NodeId>,
  children: [NodeId; MAX_SIBLINGS],
  n_children: u8,
  pub(crate) visits: u64,
}

impl NodeCell {
  pub(crate) const fn vacant() -> Self {
    Self {
      name: ScopeName::empty(),
      level: 0,
      parent: None,
      children: [0; MAX_SIBLINGS],
      n_children: 0,
      visits: 0,
    }
  }

  pub(crate) fn init(&mut self, parent: Option<NodeId>, level: u16) {
    *self = Self::vacant();
    self.parent = parent;
    self.level = level;
  }

  /// Appends `child`; `false` once the sibling cap is reached.
  pub(crate) fn link_new_child(&mut self, child: NodeId) -> bool {
    if usize::from(self.n_children) == MAX_SIBLINGS {
      return false;
    }
    self.children[usize::from(self.n_children)] = child;
    self.n_children += 1;
    true
  }

  pub(crate) fn child_ids(&self) -> &[NodeId] {
    &self.children[..usize::from(self.n_children)]
  }

  /// Records one more enter/exit cycle through this scope.
  pub(crate) fn mark_left(&mut self) {
    self.visits += 1;
  }
}

/// Counter half of a tree node: written by the owning thread only, read by
/// whatever thread happens to collect stats. Relaxed atomics keep the fast
/// path lock-free while letting cold-path readers observe sane values.
///
/// `bytes_total_*` and the weights are only meaningful right after a totals
/// pass ran under the tree's structure lock.
#[derive(Debug, Default)]
pub(crate) struct NodeCounters {
  bytes_self_alloc: AtomicU64,
  bytes_self_freed: AtomicU64,
  calls: [AtomicU64; CallKind::COUNT],
  bytes_total_alloc: AtomicU64,
  bytes_total_freed: AtomicU64,
  weight_total: AtomicU64,
  weight_self: AtomicU64,
}

impl NodeCounters {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn track_alloc(&self, kind: CallKind, bytes: u64) {
    self.bytes_self_alloc.fetch_add(bytes, Ordering::Relaxed);
    self.calls[kind.index()].fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn track_free(&self, bytes: u64) {
    self.bytes_self_freed.fetch_add(bytes, Ordering::Relaxed);
    self.calls[CallKind::Free.index()].fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn bytes_self_alloc(&self) -> u64 {
    self.bytes_self_alloc.load(Ordering::Relaxed)
  }

  pub(crate) fn bytes_self_freed(&self) -> u64 {
    self.bytes_self_freed.load(Ordering::Relaxed)
  }

  pub(crate) fn calls(&self, kind: CallKind) -> u64 {
    self.calls[kind.index()].load(Ordering::Relaxed)
  }

  pub(crate) fn bytes_total_alloc(&self) -> u64 {
    self.bytes_total_alloc.load(Ordering::Relaxed)
  }

  pub(crate) fn bytes_total_freed(&self) -> u64 {
    self.bytes_total_freed.load(Ordering::Relaxed)
  }

  pub(crate) fn weight_total(&self) -> u64 {
    self.weight_total.load(Ordering::Relaxed)
  }

  pub(crate) fn weight_self(&self) -> u64 {
    self.weight_self.load(Ordering::Relaxed)
  }

  pub(crate) fn store_totals(&self, alloc: u64, freed: u64) {
    self.bytes_total_alloc.store(alloc, Ordering::Relaxed);
    self.bytes_total_freed.store(freed, Ordering::Relaxed);
  }

  /// Recomputes both weights against `denominator` total bytes. A zero
  /// denominator zeroes the weights instead of dividing.
  pub(crate) fn store_weights(&self, denominator: u64) {
    let scale = |bytes: u64| {
      if denominator == 0 {
        0
      } else {
        (u128::from(bytes) * u128::from(WEIGHT_SCALE) / u128::from(denominator)) as u64
      }
    };
    self
      .weight_total
      .store(scale(self.bytes_total_alloc()), Ordering::Relaxed);
    self
      .weight_self
      .store(scale(self.bytes_self_alloc()), Ordering::Relaxed);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn names_truncate_and_stay_nul_terminated() {
    let name = ScopeName::new(b"0123456789012345678901234567890123456789");
    assert_eq!(name.display().len(), MAX_NAME_LEN - 1);

    let short = ScopeName::new(b"FuncA");
    assert_eq!(short.display(), "FuncA");
    assert!(ScopeName::empty().display().is_empty());
  }

  #[test]
  fn qualified_names_join_and_truncate_as_a_whole() {
    let name = ScopeName::qualified(b"YetAnotherThread", b"MainEvLoop");
    assert_eq!(name.display(), "YetAnotherThread::MainEvLoop");

    let long = ScopeName::qualified(b"AVeryLongClassNameIndeed", b"AVeryLongMethod");
    assert_eq!(long.display().len(), MAX_NAME_LEN - 1);
    assert!(long.display().starts_with("AVeryLongClassNameIndeed::"));
  }

  #[test]
  fn embedded_nul_cuts_the_copy() {
    let name = ScopeName::new(b"abc\0def");
    assert_eq!(name.display(), "abc");
  }

  #[test]
  fn sibling_links_stop_at_the_cap() {
    let mut cell = NodeCell::vacant();
    for child in 0..MAX_SIBLINGS as NodeId {
      assert!(cell.link_new_child(child + 1));
    }
    assert!(!cell.link_new_child(99));
    assert_eq!(cell.child_ids().len(), MAX_SIBLINGS);
  }

  #[test]
  fn counters_accumulate_per_primitive() {
    let counters = NodeCounters::new();
    counters.track_alloc(CallKind::Malloc, 100);
    counters.track_alloc(CallKind::Malloc, 28);
    counters.track_alloc(CallKind::Calloc, 44);
    counters.track_free(16);

    assert_eq!(counters.bytes_self_alloc(), 172);
    assert_eq!(counters.bytes_self_freed(), 16);
    assert_eq!(counters.calls(CallKind::Malloc), 2);
    assert_eq!(counters.calls(CallKind::Calloc), 1);
    assert_eq!(counters.calls(CallKind::Realloc), 0);
    assert_eq!(counters.calls(CallKind::Free), 1);
  }

  #[test]
  fn weights_scale_against_the_denominator() {
    let counters = NodeCounters::new();
    counters.track_alloc(CallKind::Malloc, 250);
    counters.store_totals(500, 0);

    counters.store_weights(1000);
    assert_eq!(counters.weight_total(), WEIGHT_SCALE / 2);
    assert_eq!(counters.weight_self(), WEIGHT_SCALE / 4);

    counters.store_weights(0);
    assert_eq!(counters.weight_total(), 0);
    assert_eq!(counters.weight_self(), 0);
  }
}
