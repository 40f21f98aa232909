use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::linux;
use crate::node::{CallKind, NodeCell, NodeCounters, NodeId, ScopeName, ROOT_NODE};
use crate::snapshot::{ScopeStats, TreeStats};

/// Rough virtual-memory cost of one extra glibc-style thread: its arena
/// reservation dominates everything else.
const SECONDARY_ARENA_ESTIMATE: u64 = 128 * 1024 * 1024;

/// Per-thread tree of tagged scopes.
///
/// The owning thread is the single writer: it moves the cursor through
/// `push`/`pop` and charges allocations to whatever node the cursor points
/// at. Charging takes no lock at all; only structural changes and cold-path
/// traversals go through the structure mutex. There is one `ScopeTree` per
/// thread that ever allocated after engine init, and trees live until the
/// process exits.
pub(crate) struct ScopeTree {
  structure: Mutex<TreeStructure>,
  counters: Box<[NodeCounters]>,
  /// Node currently charged by the fast path. Written only by the owner
  /// thread (inside the structure lock), read lock-free.
  cursor: AtomicU32,
  thread_id: i32,
  max_levels: usize,
  vmsize_at_creation: u64,
  push_failures: AtomicU64,
  free_tracking_failures: AtomicU64,
}

struct TreeStructure {
  cells: Box<[NodeCell]>,
  nodes_in_use: u32,
  max_level_seen: u16,
}

impl TreeStructure {
  /// Draws the next vacant pool slot. Slots are handed out in order and
  /// never recycled, so parent links stay valid for the tree's lifetime.
  fn take_slot(&mut self) -> Option<NodeId> {
    if (self.nodes_in_use as usize) < self.cells.len() {
      let id = self.nodes_in_use;
      self.nodes_in_use += 1;
      Some(id)
    } else {
      None
    }
  }

  /// Returns the slot just drawn by `take_slot`; only valid for that slot.
  fn put_back_slot(&mut self, id: NodeId) {
    debug_assert_eq!(id + 1, self.nodes_in_use);
    self.nodes_in_use -= 1;
  }

  fn child_with_name(&self, parent: NodeId, name: &ScopeName) -> Option<NodeId> {
    self.cells[parent as usize]
      .child_ids()
      .iter()
      .copied()
      .find(|&child| self.cells[child as usize].name == *name)
  }
}

impl ScopeTree {
  /// Builds the tree for the calling thread: allocates the node pool, draws
  /// the root and names it after the thread. This is the only allocating
  /// operation a tree ever performs.
  pub(crate) fn new(max_nodes: usize, max_levels: usize, is_main: bool) -> Self {
    let max_nodes = max_nodes.max(1);

    let mut cells = vec![NodeCell::vacant(); max_nodes].into_boxed_slice();
    cells[ROOT_NODE as usize].init(None, 0);
    cells[ROOT_NODE as usize].name = ScopeName::from_current_thread();

    let counters = (0..max_nodes)
      .map(|_| NodeCounters::new())
      .collect::<Vec<_>>()
      .into_boxed_slice();

    let vmsize_at_creation = if is_main {
      linux::vm_size_bytes().unwrap_or(0)
    } else {
      // For secondary threads /proc VmSize covers the whole process, so
      // estimate the thread's own contribution instead: its stack plus one
      // allocator arena.
      linux::thread_stack_size().unwrap_or(0) + SECONDARY_ARENA_ESTIMATE
    };

    Self {
      structure: Mutex::new(TreeStructure {
        cells,
        nodes_in_use: 1,
        max_level_seen: 0,
      }),
      counters,
      cursor: AtomicU32::new(ROOT_NODE),
      thread_id: linux::gettid(),
      max_levels,
      vmsize_at_creation,
      push_failures: AtomicU64::new(0),
      free_tracking_failures: AtomicU64::new(0),
    }
  }

  fn lock_structure(&self) -> MutexGuard<'_, TreeStructure> {
    match self.structure.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  pub(crate) fn max_nodes(&self) -> usize {
    self.counters.len()
  }

  pub(crate) fn max_levels(&self) -> usize {
    self.max_levels
  }

  /// Bytes this tree itself costs the process, dominated by the node pool.
  pub(crate) fn memory_usage_bytes(&self) -> u64 {
    let per_node =
      std::mem::size_of::<NodeCell>() + std::mem::size_of::<NodeCounters>();
    (self.counters.len() * per_node) as u64
  }

  /// Enters the scope `name` below the cursor, reusing an existing child of
  /// that name or drawing a fresh pool slot.
  ///
  /// Returns `true` when the cursor moved. On `false` the cursor stays put
  /// (level cap, pool drained, or sibling cap), `push_failures` grows by one
  /// and the matching `pop` must be skipped by the caller.
  pub(crate) fn push(&self, name: &[u8]) -> bool {
    let name = ScopeName::new(name);

    let mut structure = self.lock_structure();
    let cursor = self.cursor.load(Ordering::Relaxed);
    let cursor_level = structure.cells[cursor as usize].level;

    if usize::from(cursor_level) == self.max_levels {
      drop(structure);
      self.push_failures.fetch_add(1, Ordering::Relaxed);
      return false;
    }

    if let Some(existing) = structure.child_with_name(cursor, &name) {
      self.cursor.store(existing, Ordering::Relaxed);
      return true;
    }

    let Some(slot) = structure.take_slot() else {
      // Pool drained: results stay valid but incomplete from here on.
      drop(structure);
      self.push_failures.fetch_add(1, Ordering::Relaxed);
      return false;
    };

    let level = cursor_level + 1;
    structure.cells[slot as usize].init(Some(cursor), level);
    structure.cells[slot as usize].name = name;

    if !structure.cells[cursor as usize].link_new_child(slot) {
      structure.put_back_slot(slot);
      drop(structure);
      self.push_failures.fetch_add(1, Ordering::Relaxed);
      return false;
    }

    structure.max_level_seen = structure.max_level_seen.max(level);
    self.cursor.store(slot, Ordering::Relaxed);
    true
  }

  /// Leaves the current scope. Only legal after a `push` that returned
  /// `true`; popping past the root is a logic error.
  pub(crate) fn pop(&self) {
    let mut structure = self.lock_structure();
    let cursor = self.cursor.load(Ordering::Relaxed);
    structure.cells[cursor as usize].mark_left();

    let parent = structure.cells[cursor as usize].parent;
    debug_assert!(parent.is_some(), "scope pop walked past the tree root");
    if let Some(parent) = parent {
      self.cursor.store(parent, Ordering::Relaxed);
    }
  }

  /// Charges an allocation to the current scope. Lock-free and O(1).
  #[inline]
  pub(crate) fn track_alloc_in_cursor(&self, kind: CallKind, bytes: u64) {
    let cursor = self.cursor.load(Ordering::Relaxed) as usize;
    self.counters[cursor].track_alloc(kind, bytes);
  }

  /// Charges a free to the current scope. A zero size means the raw
  /// allocator could not report a usable size; the charge is dropped and
  /// counted as a tracking failure instead.
  #[inline]
  pub(crate) fn track_free_in_cursor(&self, bytes: u64) {
    if bytes == 0 {
      self.free_tracking_failures.fetch_add(1, Ordering::Relaxed);
      return;
    }
    let cursor = self.cursor.load(Ordering::Relaxed) as usize;
    self.counters[cursor].track_free(bytes);
  }

  /// Root totals `(allocated, freed)` after a fresh totals pass.
  pub(crate) fn totals(&self) -> (u64, u64) {
    let structure = self.lock_structure();
    self.compute_totals(&structure, ROOT_NODE)
  }

  /// Materialises an owned snapshot of this tree. Totals are recomputed
  /// post-order and weights derived against `weight_denominator` (the
  /// tree's own root total when `None`), all under the structure lock so
  /// the shape cannot shift mid-walk.
  pub(crate) fn stats(&self, weight_denominator: Option<u64>) -> TreeStats {
    let structure = self.lock_structure();
    let (root_alloc, _root_freed) = self.compute_totals(&structure, ROOT_NODE);
    let denominator = weight_denominator.unwrap_or(root_alloc);
    self.compute_weights(&structure, ROOT_NODE, denominator);

    TreeStats {
      thread_id: self.thread_id,
      thread_name: structure.cells[ROOT_NODE as usize].name.display(),
      levels: u64::from(structure.max_level_seen),
      nodes_in_use: u64::from(structure.nodes_in_use),
      max_nodes: self.counters.len() as u64,
      push_failures: self.push_failures.load(Ordering::Relaxed),
      free_tracking_failures: self.free_tracking_failures.load(Ordering::Relaxed),
      vmsize_at_creation: self.vmsize_at_creation,
      root: self.scope_stats(&structure, ROOT_NODE),
    }
  }

  /// Flattens this tree into `map` using the documented key grammar: the
  /// root is attached to the `tid<tid>:` prefix directly, deeper scopes with
  /// `.`, and tree-level counters hang off the bare prefix.
  pub(crate) fn fill_stats_map(
    &self,
    map: &mut BTreeMap<String, u64>,
    grand_total: u64,
  ) {
    let structure = self.lock_structure();
    self.compute_totals(&structure, ROOT_NODE);
    self.compute_weights(&structure, ROOT_NODE, grand_total);

    let prefix = format!("tid{}:", self.thread_id);
    map.insert(
      format!("{prefix}.nTreeNodesInUse"),
      u64::from(structure.nodes_in_use),
    );
    map.insert(
      format!("{prefix}.nMaxTreeNodes"),
      self.counters.len() as u64,
    );
    map.insert(
      format!("{prefix}.nPushNodeFailures"),
      self.push_failures.load(Ordering::Relaxed),
    );
    map.insert(
      format!("{prefix}.nFreeTrackingFailed"),
      self.free_tracking_failures.load(Ordering::Relaxed),
    );

    let root_path = format!(
      "{prefix}{}",
      structure.cells[ROOT_NODE as usize].name.display()
    );
    self.fill_node_map(&structure, ROOT_NODE, &root_path, map);
  }

  fn fill_node_map(
    &self,
    structure: &TreeStructure,
    id: NodeId,
    path: &str,
    map: &mut BTreeMap<String, u64>,
  ) {
    let cell = &structure.cells[id as usize];
    let counters = &self.counters[id as usize];

    map.insert(
      format!("{path}.nBytesTotalAllocated"),
      counters.bytes_total_alloc(),
    );
    map.insert(
      format!("{path}.nBytesSelfAllocated"),
      counters.bytes_self_alloc(),
    );
    map.insert(format!("{path}.nBytesSelfFreed"), counters.bytes_self_freed());
    map.insert(format!("{path}.nTimesEnteredAndExited"), cell.visits);
    // Scaled by WEIGHT_SCALE: 10000 means 100%.
    map.insert(format!("{path}.nWeightPercentage"), counters.weight_total());
    for kind in CallKind::ALL {
      map.insert(format!("{path}.{}", kind.stat_key()), counters.calls(kind));
    }

    for &child in cell.child_ids() {
      let child_path = format!(
        "{path}.{}",
        structure.cells[child as usize].name.display()
      );
      self.fill_node_map(structure, child, &child_path, map);
    }
  }

  // Post-order recompute of subtree byte totals; returns this subtree's
  // (allocated, freed).
  fn compute_totals(&self, structure: &TreeStructure, id: NodeId) -> (u64, u64) {
    let counters = &self.counters[id as usize];
    let mut alloc = counters.bytes_self_alloc();
    let mut freed = counters.bytes_self_freed();

    for &child in structure.cells[id as usize].child_ids() {
      let (child_alloc, child_freed) = self.compute_totals(structure, child);
      alloc += child_alloc;
      freed += child_freed;
    }

    counters.store_totals(alloc, freed);
    (alloc, freed)
  }

  fn compute_weights(&self, structure: &TreeStructure, id: NodeId, denominator: u64) {
    self.counters[id as usize].store_weights(denominator);
    for &child in structure.cells[id as usize].child_ids() {
      self.compute_weights(structure, child, denominator);
    }
  }

  fn scope_stats(&self, structure: &TreeStructure, id: NodeId) -> ScopeStats {
    let cell = &structure.cells[id as usize];
    let counters = &self.counters[id as usize];

    ScopeStats {
      name: cell.name.display(),
      bytes_total_alloc: counters.bytes_total_alloc(),
      bytes_total_freed: counters.bytes_total_freed(),
      bytes_self_alloc: counters.bytes_self_alloc(),
      bytes_self_freed: counters.bytes_self_freed(),
      visits: cell.visits,
      calls: [
        counters.calls(CallKind::Malloc),
        counters.calls(CallKind::Realloc),
        counters.calls(CallKind::Calloc),
        counters.calls(CallKind::Free),
      ],
      weight_total: counters.weight_total(),
      weight_self: counters.weight_self(),
      children: cell
        .child_ids()
        .iter()
        .map(|&child| self.scope_stats(structure, child))
        .collect(),
    }
  }
}
