use std::cell::Cell;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::config::{
  EngineConfig, DEFAULT_MAX_TREE_LEVELS, DEFAULT_MAX_TREE_NODES, MAX_SIBLINGS, MAX_TREES,
  SNAPSHOT_PREFIX_ENV,
};
use crate::export::{self, ExportError};
use crate::linux;
use crate::node::CallKind;
use crate::output::{self, OutputFormat};
use crate::registry::TreeRegistry;
use crate::snapshot::{ProfileStats, SnapshotScheduler};
use crate::tree::ScopeTree;

/// The process-global profiler: the tree registry, the snapshot pacer and
/// the configuration the trees were sized with. Lives in a `OnceLock` and is
/// never torn down; `shutdown` only fences off new registrations.
pub(crate) struct TagEngine {
  registry: TreeRegistry,
  snapshots: SnapshotScheduler,
  config: EngineConfig,
}

static ENGINE: OnceLock<TagEngine> = OnceLock::new();

/// Usable bytes allocated by threads racing ahead of `init`. Reported in the
/// process document so those bytes are not silently lost.
static BYTES_BEFORE_INIT: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Copy)]
enum ThreadTree {
  /// This thread has not been seen by the profiler yet.
  Unresolved,
  Tracked(&'static ScopeTree),
  /// Registration failed once (registry full); stop retrying.
  Untracked,
}

thread_local! {
  /// Per-thread reentrancy guard: while false, intercepted calls pass
  /// through untracked so the profiler's own allocations never feed back
  /// into the stats.
  static HOOK_ENABLED: Cell<bool> = const { Cell::new(true) };
  static CURRENT_TREE: Cell<ThreadTree> = const { Cell::new(ThreadTree::Unresolved) };
}

/// Clears the calling thread's hook flag for its lifetime and restores the
/// previous value on drop, so disable windows nest correctly.
pub(crate) struct HookDisableGuard {
  saved: bool,
}

impl HookDisableGuard {
  pub(crate) fn new() -> Self {
    let saved = HOOK_ENABLED
      .try_with(|flag| {
        let previous = flag.get();
        flag.set(false);
        previous
      })
      .unwrap_or(false);
    Self { saved }
  }
}

impl Drop for HookDisableGuard {
  fn drop(&mut self) {
    let _ = HOOK_ENABLED.try_with(|flag| flag.set(self.saved));
  }
}

fn hook_enabled() -> bool {
  // try_with: a thread can allocate while its TLS is already being torn
  // down; such calls pass through untracked.
  HOOK_ENABLED.try_with(Cell::get).unwrap_or(false)
}

/// Starts the profiler with default caps (256 nodes x 256 levels per tree,
/// snapshots per `MTAG_SNAPSHOT_INTERVAL_SEC`).
///
/// Idempotent and safe to call from several threads at once: the first
/// caller registers the main tree, everybody else observes it. Returns
/// whether the main tree exists afterwards.
pub fn init() -> bool {
  init_with_config(EngineConfig::default())
}

/// Starts the profiler with explicit caps. See [`init`].
pub fn init_with_config(config: EngineConfig) -> bool {
  let mut first_call = false;
  let engine = ENGINE.get_or_init(|| {
    first_call = true;
    let _guard = HookDisableGuard::new();
    TagEngine {
      registry: TreeRegistry::new(MAX_TREES),
      snapshots: SnapshotScheduler::new(config.resolved_snapshot_interval()),
      config: config.clone(),
    }
  });

  if first_call {
    let _guard = HookDisableGuard::new();
    match engine
      .registry
      .register_main(engine.config.max_tree_nodes, engine.config.max_tree_levels)
    {
      Some(tree) => {
        let _ = CURRENT_TREE.try_with(|cell| cell.set(ThreadTree::Tracked(tree)));
        log::debug!(
          "profiler initialised: {} nodes x {} levels per tree, {} trees max",
          engine.config.max_tree_nodes,
          engine.config.max_tree_levels,
          MAX_TREES
        );
      }
      None => log::warn!("profiler init could not register the main tree"),
    }
  }

  engine.registry.has_main()
}

/// Fences off new tree registrations. Existing trees stay readable; threads
/// arriving after this run untracked.
pub fn shutdown() {
  if let Some(engine) = ENGINE.get() {
    engine.registry.shutdown();
  }
}

/// Charges one intercepted allocation to the calling thread's current scope.
///
/// This is the fast path: no locks, no allocation. The slow branch (first
/// allocation of a brand-new thread) registers that thread's tree once,
/// inside a disable window.
#[inline]
pub(crate) fn on_alloc(kind: CallKind, bytes: u64) {
  if !hook_enabled() {
    return;
  }

  let Some(engine) = ENGINE.get() else {
    BYTES_BEFORE_INIT.fetch_add(bytes, Ordering::Relaxed);
    return;
  };
  if !engine.registry.has_main() {
    BYTES_BEFORE_INIT.fetch_add(bytes, Ordering::Relaxed);
    return;
  }

  if let Some(tree) = thread_tree(engine) {
    tree.track_alloc_in_cursor(kind, bytes);
  }
}

/// Charges one intercepted free to the calling thread's current scope.
#[inline]
pub(crate) fn on_free(bytes: u64) {
  if !hook_enabled() {
    return;
  }

  let Some(engine) = ENGINE.get() else { return };
  if !engine.registry.has_main() {
    return;
  }

  if let Some(tree) = thread_tree(engine) {
    tree.track_free_in_cursor(bytes);
  }
}

fn thread_tree(engine: &'static TagEngine) -> Option<&'static ScopeTree> {
  CURRENT_TREE
    .try_with(|cell| match cell.get() {
      ThreadTree::Tracked(tree) => Some(tree),
      ThreadTree::Untracked => None,
      ThreadTree::Unresolved => {
        // Building the tree allocates; disable tracking around it so the
        // profiler does not account its own pool.
        let _guard = HookDisableGuard::new();
        match engine.registry.register_secondary() {
          Some(tree) => {
            cell.set(ThreadTree::Tracked(tree));
            Some(tree)
          }
          None => {
            cell.set(ThreadTree::Untracked);
            None
          }
        }
      }
    })
    .ok()
    .flatten()
}

/// Tree of the calling thread, creating it if the engine is running and the
/// thread is new. Used by scope push/pop.
pub(crate) fn scope_tree() -> Option<&'static ScopeTree> {
  let engine = ENGINE.get()?;
  if !engine.registry.has_main() {
    return None;
  }
  thread_tree(engine)
}

pub(crate) fn engine_initialised() -> bool {
  ENGINE.get().is_some_and(|engine| engine.registry.has_main())
}

impl TagEngine {
  fn profile_stats(&self) -> ProfileStats {
    let (grand_alloc, _grand_freed) = self.registry.collect_across_trees();

    ProfileStats {
      pid: std::process::id(),
      started_at: self.registry.started_at().to_string(),
      collected_at: linux::wallclock_string(),
      bytes_before_init: BYTES_BEFORE_INIT.load(Ordering::Relaxed),
      self_usage_bytes: self.registry.total_self_memory_bytes(),
      vm_size_bytes: linux::vm_size_bytes().unwrap_or(0),
      vm_rss_bytes: linux::vm_rss_bytes().unwrap_or(0),
      total_tracked_bytes: grand_alloc,
      trees: self.registry.tree_stats(grand_alloc),
    }
  }
}

fn render(stats: &ProfileStats, format: OutputFormat) -> String {
  let json = |stats: &ProfileStats| {
    serde_json::to_string(stats).unwrap_or_else(|err| {
      log::warn!("stats serialisation failed: {err}");
      String::new()
    })
  };

  match format {
    OutputFormat::Json => json(stats),
    OutputFormat::GraphvizDot => output::render_dot(stats),
    OutputFormat::HumanReadable => output::render_human(stats),
    OutputFormat::All => {
      let mut all = json(stats);
      all.push('\n');
      all.push_str(&output::render_dot(stats));
      all.push('\n');
      all.push_str(&output::render_human(stats));
      all
    }
  }
}

/// Collects stats from every tree and renders them in `format`. Empty
/// before `init`.
///
/// Collection itself allocates (it is the documented cold path); those
/// allocations run under a disable window and never show up in the stats.
#[must_use]
pub fn collect_stats(format: OutputFormat) -> String {
  let Some(engine) = ENGINE.get() else {
    return String::new();
  };

  let _guard = HookDisableGuard::new();
  let stats = engine.profile_stats();
  render(&stats, format)
}

/// Machine-friendly flat view: `tid<tid>:<root>(.<scope>)*.<kpi>` keys plus
/// the reserved `.nTrees` entry.
#[must_use]
pub fn collect_stats_map() -> BTreeMap<String, u64> {
  let Some(engine) = ENGINE.get() else {
    return BTreeMap::new();
  };

  let _guard = HookDisableGuard::new();
  engine.registry.collect_as_map()
}

/// Key prefix for one thread's entries in the flat map; the calling
/// thread's own prefix when `tid` is zero.
#[must_use]
pub fn stat_key_prefix_for_thread(tid: i32) -> String {
  let tid = if tid == 0 { linux::gettid() } else { tid };
  format!("tid{tid}:")
}

fn write_one(
  stats: &ProfileStats,
  format: OutputFormat,
  explicit: Option<&Path>,
) -> Result<(), ExportError> {
  let path = export::resolve_output_path(format, explicit)?;
  export::write_text_file(&path, &render(stats, format))
}

/// Writes stats on disk. With no `path` the target comes from
/// `MTAG_STATS_OUTPUT_JSON` / `MTAG_STATS_OUTPUT_GRAPHVIZ_DOT`;
/// [`OutputFormat::All`] writes both documents under one disable window
/// (appending `.json`/`.dot` when an explicit path is given).
///
/// # Errors
///
/// Fails if the profiler is not initialised, no output path can be
/// resolved, or the filesystem write fails.
pub fn write_stats(format: OutputFormat, path: Option<&Path>) -> Result<(), ExportError> {
  let Some(engine) = ENGINE.get() else {
    return Err(ExportError::Io(io::Error::other("profiler not initialised")));
  };

  let _guard = HookDisableGuard::new();
  let stats = engine.profile_stats();

  match format {
    OutputFormat::All => {
      let with_extension = |ext: &str| {
        path.map(|p| PathBuf::from(format!("{}.{ext}", p.display())))
      };
      write_one(
        &stats,
        OutputFormat::Json,
        with_extension("json").as_deref(),
      )?;
      write_one(&stats, OutputFormat::GraphvizDot, with_extension("dot").as_deref())
    }
    single => write_one(&stats, single, path),
  }
}

/// Reconfigures the minimum wall time between interval snapshots.
pub fn set_snapshot_interval(interval: Duration) {
  if let Some(engine) = ENGINE.get() {
    engine.snapshots.set_interval(interval);
  }
}

/// Writes the next numbered snapshot if at least one interval elapsed since
/// the previous one; cheap to call often from any thread. Files are named
/// `<prefix>.<NNNN>.<ext>` with a zero-padded index starting at 0; with no
/// `prefix` the value of `MTAG_SNAPSHOT_OUTPUT_PREFIX_FILE_PATH` is used.
///
/// Returns whether a snapshot was written by this call. Only `Json`,
/// `GraphvizDot` and `All` are valid snapshot formats.
pub fn write_snapshot_if_needed(format: OutputFormat, prefix: Option<&Path>) -> bool {
  let Some(engine) = ENGINE.get() else {
    return false;
  };

  if format == OutputFormat::HumanReadable {
    return false;
  }

  let prefix = match prefix {
    Some(prefix) => prefix.to_path_buf(),
    None => match std::env::var_os(SNAPSHOT_PREFIX_ENV) {
      Some(value) if !value.is_empty() => PathBuf::from(value),
      _ => return false,
    },
  };

  let Some(slot) = engine.snapshots.claim() else {
    return false;
  };

  let _guard = HookDisableGuard::new();
  let stats = engine.profile_stats();

  let write_numbered = |fmt: OutputFormat| {
    let path = PathBuf::from(format!(
      "{}.{:04}.{}",
      prefix.display(),
      slot.index(),
      fmt.file_extension()
    ));
    export::write_text_file(&path, &render(&stats, fmt))
  };

  let result = match format {
    OutputFormat::Json => write_numbered(OutputFormat::Json),
    OutputFormat::GraphvizDot => write_numbered(OutputFormat::GraphvizDot),
    _ => write_numbered(OutputFormat::Json)
      .and_then(|()| write_numbered(OutputFormat::GraphvizDot)),
  };

  match result {
    Ok(()) => {
      slot.commit();
      true
    }
    Err(err) => {
      log::warn!("snapshot write failed: {err}");
      false
    }
  }
}

/// Looks up one of the engine's operating limits by name; 0 for unknown
/// names. Valid names: `max_trees`, `max_tree_nodes`, `max_tree_levels`,
/// `max_node_siblings`.
#[must_use]
pub fn get_limit(name: &str) -> usize {
  let config = ENGINE.get().map(|engine| &engine.config);
  match name {
    "max_trees" => MAX_TREES,
    "max_tree_nodes" => {
      config.map_or(DEFAULT_MAX_TREE_NODES, |config| config.max_tree_nodes)
    }
    "max_tree_levels" => {
      config.map_or(DEFAULT_MAX_TREE_LEVELS, |config| config.max_tree_levels)
    }
    "max_node_siblings" => MAX_SIBLINGS,
    _ => 0,
  }
}

/// Current `VmSize` of the process.
///
/// # Errors
///
/// Propagates `/proc/self/status` read or parse failures.
pub fn vm_size_bytes() -> io::Result<u64> {
  linux::vm_size_bytes()
}

/// Current `VmRSS` of the process.
///
/// # Errors
///
/// Propagates `/proc/self/status` read or parse failures.
pub fn vm_rss_bytes() -> io::Result<u64> {
  linux::vm_rss_bytes()
}

/// The raw allocator's own diagnostic XML (glibc `malloc_info`).
///
/// # Errors
///
/// Propagates stream or `malloc_info` failures.
pub fn malloc_info() -> io::Result<String> {
  linux::malloc_info_string()
}

#[cfg(test)]
mod tests {
  use super::*;

  // The engine global is deliberately left uninitialised in the unit-test
  // binary; end-to-end behaviour lives in tests/ where each scenario owns
  // its own process.

  #[test]
  fn limits_fall_back_to_defaults_before_init() {
    assert_eq!(get_limit("max_trees"), MAX_TREES);
    assert_eq!(get_limit("max_tree_nodes"), DEFAULT_MAX_TREE_NODES);
    assert_eq!(get_limit("max_tree_levels"), DEFAULT_MAX_TREE_LEVELS);
    assert_eq!(get_limit("max_node_siblings"), MAX_SIBLINGS);
    assert_eq!(get_limit("max_flux_capacitors"), 0);
  }

  #[test]
  fn key_prefix_names_the_calling_thread_by_default() {
    let own = stat_key_prefix_for_thread(0);
    assert_eq!(own, format!("tid{}:", linux::gettid()));
    assert_eq!(stat_key_prefix_for_thread(41), "tid41:");
  }

  #[test]
  fn collection_before_init_yields_nothing() {
    assert!(collect_stats(OutputFormat::Json).is_empty());
    assert!(collect_stats_map().is_empty());
    assert!(!write_snapshot_if_needed(OutputFormat::All, None));
    assert!(write_stats(OutputFormat::Json, None).is_err());
  }

  #[test]
  fn disable_guards_nest_and_restore() {
    assert!(hook_enabled());
    {
      let _outer = HookDisableGuard::new();
      assert!(!hook_enabled());
      {
        let _inner = HookDisableGuard::new();
        assert!(!hook_enabled());
      }
      assert!(!hook_enabled(), "inner drop must restore the saved state");
    }
    assert!(hook_enabled(), "outer drop must re-enable the hook");
  }

  #[test]
  fn pre_init_allocations_accumulate() {
    let before = BYTES_BEFORE_INIT.load(Ordering::Relaxed);
    on_alloc(CallKind::Malloc, 123);
    let after = BYTES_BEFORE_INIT.load(Ordering::Relaxed);
    assert_eq!(after - before, 123);

    // Frees before init are simply dropped.
    on_free(99);
  }
}
