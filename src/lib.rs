//! Always-on, scope-tagged memory profiler for Linux processes.
//!
//! Applications open [`MallocScope`] guards around interesting regions of
//! code; every allocation the interposer sees is charged to the innermost
//! open scope of the calling thread, building one tree of tagged counters
//! per thread. The whole registry of trees can be dumped on demand as JSON,
//! Graphviz DOT or a human-readable text tree, or written periodically as
//! numbered snapshots.
//!
//! The C allocation family is intercepted either through the companion
//! `mtag-preload` cdylib (ELF symbol interposition via `LD_PRELOAD`) or, for
//! pure-Rust programs, through the [`TagAllocator`] global-allocator
//! wrapper. Either way the fast path is O(1), lock-free and never allocates.

mod config;
mod engine;
mod export;
mod hooks;
mod linux;
mod node;
mod output;
mod registry;
mod scope;
mod snapshot;
mod tree;

use {
  serde::{ser::SerializeMap, Serialize, Serializer},
  std::{
    env,
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
    sync::{
      atomic::{AtomicU64, Ordering},
      Mutex, MutexGuard,
    },
    time::{Duration, Instant},
  },
};

pub use {
  config::{
    EngineConfig, MAX_NAME_LEN, MAX_SIBLINGS, MAX_TREES, SNAPSHOT_INTERVAL_ENV,
    SNAPSHOT_PREFIX_ENV, STATS_OUTPUT_DOT_ENV, STATS_OUTPUT_JSON_ENV, WEIGHT_SCALE,
  },
  engine::{
    collect_stats, collect_stats_map, get_limit, init, init_with_config, malloc_info,
    set_snapshot_interval, shutdown, stat_key_prefix_for_thread, vm_rss_bytes,
    vm_size_bytes, write_snapshot_if_needed, write_stats,
  },
  export::ExportError,
  hooks::{
    intercepted_calloc, intercepted_free, intercepted_malloc, intercepted_memalign,
    intercepted_pvalloc, intercepted_realloc, intercepted_valloc, LibcAllocator,
    RawAllocator, TagAllocator,
  },
  node::CallKind,
  output::OutputFormat,
  scope::MallocScope,
  snapshot::{ProfileStats, ScopeStats, TreeStats},
};
