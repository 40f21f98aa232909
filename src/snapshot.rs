use super::*;

/// Point-in-time view of one scope and its subtree, lifted out of the live
/// tree under its structure lock.
#[derive(Debug, Clone)]
pub struct ScopeStats {
  pub name: String,
  pub bytes_total_alloc: u64,
  pub bytes_total_freed: u64,
  pub bytes_self_alloc: u64,
  pub bytes_self_freed: u64,
  /// Times this scope was entered and exited.
  pub visits: u64,
  /// Call counts indexed as malloc, realloc, calloc, free.
  pub calls: [u64; 4],
  /// Subtree weight, percentage scaled by `WEIGHT_SCALE`.
  pub weight_total: u64,
  /// Self weight, percentage scaled by `WEIGHT_SCALE`.
  pub weight_self: u64,
  pub children: Vec<ScopeStats>,
}

impl ScopeStats {
  /// Bytes still attributable to this scope alone. Saturating: realloc is
  /// charged as a fresh allocation with no matching free, so freed counters
  /// can apparently overtake allocated ones.
  #[must_use]
  pub fn net_self(&self) -> u64 {
    self.bytes_self_alloc.saturating_sub(self.bytes_self_freed)
  }

  /// Bytes still attributable to this subtree; saturating like `net_self`.
  #[must_use]
  pub fn net_total(&self) -> u64 {
    self.bytes_total_alloc.saturating_sub(self.bytes_total_freed)
  }

  /// Mean self-allocated bytes per enter/exit cycle; zero before the first
  /// exit.
  #[must_use]
  pub fn avg_self_per_visit(&self) -> u64 {
    if self.visits == 0 {
      0
    } else {
      self.bytes_self_alloc / self.visits
    }
  }

  #[must_use]
  pub fn weight_total_pct(&self) -> f64 {
    self.weight_total as f64 / 100.0
  }

  #[must_use]
  pub fn weight_self_pct(&self) -> f64 {
    self.weight_self as f64 / 100.0
  }
}

impl Serialize for ScopeStats {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("nBytesTotalAllocated", &self.bytes_total_alloc)?;
    map.serialize_entry("nBytesSelfAllocated", &self.bytes_self_alloc)?;
    map.serialize_entry("nBytesSelfFreed", &self.bytes_self_freed)?;
    map.serialize_entry("nTimesEnteredAndExited", &self.visits)?;
    map.serialize_entry("nWeightPercentage", &weight_as_json_number(self.weight_total))?;

    for (kind, calls) in CallKind::ALL.iter().zip(self.calls.iter()) {
      map.serialize_entry(kind.stat_key(), calls)?;
    }

    map.serialize_entry("nestedScopes", &NestedScopes(&self.children))?;
    map.end()
  }
}

struct NestedScopes<'a>(&'a [ScopeStats]);

impl Serialize for NestedScopes<'_> {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut map = serializer.serialize_map(Some(self.0.len()))?;
    for child in self.0 {
      map.serialize_entry(&format!("scope_{}", child.name), child)?;
    }
    map.end()
  }
}

/// Point-in-time view of one thread's whole tree.
#[derive(Debug, Clone)]
pub struct TreeStats {
  pub thread_id: i32,
  pub thread_name: String,
  /// Deepest level reached so far (the root sits at level zero).
  pub levels: u64,
  pub nodes_in_use: u64,
  pub max_nodes: u64,
  pub push_failures: u64,
  pub free_tracking_failures: u64,
  pub vmsize_at_creation: u64,
  pub root: ScopeStats,
}

impl Serialize for TreeStats {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("TID", &self.thread_id)?;
    map.serialize_entry("ThreadName", &self.thread_name)?;
    map.serialize_entry("nTreeLevels", &self.levels)?;
    map.serialize_entry("nTreeNodesInUse", &self.nodes_in_use)?;
    map.serialize_entry("nMaxTreeNodes", &self.max_nodes)?;
    map.serialize_entry("nPushNodeFailures", &self.push_failures)?;
    map.serialize_entry("nFreeTrackingFailed", &self.free_tracking_failures)?;
    map.serialize_entry("nVmSizeAtCreation", &self.vmsize_at_creation)?;
    map.serialize_entry(&format!("scope_{}", self.root.name), &self.root)?;
    map.end()
  }
}

/// Point-in-time view of the whole process: header fields plus one tree per
/// thread that allocated since init. Trees are observed one at a time, so
/// cross-tree numbers are eventually consistent rather than a single global
/// instant.
#[derive(Debug, Clone)]
pub struct ProfileStats {
  pub pid: u32,
  pub started_at: String,
  pub collected_at: String,
  pub bytes_before_init: u64,
  pub self_usage_bytes: u64,
  pub vm_size_bytes: u64,
  pub vm_rss_bytes: u64,
  pub total_tracked_bytes: u64,
  pub trees: Vec<TreeStats>,
}

impl Serialize for ProfileStats {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("PID", &self.pid)?;
    map.serialize_entry("tmStartProfiling", &self.started_at)?;
    map.serialize_entry("tmCurrentSnapshot", &self.collected_at)?;

    for tree in &self.trees {
      map.serialize_entry(&format!("tree_for_TID{}", tree.thread_id), tree)?;
    }

    map.serialize_entry("nBytesAllocBeforeInit", &self.bytes_before_init)?;
    map.serialize_entry("nBytesMallocTagSelfUsage", &self.self_usage_bytes)?;
    map.serialize_entry("vmSizeNowBytes", &self.vm_size_bytes)?;
    map.serialize_entry("vmRSSNowBytes", &self.vm_rss_bytes)?;
    map.serialize_entry("nTotalTrackedBytes", &self.total_tracked_bytes)?;
    map.end()
  }
}

// Two-decimal weights with trailing zeros trimmed: 1.20 serialises as 1.2
// and 1.00 as 1, matching what a standard JSON reader writes back.
fn weight_as_json_number(scaled: u64) -> serde_json::Number {
  if scaled % 100 == 0 {
    serde_json::Number::from(scaled / 100)
  } else {
    serde_json::Number::from_f64(scaled as f64 / 100.0)
      .unwrap_or_else(|| serde_json::Number::from(0u64))
  }
}

/// Paces interval snapshots. Callers drive it from any thread; at most one
/// snapshot is written per elapsed interval, with a monotonically growing
/// file index starting at zero for the first snapshot after init.
pub(crate) struct SnapshotScheduler {
  interval_secs: AtomicU64,
  state: Mutex<SchedulerState>,
}

struct SchedulerState {
  last_written: Instant,
  next_index: u32,
}

impl SnapshotScheduler {
  pub(crate) fn new(interval: Duration) -> Self {
    Self {
      interval_secs: AtomicU64::new(interval.as_secs()),
      state: Mutex::new(SchedulerState {
        last_written: Instant::now(),
        next_index: 0,
      }),
    }
  }

  pub(crate) fn set_interval(&self, interval: Duration) {
    self.interval_secs.store(interval.as_secs(), Ordering::Relaxed);
  }

  /// Claims the next snapshot slot if at least one interval elapsed since
  /// the previous write. The slot holds the scheduler lock; dropping it
  /// without `commit` leaves the cadence untouched so a failed write can be
  /// retried on the next call.
  pub(crate) fn claim(&self) -> Option<SnapshotSlot<'_>> {
    let secs = self.interval_secs.load(Ordering::Relaxed);
    if secs == 0 {
      return None;
    }

    let state = match self.state.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    };

    if state.last_written.elapsed() < Duration::from_secs(secs) {
      return None;
    }

    Some(SnapshotSlot { state })
  }
}

pub(crate) struct SnapshotSlot<'a> {
  state: MutexGuard<'a, SchedulerState>,
}

impl SnapshotSlot<'_> {
  pub(crate) fn index(&self) -> u32 {
    self.state.next_index
  }

  pub(crate) fn commit(mut self) {
    self.state.next_index += 1;
    self.state.last_written = Instant::now();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf(name: &str, self_alloc: u64, weight_total: u64) -> ScopeStats {
    ScopeStats {
      name: name.to_string(),
      bytes_total_alloc: self_alloc,
      bytes_total_freed: 0,
      bytes_self_alloc: self_alloc,
      bytes_self_freed: 0,
      visits: 1,
      calls: [1, 0, 0, 0],
      weight_total,
      weight_self: weight_total,
      children: Vec::new(),
    }
  }

  fn sample_profile() -> ProfileStats {
    let mut root = leaf("unit_tests", 100, 10_000);
    root.children.push(leaf("inner", 60, 6_000));

    ProfileStats {
      pid: 4242,
      started_at: "2023-10-01 @ 10:00:00 UTC".into(),
      collected_at: "2023-10-01 @ 10:00:05 UTC".into(),
      bytes_before_init: 7,
      self_usage_bytes: 4096,
      vm_size_bytes: 1 << 20,
      vm_rss_bytes: 1 << 19,
      total_tracked_bytes: 160,
      trees: vec![TreeStats {
        thread_id: 99,
        thread_name: "unit_tests".into(),
        levels: 1,
        nodes_in_use: 2,
        max_nodes: 256,
        push_failures: 0,
        free_tracking_failures: 0,
        vmsize_at_creation: 512,
        root,
      }],
    }
  }

  #[test]
  fn document_layout_matches_the_published_contract() {
    let json = serde_json::to_string(&sample_profile()).expect("serialise");
    let doc: serde_json::Value = serde_json::from_str(&json).expect("parse back");

    assert_eq!(doc["PID"], 4242);
    assert_eq!(doc["nTotalTrackedBytes"], 160);
    assert_eq!(doc["nBytesAllocBeforeInit"], 7);

    let tree = &doc["tree_for_TID99"];
    assert_eq!(tree["TID"], 99);
    assert_eq!(tree["ThreadName"], "unit_tests");
    assert_eq!(tree["nMaxTreeNodes"], 256);
    assert_eq!(tree["nVmSizeAtCreation"], 512);

    let root = &tree["scope_unit_tests"];
    assert_eq!(root["nBytesSelfAllocated"], 100);
    assert_eq!(root["nCallsTo_malloc"], 1);
    assert_eq!(root["nWeightPercentage"], 100);
    assert_eq!(
      root["nestedScopes"]["scope_inner"]["nBytesTotalAllocated"],
      60
    );
  }

  #[test]
  fn weights_trim_trailing_zeros_in_json() {
    assert_eq!(weight_as_json_number(10_000).to_string(), "100");
    assert_eq!(weight_as_json_number(120).to_string(), "1.2");
    assert_eq!(weight_as_json_number(100).to_string(), "1");
    assert_eq!(weight_as_json_number(1234).to_string(), "12.34");
    assert_eq!(weight_as_json_number(0).to_string(), "0");
  }

  #[test]
  fn net_accessors_saturate_at_zero() {
    let mut scope = leaf("x", 10, 0);
    scope.bytes_self_freed = 25;
    scope.bytes_total_freed = 25;
    assert_eq!(scope.net_self(), 0);
    assert_eq!(scope.net_total(), 0);
  }

  #[test]
  fn avg_per_visit_guards_against_zero_visits() {
    let mut scope = leaf("x", 90, 0);
    scope.visits = 3;
    assert_eq!(scope.avg_self_per_visit(), 30);
    scope.visits = 0;
    assert_eq!(scope.avg_self_per_visit(), 0);
  }

  #[test]
  fn scheduler_is_disabled_at_interval_zero() {
    let scheduler = SnapshotScheduler::new(Duration::ZERO);
    assert!(scheduler.claim().is_none());
  }

  #[test]
  fn scheduler_indexes_grow_only_on_commit() {
    let scheduler = SnapshotScheduler::new(Duration::from_secs(1));

    // Fresh scheduler: nothing due until an interval has passed.
    assert!(scheduler.claim().is_none());

    // Pretend an interval passed by rewinding the last-written stamp.
    {
      let mut state = scheduler.state.lock().expect("state");
      state.last_written = Instant::now() - Duration::from_secs(2);
    }

    let slot = scheduler.claim().expect("due");
    assert_eq!(slot.index(), 0);
    drop(slot); // abandoned write: index stays claimed-able

    let slot = scheduler.claim().expect("still due");
    assert_eq!(slot.index(), 0);
    slot.commit();

    assert!(scheduler.claim().is_none(), "cadence resets after commit");
  }
}
