//! Whole-process behaviour with several instrumented threads: every tree
//! lands in the document, subtree totals add up exactly, weights are
//! normalised against the process-wide byte total and counters only ever
//! grow.

use std::alloc::System;
use std::thread;

use mtag::{MallocScope, OutputFormat, TagAllocator};

#[global_allocator]
static GLOBAL: TagAllocator<System> = TagAllocator::new(System);

fn func_a(thread_id: usize) {
  let _scope = MallocScope::new("FuncA");
  let _buffer = Vec::<u8>::with_capacity(100 + thread_id * 1024);
  func_b(thread_id);
}

fn func_b(thread_id: usize) {
  let _scope = MallocScope::new("FuncB");
  let mut keys = Vec::new();
  for i in 0..200 + thread_id * 100 {
    keys.push(format!("onemorekey{i}"));
  }
}

fn worker(thread_id: usize) {
  let _scope = MallocScope::new("ExampleThread");
  func_a(thread_id);
  let _small = Vec::<u8>::with_capacity(5);
  func_b(thread_id);
}

// nBytesTotalAllocated must equal self plus the children's totals on every
// node of a freshly collected document.
fn assert_subtree_totals(scope: &serde_json::Value) {
  let total = scope["nBytesTotalAllocated"].as_u64().expect("total");
  let own = scope["nBytesSelfAllocated"].as_u64().expect("self");

  let nested = scope["nestedScopes"].as_object().expect("nestedScopes");
  let children_total: u64 = nested
    .values()
    .map(|child| child["nBytesTotalAllocated"].as_u64().expect("child total"))
    .sum();

  assert_eq!(total, own + children_total);

  for child in nested.values() {
    assert_subtree_totals(child);
  }
}

#[test]
fn trees_aggregate_coherently_across_threads() {
  assert!(mtag::init());

  let mut handles = Vec::new();
  for thread_id in 0..2 {
    handles.push(
      thread::Builder::new()
        .name(format!("ExampleThr/{thread_id}"))
        .spawn(move || worker(thread_id))
        .expect("spawn worker"),
    );
  }
  for handle in handles {
    handle.join().expect("worker panicked");
  }

  let json = mtag::collect_stats(OutputFormat::Json);
  let doc: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
  let document = doc.as_object().expect("document object");

  // One tree per worker plus at least the main tree.
  let tree_keys: Vec<&String> = document
    .keys()
    .filter(|key| key.starts_with("tree_for_TID"))
    .collect();
  assert!(tree_keys.len() >= 3, "two workers plus the main tree");

  let mut worker_trees = 0;
  let mut root_weight_sum = 0.0;
  for key in &tree_keys {
    let tree = &document[key.as_str()];
    let name = tree["ThreadName"].as_str().expect("thread name");
    let root = &tree[format!("scope_{name}")];

    root_weight_sum += root["nWeightPercentage"].as_f64().expect("weight");
    if name.starts_with("ExampleThr/") {
      worker_trees += 1;

      // The workers are joined, so their counters are quiescent and the
      // totals invariant must hold exactly.
      assert_subtree_totals(root);

      // The worker's scope chain is present and FuncB was entered twice
      // (once under FuncA, once directly).
      let example = &root["nestedScopes"]["scope_ExampleThread"];
      let direct_b = &example["nestedScopes"]["scope_FuncB"];
      assert_eq!(direct_b["nTimesEnteredAndExited"], 1);
      let via_a = &example["nestedScopes"]["scope_FuncA"]["nestedScopes"]["scope_FuncB"];
      assert_eq!(via_a["nTimesEnteredAndExited"], 1);
      assert!(via_a["nBytesSelfAllocated"].as_u64().expect("bytes") > 0);
    }
  }
  assert_eq!(worker_trees, 2);

  // Weights are normalised to the grand total, so the tree roots account
  // for (almost) the whole pie; rounding trims at most a percent.
  assert!(
    root_weight_sum > 99.0 && root_weight_sum < 102.0,
    "root weights sum to ~100%, got {root_weight_sum}"
  );

  // Counters are monotically non-decreasing between two collections.
  let before = mtag::collect_stats_map();
  {
    let _scope = MallocScope::new("second_round");
    let _more = Vec::<u8>::with_capacity(4096);
  }
  let after = mtag::collect_stats_map();

  for (key, value) in &before {
    if key.contains(".nBytes") || key.contains(".nCallsTo_") || key.contains(".nTimes") {
      if let Some(later) = after.get(key) {
        assert!(later >= value, "counter {key} went backwards");
      }
    }
  }
  // The second-round scope showed up under this thread's tree with its
  // allocation charged.
  let prefix = mtag::stat_key_prefix_for_thread(0);
  let (key, bytes) = after
    .iter()
    .find(|(key, _)| {
      key.starts_with(&prefix) && key.ends_with(".second_round.nBytesSelfAllocated")
    })
    .expect("second_round scope recorded");
  assert!(*bytes >= 4096, "{key} should carry the 4096-byte buffer");
}
