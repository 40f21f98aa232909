//! Interposer coherence: intercepted calls charge at least the requested
//! size (the usable-size measure) to the active scope, and the paired free
//! charges the same measure back.
//!
//! No global-allocator wrapper here: only the explicitly intercepted calls
//! are tracked, so call counters can be asserted exactly.

use std::thread;

use mtag::{LibcAllocator, MallocScope, OutputFormat};

const SIZES: [usize; 3] = [1, 1023, 10_000_000];

fn scope_name(size: usize) -> String {
  format!("malloc_{size}")
}

#[test]
fn intercepted_calls_charge_usable_sizes() {
  assert!(mtag::init());

  let worker = thread::Builder::new()
    .name("unit_tests".into())
    .spawn(|| {
      for size in SIZES {
        let name = scope_name(size);
        let _scope = MallocScope::new(&name);
        // SAFETY: plain malloc/free pairing on the libc heap.
        unsafe {
          let ptr = mtag::intercepted_malloc(&LibcAllocator, size);
          assert!(!ptr.is_null());
          mtag::intercepted_free(&LibcAllocator, ptr);
        }
      }

      let stats = mtag::collect_stats_map();
      let prefix = mtag::stat_key_prefix_for_thread(0);

      for size in SIZES {
        let path = format!("{prefix}unit_tests.{}", scope_name(size));
        assert_eq!(
          stats[&format!("{path}.nCallsTo_malloc")],
          1,
          "exactly one interposed malloc in {path}"
        );
        assert!(
          stats[&format!("{path}.nBytesSelfAllocated")] >= size as u64,
          "usable size is at least the requested size"
        );
        assert_eq!(stats[&format!("{path}.nCallsTo_free")], 1);
        assert!(stats[&format!("{path}.nBytesSelfFreed")] >= size as u64);
      }

      assert_eq!(stats[&format!("{prefix}.nFreeTrackingFailed")], 0);
    })
    .expect("spawn worker");

  worker.join().expect("worker panicked");

  // The produced documents load cleanly (JSON by a standard reader, DOT by
  // shape) and cover both trees.
  let json = mtag::collect_stats(OutputFormat::Json);
  let doc: serde_json::Value = serde_json::from_str(&json).expect("valid JSON document");
  assert_eq!(doc["PID"], u64::from(std::process::id()));
  assert!(doc["nTotalTrackedBytes"].as_u64().expect("tracked bytes") >= 10_000_000);
  let tree_keys: Vec<&String> = doc
    .as_object()
    .expect("document object")
    .keys()
    .filter(|key| key.starts_with("tree_for_TID"))
    .collect();
  assert!(tree_keys.len() >= 2, "main tree plus the worker tree");

  let dot = mtag::collect_stats(OutputFormat::GraphvizDot);
  assert!(dot.starts_with("digraph AllMallocTrees {"));
  assert!(dot.contains("unit_tests"));

  let human = mtag::collect_stats(OutputFormat::HumanReadable);
  assert!(human.contains("Whole process memory profile"));
  assert!(human.contains("unit_tests"));
}
