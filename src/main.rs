use std::alloc::System;
use std::collections::BTreeMap;
use std::thread;

use mtag::{MallocScope, OutputFormat, TagAllocator};

#[global_allocator]
static GLOBAL: TagAllocator<System> = TagAllocator::new(System);

fn func_a(thread_id: usize) {
  let _scope = MallocScope::new("FuncA");

  // Each worker allocates a slightly different amount to make the dump more
  // interesting.
  let _buffer = Vec::<u8>::with_capacity(100 + thread_id * 1024);
  func_b(thread_id);
}

fn func_b(thread_id: usize) {
  let _scope = MallocScope::new("FuncB");

  // A map insert storm shows up as a shower of small allocations.
  let mut map = BTreeMap::new();
  for i in 0..1000 + thread_id * 1000 {
    map.insert(format!("onemorekey{i}"), i as u64);
  }
}

fn worker(thread_id: usize) {
  let _scope = MallocScope::new("ExampleThread");

  func_a(thread_id);
  let _small = Vec::<u8>::with_capacity(5);
  func_b(thread_id);
}

fn non_instrumented() {
  // No scopes at all: everything charges this thread's root node.
  let mut garbage = Vec::new();
  for i in 0..1000 {
    garbage.push(format!("{:0100}", i));
  }
}

fn main() {
  mtag::init();

  println!("Hello from PID {}", std::process::id());
  println!(
    "main thread VmSize: {} bytes",
    mtag::vm_size_bytes().unwrap_or(0)
  );

  let mut handles = Vec::new();
  for thread_id in 0..2 {
    let handle = thread::Builder::new()
      .name(format!("ExampleThr/{thread_id}"))
      .spawn(move || worker(thread_id))
      .expect("spawn worker");
    handles.push(handle);
  }
  handles.push(
    thread::Builder::new()
      .name("NonInstrThr".to_string())
      .spawn(non_instrumented)
      .expect("spawn non-instrumented"),
  );

  for handle in handles {
    let _ = handle.join();
  }

  if mtag::write_stats(OutputFormat::All, None).is_ok() {
    println!(
      "wrote stats to {} and {}",
      std::env::var(mtag::STATS_OUTPUT_JSON_ENV).unwrap_or_default(),
      std::env::var(mtag::STATS_OUTPUT_DOT_ENV).unwrap_or_default()
    );
  }

  println!();
  println!("{}", mtag::collect_stats(OutputFormat::HumanReadable));
}
