use crate::engine;
use crate::node::ScopeName;

/// RAII handle for one tagged scope: construction pushes the tag onto the
/// calling thread's tree, drop pops it again.
///
/// Every allocation intercepted between the two is charged to the tag's
/// node. When the push fails (level, sibling or pool cap) the guard
/// remembers it and skips the pop, so allocations keep charging the deepest
/// scope that could be entered.
///
/// Scopes must nest strictly; letting two guards' lifetimes overlap in any
/// other way is a logic error. Creating a scope before the engine is
/// initialised is a debug assertion and a release no-op.
#[must_use = "a scope only tags allocations while it lives; bind it with `let _scope = ...`"]
pub struct MallocScope {
  pushed: bool,
}

impl MallocScope {
  /// Enters the scope `name`. Names longer than `MAX_NAME_LEN - 1` bytes
  /// are truncated.
  pub fn new(name: &str) -> Self {
    Self::enter(name.as_bytes())
  }

  /// Enters the scope `"<class_name>::<function_name>"`, truncated as a
  /// whole.
  pub fn with_class(class_name: &str, function_name: &str) -> Self {
    let name = ScopeName::qualified(class_name.as_bytes(), function_name.as_bytes());
    Self::enter(name.as_bytes())
  }

  // Push without allocating: the engine may not know this thread yet, in
  // which case the tree is registered here (under the hook-disable guard)
  // so tags opened before the thread's first allocation still attach.
  fn enter(name: &[u8]) -> Self {
    debug_assert!(
      engine::engine_initialised(),
      "MallocScope created before the profiler was initialised"
    );

    let Some(tree) = engine::scope_tree() else {
      return Self { pushed: false };
    };

    Self {
      pushed: tree.push(name),
    }
  }
}

impl Drop for MallocScope {
  fn drop(&mut self) {
    if self.pushed {
      if let Some(tree) = engine::scope_tree() {
        tree.pop();
      }
    }
  }
}
