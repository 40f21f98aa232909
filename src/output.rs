use super::*;

/// Serialisation formats understood by the collection and dump entry points.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum OutputFormat {
  Json,
  GraphvizDot,
  HumanReadable,
  /// JSON and DOT together, written under a single hook-disable window.
  All,
}

impl OutputFormat {
  pub(crate) fn file_extension(self) -> &'static str {
    match self {
      Self::Json => "json",
      Self::GraphvizDot => "dot",
      Self::HumanReadable => "txt",
      Self::All => "",
    }
  }
}

/// Decimal pretty-printer: kilo/mega/giga with multiplier 1000, not 1024.
pub(crate) fn pretty_print_bytes(bytes: u64) -> String {
  if bytes < 1_000 {
    format!("{bytes}B")
  } else if bytes < 1_000_000 {
    format!("{}kB", bytes / 1_000)
  } else if bytes < 1_000_000_000 {
    format!("{}MB", bytes / 1_000_000)
  } else {
    format!("{}GB", bytes / 1_000_000_000)
  }
}

/// Scaled weight as a fixed two-decimal percentage string (DOT and human
/// output keep both decimals; only JSON trims).
pub(crate) fn weight_pct_string(scaled: u64) -> String {
  format!("{:.2}", scaled as f64 / 100.0)
}

// Fill shade (colorscheme reds9) and font size keyed off the self weight so
// the eye lands on scopes that allocate a lot themselves.
fn self_weight_style(pct: f64) -> (&'static str, &'static str) {
  if pct < 5.0 {
    ("1", "9")
  } else if pct < 10.0 {
    ("2", "10")
  } else if pct < 20.0 {
    ("3", "12")
  } else if pct < 40.0 {
    ("4", "14")
  } else if pct < 60.0 {
    ("5", "16")
  } else if pct < 80.0 {
    ("6", "18")
  } else {
    ("7", "20")
  }
}

// Node identifiers are double-quoted so DOT-hostile characters like '/'
// survive inside scope names.
fn dot_node(out: &mut String, id: &str, label_lines: &[String], shape: &str, fill: &str, font: &str) {
  out.push_str(&format!("\"{id}\" [label=\"{}\"", label_lines.join("\\n")));
  if !shape.is_empty() {
    out.push_str(&format!(" shape={shape}"));
  }
  if !fill.is_empty() {
    out.push_str(&format!(" fillcolor={fill}"));
  }
  if !font.is_empty() {
    out.push_str(&format!(" fontsize={font}"));
  }
  out.push_str("]\n");
}

fn dot_edge(out: &mut String, from: &str, to: &str, label: Option<&str>) {
  match label {
    Some(label) => out.push_str(&format!("\"{from}\" -> \"{to}\" [label=\"{label}\"]\n")),
    None => out.push_str(&format!("\"{from}\" -> \"{to}\"\n")),
  }
}

fn dot_scope_node_id(thread_id: i32, scope: &ScopeStats) -> String {
  format!("{thread_id}_{}", scope.name)
}

fn dot_scope(out: &mut String, thread_id: i32, scope: &ScopeStats, is_root: bool) {
  let mut labels = Vec::new();
  if is_root {
    labels.push(format!("thread={}", scope.name));
    labels.push(format!("TID={thread_id}"));
  } else {
    labels.push(format!("scope={}", scope.name));
  }

  let total_pct = weight_pct_string(scope.weight_total);
  if scope.bytes_total_alloc != scope.bytes_self_alloc {
    labels.push(format!(
      "total_alloc={} ({total_pct}%)",
      pretty_print_bytes(scope.bytes_total_alloc)
    ));
    labels.push(format!(
      "self_alloc={} ({}%)",
      pretty_print_bytes(scope.bytes_self_alloc),
      weight_pct_string(scope.weight_self)
    ));
  } else {
    labels.push(format!(
      "total_alloc=self_alloc={} ({total_pct}%)",
      pretty_print_bytes(scope.bytes_total_alloc)
    ));
  }

  labels.push(format!("self_freed={}", pretty_print_bytes(scope.bytes_self_freed)));
  labels.push(format!("visited_times={}", scope.visits));
  labels.push(format!(
    "self_alloc_per_visit={}",
    pretty_print_bytes(scope.avg_self_per_visit())
  ));
  for (kind, calls) in CallKind::ALL.iter().zip(scope.calls.iter()) {
    labels.push(format!("{}={calls}", kind.stat_key()));
  }

  let (fill, font) = self_weight_style(scope.weight_self_pct());
  let shape = if is_root { "box" } else { "" };
  let id = dot_scope_node_id(thread_id, scope);
  dot_node(out, &id, &labels, shape, fill, font);

  for child in &scope.children {
    dot_edge(out, &id, &dot_scope_node_id(thread_id, child), None);
  }
  for child in &scope.children {
    dot_scope(out, thread_id, child, false);
  }
}

/// Whole-process Graphviz DOT document: a process-level box, one cluster per
/// tree and weighted edges from the process to each tree root.
pub(crate) fn render_dot(stats: &ProfileStats) -> String {
  let mut out = String::new();
  out.push_str("digraph AllMallocTrees {\n");
  out.push_str("node [colorscheme=reds9 style=filled]\n");

  let process_id = format!("Process_{}", stats.pid);
  let process_labels = vec![
    "Whole process stats".to_string(),
    format!(
      "allocated_mem_before_init={}",
      pretty_print_bytes(stats.bytes_before_init)
    ),
    format!(
      "allocated_mem_by_profiler_itself={}",
      pretty_print_bytes(stats.self_usage_bytes)
    ),
    format!("allocated_mem={}", pretty_print_bytes(stats.total_tracked_bytes)),
    format!("vm_size_now={}", pretty_print_bytes(stats.vm_size_bytes)),
    format!("vm_rss_now={}", pretty_print_bytes(stats.vm_rss_bytes)),
    format!("profiling_start_ts={}", stats.started_at),
    format!("this_snapshot_ts={}", stats.collected_at),
  ];
  dot_node(&mut out, &process_id, &process_labels, "box", "", "");

  for tree in &stats.trees {
    out.push_str(&format!("subgraph cluster_TID{} {{\n", tree.thread_id));
    out.push_str("node [colorscheme=reds9 style=filled]\n");
    out.push_str("labelloc=\"b\"\n");
    out.push_str(&format!(
      "label=\"TID={}\\nnPushNodeFailures={}\\nnTreeNodesInUse/Max={}/{}\\n\"\n",
      tree.thread_id, tree.push_failures, tree.nodes_in_use, tree.max_nodes
    ));
    dot_scope(&mut out, tree.thread_id, &tree.root, true);
    out.push_str("}\n");
  }

  for tree in &stats.trees {
    let weight = format!("w={}%", weight_pct_string(tree.root.weight_total));
    dot_edge(
      &mut out,
      &process_id,
      &dot_scope_node_id(tree.thread_id, &tree.root),
      Some(&weight),
    );
  }

  out.push_str("labelloc=\"b\"\n");
  out.push_str(
    "label=\"Legend:\\nfill shade and font size grow with each scope self-weight\\nprocess edges carry each thread share of tracked bytes\\n\"\n",
  );
  out.push_str("}\n");
  out
}

// Subtrees too small to matter are noise in a terminal dump.
const HUMAN_MIN_BYTES: u64 = 1024;
const HUMAN_MIN_WEIGHT_PCT: f64 = 1.0;
const HUMAN_HOT_WEIGHT_PCT: f64 = 70.0;

fn human_scope(out: &mut String, scope: &ScopeStats, depth: usize) {
  if scope.bytes_total_alloc < HUMAN_MIN_BYTES
    || scope.weight_total_pct() < HUMAN_MIN_WEIGHT_PCT
  {
    return;
  }

  let annotation = if scope.weight_total_pct() >= HUMAN_HOT_WEIGHT_PCT {
    if scope.children.is_empty() {
      " [hot leaf]"
    } else {
      " [hot path]"
    }
  } else {
    ""
  };

  out.push_str(&format!(
    "{:indent$}{}: total={} ({}%), self={}, freed={}, visits={}{annotation}\n",
    "",
    scope.name,
    pretty_print_bytes(scope.bytes_total_alloc),
    weight_pct_string(scope.weight_total),
    pretty_print_bytes(scope.bytes_self_alloc),
    pretty_print_bytes(scope.bytes_self_freed),
    scope.visits,
    indent = depth * 2,
  ));

  for child in &scope.children {
    human_scope(out, child, depth + 1);
  }
}

/// Terminal-friendly rendition: a process header plus one indented tree per
/// thread.
pub(crate) fn render_human(stats: &ProfileStats) -> String {
  let mut out = String::new();
  out.push_str(&format!("Whole process memory profile (PID {})\n", stats.pid));
  out.push_str(&format!("  profiling started    : {}\n", stats.started_at));
  out.push_str(&format!("  snapshot taken       : {}\n", stats.collected_at));
  out.push_str(&format!(
    "  tracked bytes        : {}\n",
    pretty_print_bytes(stats.total_tracked_bytes)
  ));
  out.push_str(&format!(
    "  allocated before init: {}\n",
    pretty_print_bytes(stats.bytes_before_init)
  ));
  out.push_str(&format!(
    "  profiler self usage  : {}\n",
    pretty_print_bytes(stats.self_usage_bytes)
  ));
  out.push_str(&format!(
    "  VmSize / VmRSS now   : {} / {}\n",
    pretty_print_bytes(stats.vm_size_bytes),
    pretty_print_bytes(stats.vm_rss_bytes)
  ));

  for tree in &stats.trees {
    out.push_str(&format!(
      "\nThread {} (TID {}): nodes {}/{}, levels {}, push failures {}, free-tracking failures {}\n",
      tree.thread_name,
      tree.thread_id,
      tree.nodes_in_use,
      tree.max_nodes,
      tree.levels,
      tree.push_failures,
      tree.free_tracking_failures
    ));
    human_scope(&mut out, &tree.root, 1);
  }

  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn scope(name: &str, total: u64, self_alloc: u64, weight_total: u64, weight_self: u64) -> ScopeStats {
    ScopeStats {
      name: name.to_string(),
      bytes_total_alloc: total,
      bytes_total_freed: 0,
      bytes_self_alloc: self_alloc,
      bytes_self_freed: 0,
      visits: 2,
      calls: [3, 0, 0, 1],
      weight_total,
      weight_self,
      children: Vec::new(),
    }
  }

  fn profile() -> ProfileStats {
    let mut root = scope("worker", 200_000, 50_000, 10_000, 2_500);
    root.children.push(scope("codec", 150_000, 150_000, 7_500, 7_500));
    root.children.push(scope("tiny", 100, 100, 1, 1));

    ProfileStats {
      pid: 7,
      started_at: "2023-10-02 @ 09:00:00 UTC".into(),
      collected_at: "2023-10-02 @ 09:00:05 UTC".into(),
      bytes_before_init: 0,
      self_usage_bytes: 40_960,
      vm_size_bytes: 5_000_000,
      vm_rss_bytes: 2_000_000,
      total_tracked_bytes: 200_000,
      trees: vec![TreeStats {
        thread_id: 31,
        thread_name: "worker".into(),
        levels: 1,
        nodes_in_use: 3,
        max_nodes: 256,
        push_failures: 0,
        free_tracking_failures: 0,
        vmsize_at_creation: 8192,
        root,
      }],
    }
  }

  #[test]
  fn bytes_pretty_print_in_decimal_units() {
    assert_eq!(pretty_print_bytes(999), "999B");
    assert_eq!(pretty_print_bytes(1_000), "1kB");
    assert_eq!(pretty_print_bytes(999_999), "999kB");
    assert_eq!(pretty_print_bytes(2_500_000), "2MB");
    assert_eq!(pretty_print_bytes(3_000_000_000), "3GB");
  }

  #[test]
  fn weight_styles_follow_the_shade_table() {
    assert_eq!(self_weight_style(0.0), ("1", "9"));
    assert_eq!(self_weight_style(4.99), ("1", "9"));
    assert_eq!(self_weight_style(5.0), ("2", "10"));
    assert_eq!(self_weight_style(19.99), ("3", "12"));
    assert_eq!(self_weight_style(40.0), ("5", "16"));
    assert_eq!(self_weight_style(79.99), ("6", "18"));
    assert_eq!(self_weight_style(80.0), ("7", "20"));
    assert_eq!(self_weight_style(100.0), ("7", "20"));
  }

  #[test]
  fn dot_document_has_the_expected_skeleton() {
    let dot = render_dot(&profile());

    assert!(dot.starts_with("digraph AllMallocTrees {\n"));
    assert!(dot.contains("node [colorscheme=reds9 style=filled]"));
    assert!(dot.contains("subgraph cluster_TID31 {"));
    assert!(dot.contains("\"Process_7\" [label=\"Whole process stats"));
    assert!(dot.contains("\"31_worker\" [label=\"thread=worker\\nTID=31"));
    assert!(dot.contains("shape=box"));
    // Parent-child edges are bare; only process edges carry a weight.
    assert!(dot.contains("\"31_worker\" -> \"31_codec\"\n"));
    assert!(dot.contains("\"Process_7\" -> \"31_worker\" [label=\"w=100.00%\"]"));
    assert!(dot.trim_end().ends_with('}'));
  }

  #[test]
  fn dot_quotes_identifiers_with_hostile_characters() {
    let mut stats = profile();
    stats.trees[0].root.children[0].name = "dummy0/1".into();
    let dot = render_dot(&stats);
    assert!(dot.contains("\"31_dummy0/1\""));
  }

  #[test]
  fn dot_scales_fonts_by_self_weight() {
    let dot = render_dot(&profile());
    // codec has 75% self weight: shade 6, font 18.
    assert!(dot.contains("fillcolor=6 fontsize=18"));
  }

  #[test]
  fn human_output_hides_noise_and_marks_hot_scopes() {
    let text = render_human(&profile());

    assert!(text.contains("Whole process memory profile (PID 7)"));
    assert!(text.contains("Thread worker (TID 31)"));
    assert!(text.contains("  worker: total=200kB (100.00%)"));
    assert!(text.contains(" [hot path]"));
    assert!(text.contains("    codec: total=150kB (75.00%)"));
    assert!(text.contains(" [hot leaf]"));
    assert!(!text.contains("tiny"), "sub-1kB subtree must be hidden");
  }
}
