// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Resolves a root [`Future`] into a DAG of scheduled nodes.
//!
//! Grounded on `examples/original_source/taskproc/graph.py`'s resolution
//! pass: walk every reachable future, fingerprint each unique origin,
//! assign it a stable id, materialize its [`echo_cas::InstanceDirectory`],
//! and decide whether it needs to run. The walk here is a recursive
//! descent rather than an explicit queue, which gives cycle detection and
//! deduplication for free via a pointer-identity-keyed memo table, and
//! naturally visits a task's slots depth-first in the lexicographic order
//! `args()`'s `BTreeMap` already provides.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use echo_canon::{projection_ref, task_ref, to_canonical_bytes, CanonError};
use echo_cas::{CasError, Database, InstanceDirectory};

use crate::future::{project_value, ArgValue, Const, DynTask, Future, NodeKey};

/// Errors raised while resolving a future graph.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// A projection key or argument value could not be canonicalized.
    #[error("[CANON_INVALID_KEY] {0}")]
    InvalidKey(String),
    /// A future is reachable from itself through its own declared inputs.
    #[error("[CYCLE_DETECTED] cycle detected while resolving {class_name}")]
    CycleDetected {
        /// The class name of the task at which the cycle was detected.
        class_name: &'static str,
    },
    /// The cache layer failed while assigning an id or touching a result.
    #[error(transparent)]
    Cas(#[from] CasError),
}

impl From<CanonError> for ResolveError {
    fn from(err: CanonError) -> Self {
        match err {
            CanonError::InvalidKey(msg) => Self::InvalidKey(msg),
        }
    }
}

/// What a task's input slot is ultimately bound to, once projections have
/// been resolved to their origin.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A value known without scheduling anything: a bare JSON literal, or a
    /// (possibly projected) [`Const`].
    Literal(Value),
    /// A (possibly projected) task node. The scheduler reads the origin's
    /// result and, if `path` is non-empty, indexes into it before handing
    /// the value to the dependent task.
    Origin {
        /// The upstream scheduled node.
        key: NodeKey,
        /// Projection path to apply to the origin's result, outermost-last.
        path: Vec<Value>,
    },
}

/// One resolved node in the DAG: a task, its bound inputs, and its cache
/// state.
pub struct ResolvedNode {
    /// This node's identity.
    pub key: NodeKey,
    /// The task implementation backing this node.
    pub task: Arc<dyn DynTask>,
    /// Slot name to bound input, in lexicographic slot order.
    pub deps: BTreeMap<String, Binding>,
    /// Rate-limit channel tags, always including the class name first.
    pub channels: Vec<String>,
    /// Whether the scheduler must (re)run this node before its result can
    /// be trusted.
    pub needs_run: bool,
    /// This node's on-disk instance directory.
    pub instance_dir: InstanceDirectory,
}

/// What the root of a resolved graph ultimately is.
pub enum RootSpec {
    /// The root resolved to a value with nothing to schedule (a bare
    /// literal or constant, possibly projected).
    Literal(Value),
    /// The root resolved to a (possibly projected) scheduled node.
    Node {
        /// The scheduled node to read from.
        key: NodeKey,
        /// Projection path to apply to that node's result.
        path: Vec<Value>,
    },
}

/// The output of [`resolve`]: every node reachable from the root, plus what
/// the root itself denotes.
pub struct ResolvedGraph {
    /// What the root resolves to.
    pub root: RootSpec,
    /// Every scheduled node, keyed by identity, in first-discovery order.
    pub nodes: BTreeMap<NodeKey, ResolvedNode>,
}

/// What a single resolved future denotes: its reference-object origin
/// (before projection), the projection path accumulated on top of it, and
/// whether that origin is a scheduled node or an inline value.
struct Resolved {
    origin_ref: Value,
    path: Vec<Value>,
    target: Target,
}

enum Target {
    Inline(Value),
    Scheduled(NodeKey, PathBuf),
}

fn task_identity(task: &Arc<dyn DynTask>) -> usize {
    (Arc::as_ptr(task) as *const ()) as usize
}

/// Walks a future graph, assigning ids and materializing instance
/// directories as it goes.
struct Resolver<'a> {
    databases: &'a mut HashMap<&'static str, Database>,
    cache_root: &'a Path,
    visiting: HashSet<usize>,
    memo: HashMap<usize, (NodeKey, PathBuf, Value)>,
    nodes: BTreeMap<NodeKey, ResolvedNode>,
}

impl<'a> Resolver<'a> {
    fn new(databases: &'a mut HashMap<&'static str, Database>, cache_root: &'a Path) -> Self {
        Self {
            databases,
            cache_root,
            visiting: HashSet::new(),
            memo: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    fn database_for(&mut self, class_name: &'static str) -> Result<&Database, ResolveError> {
        match self.databases.entry(class_name) {
            std::collections::hash_map::Entry::Occupied(e) => Ok(e.into_mut()),
            std::collections::hash_map::Entry::Vacant(e) => {
                let db = Database::open(self.cache_root, class_name)?;
                Ok(e.insert(db))
            }
        }
    }

    fn resolve_future(&mut self, future: &Future) -> Result<Resolved, ResolveError> {
        match future {
            Future::Const(c) => Ok(Resolved {
                origin_ref: c.into_reference()?,
                path: Vec::new(),
                target: Target::Inline(c.value().clone()),
            }),
            Future::Task(task) => {
                let (key, dir_path, fingerprint) = self.resolve_task(task)?;
                Ok(Resolved {
                    origin_ref: fingerprint,
                    path: Vec::new(),
                    target: Target::Scheduled(key, dir_path),
                })
            }
            Future::Mapped(mapped) => {
                let key = mapped.key();
                if !echo_canon::is_json_literal(key) {
                    return Err(ResolveError::InvalidKey(format!(
                        "projection key must be a JSON literal, got {key}"
                    )));
                }
                let mut inner = self.resolve_future(mapped.parent())?;
                inner.path.push(key.clone());
                Ok(inner)
            }
        }
    }

    /// Resolves `task` to its `(NodeKey, instance directory path, fingerprint
    /// reference object)`, materializing it (and every future it depends on)
    /// along the way. Idempotent per task identity and per fingerprint.
    fn resolve_task(
        &mut self,
        task: &Arc<dyn DynTask>,
    ) -> Result<(NodeKey, PathBuf, Value), ResolveError> {
        let identity = task_identity(task);
        if let Some(cached) = self.memo.get(&identity) {
            return Ok(cached.clone());
        }
        if !self.visiting.insert(identity) {
            tracing::warn!(class = %task.class_name(), "cycle detected while resolving task graph");
            return Err(ResolveError::CycleDetected {
                class_name: task.class_name(),
            });
        }

        let class_name = task.class_name();
        let mut args_map = serde_json::Map::new();
        let mut deps: BTreeMap<String, Binding> = BTreeMap::new();
        let mut dependencies: BTreeMap<String, PathBuf> = BTreeMap::new();

        for (slot, arg) in task.args() {
            match arg {
                ArgValue::Literal(value) => {
                    args_map.insert(slot.clone(), value.clone());
                    deps.insert(slot, Binding::Literal(value));
                }
                ArgValue::Future(future) => {
                    let resolved = self.resolve_future(&future)?;
                    let arg_json = if resolved.path.is_empty() {
                        resolved.origin_ref.clone()
                    } else {
                        projection_ref(resolved.origin_ref.clone(), &resolved.path)?
                    };
                    args_map.insert(slot.clone(), arg_json);
                    let binding = match resolved.target {
                        Target::Inline(value) => {
                            let projected = if resolved.path.is_empty() {
                                value
                            } else {
                                project_value(&value, &resolved.path)?
                            };
                            Binding::Literal(projected)
                        }
                        Target::Scheduled(key, dir_path) => {
                            dependencies.insert(slot.clone(), dir_path);
                            Binding::Origin {
                                key,
                                path: resolved.path,
                            }
                        }
                    };
                    deps.insert(slot, binding);
                }
            }
        }

        let fingerprint = task_ref(class_name, Value::Object(args_map));
        let fingerprint_bytes = to_canonical_bytes(&fingerprint)?;

        let database = self.database_for(class_name)?;
        let (id, instance_dir) = database.instance(&fingerprint_bytes, dependencies)?;
        let key = NodeKey { class_name, id };

        self.visiting.remove(&identity);
        self.memo
            .insert(identity, (key, instance_dir.path().to_path_buf(), fingerprint.clone()));

        if let std::collections::btree_map::Entry::Vacant(e) = self.nodes.entry(key) {
            let source_timestamp = database.touch_source(&task.source_token())?;
            let needs_run = compute_needs_run(&instance_dir, source_timestamp, &deps, &self.nodes)?;

            let mut channels = vec![class_name.to_string()];
            channels.extend(task.channels());

            tracing::debug!(
                class = %class_name,
                id = key.id,
                needs_run,
                "resolved node"
            );

            e.insert(ResolvedNode {
                key,
                task: Arc::clone(task),
                deps,
                channels,
                needs_run,
                instance_dir,
            });
        }

        Ok((key, self.memo[&identity].1.clone(), fingerprint))
    }
}

/// Implements spec.md §4.F's three literal rules, plus one addition: a node
/// also needs to run if any upstream dependency itself needs to run. The
/// literal rules alone only catch upstream staleness that has *already*
/// been written to disk as a newer result timestamp; within a single
/// resolution pass an upstream that is about to be recomputed hasn't
/// written that timestamp yet, so without this rule a downstream node
/// could be judged cached even though its input is stale. See
/// `pascal_recurrence` in DESIGN.md for the worked example this rule is
/// grounded on.
fn compute_needs_run(
    instance_dir: &InstanceDirectory,
    source_timestamp: std::time::SystemTime,
    deps: &BTreeMap<String, Binding>,
    resolved_so_far: &BTreeMap<NodeKey, ResolvedNode>,
) -> Result<bool, ResolveError> {
    if !instance_dir.has_result() {
        return Ok(true);
    }
    let own_timestamp = instance_dir.result_timestamp()?;

    for binding in deps.values() {
        if let Binding::Origin { key, .. } = binding {
            let Some(upstream) = resolved_so_far.get(key) else {
                continue;
            };
            if upstream.needs_run {
                return Ok(true);
            }
            if upstream.instance_dir.has_result() {
                let upstream_timestamp = upstream.instance_dir.result_timestamp()?;
                if upstream_timestamp > own_timestamp {
                    return Ok(true);
                }
            }
        }
    }

    Ok(source_timestamp > own_timestamp)
}

/// Resolves `root`, materializing every instance directory it transitively
/// depends on and computing `needs_run` for each.
///
/// `databases` is the caller's per-class database registry; entries are
/// created lazily on first sight of a class and left in the map for reuse
/// across calls.
///
/// # Errors
///
/// Returns [`ResolveError::InvalidKey`] if a projection key or argument
/// value is not JSON-representable, [`ResolveError::CycleDetected`] if a
/// task is reachable from itself, or [`ResolveError::Cas`] if id assignment
/// or instance materialization fails.
pub fn resolve(
    root: &Future,
    databases: &mut HashMap<&'static str, Database>,
    cache_root: &Path,
) -> Result<ResolvedGraph, ResolveError> {
    let mut resolver = Resolver::new(databases, cache_root);
    let resolved = resolver.resolve_future(root)?;
    let root_spec = match resolved.target {
        Target::Inline(value) => {
            let projected = if resolved.path.is_empty() {
                value
            } else {
                project_value(&value, &resolved.path)?
            };
            RootSpec::Literal(projected)
        }
        Target::Scheduled(key, _) => RootSpec::Node {
            key,
            path: resolved.path,
        },
    };
    Ok(ResolvedGraph {
        root: root_spec,
        nodes: resolver.nodes,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread::sleep;
    use std::time::Duration;

    struct LeafTask {
        n: i64,
    }

    impl DynTask for LeafTask {
        fn class_name(&self) -> &'static str {
            "LeafTask"
        }

        fn source_token(&self) -> String {
            "v1".to_string()
        }

        fn args(&self) -> BTreeMap<String, ArgValue> {
            let mut m = BTreeMap::new();
            m.insert("n".to_string(), ArgValue::Literal(json!(self.n)));
            m
        }

        fn run(&self, _inputs: &BTreeMap<String, Value>, _scratch_dir: &std::path::Path) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
            Ok(json!(self.n))
        }
    }

    struct SumTask {
        a: Future,
        b: Future,
    }

    impl DynTask for SumTask {
        fn class_name(&self) -> &'static str {
            "SumTask"
        }

        fn source_token(&self) -> String {
            "v1".to_string()
        }

        fn args(&self) -> BTreeMap<String, ArgValue> {
            let mut m = BTreeMap::new();
            m.insert("a".to_string(), ArgValue::Future(self.a.clone()));
            m.insert("b".to_string(), ArgValue::Future(self.b.clone()));
            m
        }

        fn run(&self, inputs: &BTreeMap<String, Value>, _scratch_dir: &std::path::Path) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
            let a = inputs.get("a").and_then(Value::as_i64).unwrap_or_default();
            let b = inputs.get("b").and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(a + b))
        }
    }

    fn sum_of_two_fives() -> (Future, HashMap<&'static str, Database>) {
        let a = Future::task(Arc::new(LeafTask { n: 5 }));
        let b = Future::task(Arc::new(LeafTask { n: 5 }));
        let root_future = Future::task(Arc::new(SumTask { a, b }));
        (root_future, HashMap::new())
    }

    #[test]
    fn fingerprint_dedup_collapses_equal_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let (root, mut databases) = sum_of_two_fives();
        let graph = resolve(&root, &mut databases, dir.path()).unwrap();

        let RootSpec::Node { key: sum_key, .. } = graph.root else {
            panic!("expected SumTask to be a scheduled node")
        };
        let sum_node = &graph.nodes[&sum_key];
        let a_key = match sum_node.deps.get("a").unwrap() {
            Binding::Origin { key, .. } => *key,
            Binding::Literal(_) => panic!("expected a scheduled LeafTask"),
        };
        let b_key = match sum_node.deps.get("b").unwrap() {
            Binding::Origin { key, .. } => *key,
            Binding::Literal(_) => panic!("expected a scheduled LeafTask"),
        };
        assert_eq!(a_key, b_key, "two LeafTask(5) instances must fold to one node");
        assert_eq!(graph.nodes.len(), 2, "SumTask plus a single deduplicated LeafTask");
    }

    #[test]
    fn resolution_is_idempotent_across_separate_calls() {
        let dir = tempfile::tempdir().unwrap();
        let (root_a, mut databases_a) = sum_of_two_fives();
        let graph_a = resolve(&root_a, &mut databases_a, dir.path()).unwrap();

        let (root_b, mut databases_b) = sum_of_two_fives();
        let graph_b = resolve(&root_b, &mut databases_b, dir.path()).unwrap();

        let keys_a: Vec<NodeKey> = graph_a.nodes.keys().copied().collect();
        let keys_b: Vec<NodeKey> = graph_b.nodes.keys().copied().collect();
        assert_eq!(keys_a, keys_b, "ids must be stable across independent resolutions");
    }

    #[test]
    fn fresh_instances_always_need_run() {
        let dir = tempfile::tempdir().unwrap();
        let (root, mut databases) = sum_of_two_fives();
        let graph = resolve(&root, &mut databases, dir.path()).unwrap();
        assert!(graph.nodes.values().all(|n| n.needs_run));
    }

    #[test]
    fn cached_instances_do_not_need_run_once_results_are_saved() {
        let dir = tempfile::tempdir().unwrap();
        let (root, mut databases) = sum_of_two_fives();
        let graph = resolve(&root, &mut databases, dir.path()).unwrap();

        // Save leaf results first, then the sum, mirroring execution order,
        // with enough of a gap that filesystem mtimes are distinguishable.
        let RootSpec::Node { key: sum_key, .. } = &graph.root else {
            panic!("expected SumTask to be a scheduled node")
        };
        for (key, node) in &graph.nodes {
            if *key != *sum_key {
                node.instance_dir.save_result(b"5").unwrap();
            }
        }
        sleep(Duration::from_millis(20));
        graph.nodes[sum_key].instance_dir.save_result(b"10").unwrap();
        sleep(Duration::from_millis(20));

        let (root2, mut databases2) = sum_of_two_fives();
        let graph2 = resolve(&root2, &mut databases2, dir.path()).unwrap();
        assert!(graph2.nodes.values().all(|n| !n.needs_run));
    }

    #[test]
    fn stale_source_token_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();

        struct V1;
        impl DynTask for V1 {
            fn class_name(&self) -> &'static str {
                "Versioned"
            }
            fn source_token(&self) -> String {
                "v1".to_string()
            }
            fn args(&self) -> BTreeMap<String, ArgValue> {
                BTreeMap::new()
            }
            fn run(&self, _inputs: &BTreeMap<String, Value>, _scratch_dir: &std::path::Path) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
                Ok(json!(1))
            }
        }
        struct V2;
        impl DynTask for V2 {
            fn class_name(&self) -> &'static str {
                "Versioned"
            }
            fn source_token(&self) -> String {
                "v2".to_string()
            }
            fn args(&self) -> BTreeMap<String, ArgValue> {
                BTreeMap::new()
            }
            fn run(&self, _inputs: &BTreeMap<String, Value>, _scratch_dir: &std::path::Path) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
                Ok(json!(1))
            }
        }

        let mut databases = HashMap::new();
        let root = Future::task(Arc::new(V1));
        let graph = resolve(&root, &mut databases, dir.path()).unwrap();
        let RootSpec::Node { key, .. } = graph.root else {
            panic!("expected a scheduled node")
        };
        graph.nodes[&key].instance_dir.save_result(b"1").unwrap();
        sleep(Duration::from_millis(20));

        let root2 = Future::task(Arc::new(V2));
        let graph2 = resolve(&root2, &mut databases, dir.path()).unwrap();
        assert!(graph2.nodes[&key].needs_run, "a changed source token must force a rerun");
    }
}
