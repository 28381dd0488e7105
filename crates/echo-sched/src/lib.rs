// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Channel-rate-limited scheduler for Echo task graphs.
//!
//! Given a [`echo_tasks::ResolvedGraph`], [`Scheduler::run_graph_with_stats`]
//! executes every node whose `needs_run` flag is set, honoring DAG order (a
//! node starts only once every upstream node it depends on has succeeded)
//! and per-channel concurrency caps (spec.md §4.G), then returns the root's
//! value plus a per-channel count of nodes actually executed (not cache
//! hits). Node bodies are invoked through the pluggable [`Runner`]
//! capability (§4.H), never directly.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::suboptimal_flops,
    clippy::redundant_pub_crate,
    clippy::many_single_char_names,
    clippy::module_name_repetitions,
    clippy::use_self
)]

mod error;
mod runner;

pub use error::{FailedTask, RunnerError, SchedulerError};
pub use runner::{InlineRunner, PrefixCommandRunner, Runner, RunOutput};

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};

use echo_cas::Codec;
use echo_tasks::{project_value, Binding, NodeKey, ResolvedGraph, RootSpec};

/// Per-run options: overall worker concurrency and per-channel rate limits.
///
/// A channel absent from `rate_limits` is unbounded (spec.md §4.G).
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// The maximum number of nodes running at once, across all channels.
    pub worker_count: usize,
    /// Channel tag -> maximum concurrently running nodes sharing that tag.
    pub rate_limits: HashMap<String, usize>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            worker_count: 4,
            rate_limits: HashMap::new(),
        }
    }
}

/// Per-channel count of nodes the scheduler actually executed (cache hits
/// are not counted).
#[derive(Debug, Clone, Default)]
pub struct Stats {
    /// Channel tag -> number of nodes run under that tag this call.
    pub per_channel: HashMap<String, usize>,
}

/// Executes resolved task graphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Scheduler;

impl Scheduler {
    /// Runs every `needs_run` node in `graph`, honoring DAG order and
    /// `options.rate_limits`, and returns the root's value.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::FailedTaskError`] if any node failed (and
    /// lets every other outstanding node finish before returning), or a
    /// cache/canonicalization error if reading/writing a result fails.
    pub async fn run_graph(
        graph: Arc<ResolvedGraph>,
        options: &RunOptions,
        runner: Arc<dyn Runner>,
        codec: Arc<dyn Codec>,
    ) -> Result<Value, SchedulerError> {
        Self::run_graph_with_stats(graph, options, runner, codec)
            .await
            .map(|(value, _stats)| value)
    }

    /// As [`Scheduler::run_graph`], additionally returning execution
    /// statistics.
    ///
    /// # Errors
    ///
    /// See [`Scheduler::run_graph`].
    pub async fn run_graph_with_stats(
        graph: Arc<ResolvedGraph>,
        options: &RunOptions,
        runner: Arc<dyn Runner>,
        codec: Arc<dyn Codec>,
    ) -> Result<(Value, Stats), SchedulerError> {
        execute(graph, options, runner, codec).await
    }
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn execute(
    graph: Arc<ResolvedGraph>,
    options: &RunOptions,
    runner: Arc<dyn Runner>,
    codec: Arc<dyn Codec>,
) -> Result<(Value, Stats), SchedulerError> {
    let (root_key, root_path) = match &graph.root {
        RootSpec::Literal(value) => return Ok((value.clone(), Stats::default())),
        RootSpec::Node { key, path } => (*key, path.clone()),
    };

    let run_set: HashSet<NodeKey> = graph
        .nodes
        .iter()
        .filter(|(_, node)| node.needs_run)
        .map(|(key, _)| *key)
        .collect();

    let mut indegree: HashMap<NodeKey, usize> = HashMap::new();
    let mut downstream: HashMap<NodeKey, Vec<NodeKey>> = HashMap::new();
    let mut channel_semaphores: HashMap<String, Arc<Semaphore>> = HashMap::new();

    for key in &run_set {
        let node = &graph.nodes[key];
        let mut degree = 0usize;
        for binding in node.deps.values() {
            if let Binding::Origin { key: upstream, .. } = binding {
                if run_set.contains(upstream) {
                    degree += 1;
                    downstream.entry(*upstream).or_default().push(*key);
                }
            }
        }
        indegree.insert(*key, degree);
        for channel in &node.channels {
            channel_semaphores.entry(channel.clone()).or_insert_with(|| {
                let limit = options
                    .rate_limits
                    .get(channel)
                    .copied()
                    .unwrap_or(Semaphore::MAX_PERMITS);
                Arc::new(Semaphore::new(limit))
            });
        }
    }

    let worker_semaphore = Arc::new(Semaphore::new(options.worker_count.max(1)));

    let mut ready: VecDeque<NodeKey> = graph
        .nodes
        .keys()
        .filter(|key| indegree.get(*key).copied() == Some(0))
        .copied()
        .collect();

    let results: Arc<StdMutex<HashMap<NodeKey, Value>>> = Arc::new(StdMutex::new(HashMap::new()));
    let stats: Arc<StdMutex<HashMap<String, usize>>> = Arc::new(StdMutex::new(HashMap::new()));
    let first_failure: Arc<StdMutex<Option<FailedTask>>> = Arc::new(StdMutex::new(None));
    let (tx, mut rx) = mpsc::unbounded_channel::<(NodeKey, Result<Value, FailedTask>)>();

    let mut inflight = 0usize;

    loop {
        while let Some(&key) = ready.front() {
            if lock(&first_failure).is_some() {
                break;
            }
            let channels = &graph.nodes[&key].channels;
            let Some(permits) = try_acquire_all(channels, &channel_semaphores, &worker_semaphore)
            else {
                break;
            };
            ready.pop_front();
            inflight += 1;
            {
                let mut s = lock(&stats);
                for channel in channels {
                    *s.entry(channel.clone()).or_insert(0) += 1;
                }
            }
            tokio::spawn(dispatch(
                key,
                Arc::clone(&graph),
                Arc::clone(&runner),
                Arc::clone(&codec),
                permits,
                Arc::clone(&results),
                tx.clone(),
            ));
        }

        if inflight == 0 {
            break;
        }

        let Some((key, result)) = rx.recv().await else {
            break;
        };
        inflight -= 1;
        match result {
            Ok(_) => {
                if let Some(deps) = downstream.get(&key) {
                    for dep in deps {
                        if let Some(degree) = indegree.get_mut(dep) {
                            *degree -= 1;
                            if *degree == 0 {
                                ready.push_back(*dep);
                            }
                        }
                    }
                }
            }
            Err(failure) => {
                let mut f = lock(&first_failure);
                if f.is_none() {
                    *f = Some(failure);
                }
            }
        }
    }

    if let Some(failure) = lock(&first_failure).clone() {
        return Err(SchedulerError::FailedTaskError(failure));
    }

    let root_value = read_node_value(&graph, &results, codec.as_ref(), root_key)?;
    let projected = if root_path.is_empty() {
        root_value
    } else {
        project_value(&root_value, &root_path)?
    };

    Ok((
        projected,
        Stats {
            per_channel: lock(&stats).clone(),
        },
    ))
}

async fn dispatch(
    key: NodeKey,
    graph: Arc<ResolvedGraph>,
    runner: Arc<dyn Runner>,
    codec: Arc<dyn Codec>,
    permits: Vec<OwnedSemaphorePermit>,
    results: Arc<StdMutex<HashMap<NodeKey, Value>>>,
    tx: mpsc::UnboundedSender<(NodeKey, Result<Value, FailedTask>)>,
) {
    let inputs = match assemble_inputs(&graph, key, &results, codec.as_ref()) {
        Ok(inputs) => inputs,
        Err(err) => {
            drop(permits);
            let _ = tx.send((key, Err(FailedTask::new(key, err.to_string()))));
            return;
        }
    };

    let graph_for_blocking = Arc::clone(&graph);
    let runner_for_blocking = Arc::clone(&runner);
    let codec_for_blocking = Arc::clone(&codec);
    let join = tokio::task::spawn_blocking(move || -> Result<Value, FailedTask> {
        let node = &graph_for_blocking.nodes[&key];
        tracing::debug!(class = %key.class_name, id = key.id, "dispatching node");
        let scratch_dir = node.instance_dir.data_dir();
        let output = runner_for_blocking
            .run(key, node.task.as_ref(), &inputs, &scratch_dir)
            .map_err(|e| FailedTask::new(key, e.to_string()))?;
        let bytes = codec_for_blocking
            .encode(&output.value)
            .map_err(|e| FailedTask::new(key, e.to_string()))?;
        node.instance_dir
            .save_result(&bytes)
            .map_err(|e| FailedTask::new(key, e.to_string()))?;
        let _ = std::fs::write(node.instance_dir.stdout_path(), &output.stdout);
        let _ = std::fs::write(node.instance_dir.stderr_path(), &output.stderr);
        Ok(output.value)
    });

    let result = match join.await {
        Ok(r) => r,
        Err(e) => Err(FailedTask::new(key, format!("runner task panicked: {e}"))),
    };

    if let Ok(value) = &result {
        lock(&results).insert(key, value.clone());
    }
    drop(permits);
    let _ = tx.send((key, result));
}

fn try_acquire_all(
    channels: &[String],
    channel_semaphores: &HashMap<String, Arc<Semaphore>>,
    worker_semaphore: &Arc<Semaphore>,
) -> Option<Vec<OwnedSemaphorePermit>> {
    let mut permits = Vec::with_capacity(channels.len() + 1);
    permits.push(Arc::clone(worker_semaphore).try_acquire_owned().ok()?);
    for channel in channels {
        let sem = channel_semaphores.get(channel)?;
        permits.push(Arc::clone(sem).try_acquire_owned().ok()?);
    }
    Some(permits)
}

fn assemble_inputs(
    graph: &ResolvedGraph,
    key: NodeKey,
    results: &StdMutex<HashMap<NodeKey, Value>>,
    codec: &dyn Codec,
) -> Result<BTreeMap<String, Value>, SchedulerError> {
    let node = &graph.nodes[&key];
    let mut inputs = BTreeMap::new();
    for (slot, binding) in &node.deps {
        let value = match binding {
            Binding::Literal(value) => value.clone(),
            Binding::Origin { key: upstream, path } => {
                let base = read_node_value(graph, results, codec, *upstream)?;
                if path.is_empty() {
                    base
                } else {
                    project_value(&base, path)?
                }
            }
        };
        inputs.insert(slot.clone(), value);
    }
    Ok(inputs)
}

fn read_node_value(
    graph: &ResolvedGraph,
    results: &StdMutex<HashMap<NodeKey, Value>>,
    codec: &dyn Codec,
    key: NodeKey,
) -> Result<Value, SchedulerError> {
    if let Some(value) = lock(results).get(&key) {
        return Ok(value.clone());
    }
    let node = &graph.nodes[&key];
    let bytes = node.instance_dir.load_result()?;
    let value = codec.decode(&bytes)?;
    lock(results).insert(key, value.clone());
    Ok(value)
}
