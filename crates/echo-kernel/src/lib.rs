// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Facade over Echo's resolver and scheduler.
//!
//! [`Engine`] is the one stop most callers need: hand it a [`Future`] and a
//! [`Context`] naming a cache root, and [`Engine::run_graph`] resolves it
//! into a DAG (`echo-tasks`), executes whatever needs running
//! (`echo-sched`), and returns the root's value, persisting everything it
//! touched under the cache root for next time. [`Context::discover`] picks
//! an OS-appropriate default cache root when a caller doesn't want to name
//! one explicitly.
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

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use directories::ProjectDirs;
use serde_json::Value;

use echo_cas::{CasError, Codec, Database, OpaqueCodec};
pub use echo_sched::{InlineRunner, PrefixCommandRunner, RunOptions, Runner, Stats};
use echo_sched::{Scheduler, SchedulerError};
pub use echo_tasks::{DynTask, Future};
use echo_tasks::{resolve, ResolveError, RootSpec};

/// Errors raised by [`Engine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Resolving the given future into a DAG failed.
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// Executing the resolved graph failed.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    /// The cache layer failed outside of graph resolution or execution.
    #[error(transparent)]
    Cas(#[from] CasError),
    /// [`Engine::clear_task`] was called with a future that resolves to a
    /// bare literal rather than a scheduled task.
    #[error("[NOT_A_TASK] root resolved to a literal value, not a scheduled task")]
    NotATask,
    /// [`Context::discover`] could not determine a default cache directory
    /// on this platform (no resolvable home directory).
    #[error("[NO_CACHE_ROOT] could not determine a default cache directory for this platform")]
    NoCacheRoot,
}

/// Where an [`Engine`] persists its cache: one directory tree, containing a
/// subdirectory per task class.
#[derive(Debug, Clone)]
pub struct Context {
    cache_root: PathBuf,
}

impl Context {
    /// Uses `cache_root` directly, creating it on first write if it doesn't
    /// exist yet.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
        }
    }

    /// Resolves an OS-appropriate default cache directory for this
    /// application (`~/.cache/echo` and platform equivalents).
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NoCacheRoot`] if no home directory can be
    /// determined for the current user.
    pub fn discover() -> Result<Self, EngineError> {
        let dirs = ProjectDirs::from("dev", "flyingrobots", "echo")
            .ok_or(EngineError::NoCacheRoot)?;
        Ok(Self::new(dirs.cache_dir()))
    }

    /// The directory this context persists its cache under.
    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves and runs Echo task graphs against a persistent cache.
pub struct Engine {
    context: Context,
    databases: Mutex<HashMap<&'static str, Database>>,
    runner: Arc<dyn Runner>,
    codec: Arc<dyn Codec>,
}

impl Engine {
    /// Creates an engine backed by `context`'s cache root, using the
    /// default [`InlineRunner`] and [`OpaqueCodec`].
    #[must_use]
    pub fn new(context: Context) -> Self {
        Self {
            context,
            databases: Mutex::new(HashMap::new()),
            runner: Arc::new(InlineRunner),
            codec: Arc::new(OpaqueCodec),
        }
    }

    /// Replaces this engine's [`Runner`], e.g. with a
    /// [`PrefixCommandRunner`].
    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn Runner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replaces this engine's result [`Codec`], e.g. with
    /// [`echo_cas::JsonCodec`] for an inspectable cache root.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// The cache root this engine persists to.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Resolves `root` and runs every node that needs it, returning the
    /// root's value.
    ///
    /// # Errors
    ///
    /// See [`Engine::run_graph_with_stats`].
    pub async fn run_graph(&self, root: &Future, options: RunOptions) -> Result<Value, EngineError> {
        self.run_graph_with_stats(root, options)
            .await
            .map(|(value, _stats)| value)
    }

    /// As [`Engine::run_graph`], additionally returning per-channel
    /// execution statistics.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Resolve`] if `root` cannot be resolved into a
    /// DAG (a cycle, or a non-canonicalizable projection key/argument), or
    /// [`EngineError::Scheduler`] if any scheduled node fails.
    pub async fn run_graph_with_stats(
        &self,
        root: &Future,
        options: RunOptions,
    ) -> Result<(Value, Stats), EngineError> {
        let graph = {
            let mut databases = lock(&self.databases);
            resolve(root, &mut databases, &self.context.cache_root)?
        };
        let (value, stats) = Scheduler::run_graph_with_stats(
            Arc::new(graph),
            &options,
            Arc::clone(&self.runner),
            Arc::clone(&self.codec),
        )
        .await?;
        Ok((value, stats))
    }

    /// Invalidates the single instance `root` resolves to: its stored
    /// result, stdout, and stderr are discarded, but its assigned id and
    /// dependency links are kept.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotATask`] if `root` resolves to a bare
    /// literal rather than a scheduled task, or [`EngineError::Resolve`]/
    /// [`EngineError::Cas`] if resolution or the filesystem operation fails.
    pub fn clear_task(&self, root: &Future) -> Result<(), EngineError> {
        let mut databases = lock(&self.databases);
        let graph = resolve(root, &mut databases, &self.context.cache_root)?;
        let RootSpec::Node { key, .. } = graph.root else {
            return Err(EngineError::NotATask);
        };
        let node = graph.nodes.get(&key).ok_or(EngineError::NotATask)?;
        node.instance_dir.delete()?;
        Ok(())
    }

    /// Invalidates every instance of task class `class_name`: reassigns ids
    /// from zero and wipes every stored result beneath it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Cas`] if the underlying store fails.
    pub fn clear_all(&self, class_name: &'static str) -> Result<(), EngineError> {
        let mut databases = lock(&self.databases);
        let db = match databases.entry(class_name) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => {
                let db = Database::open(&self.context.cache_root, class_name)?;
                e.insert(db)
            }
        };
        db.clear()?;
        Ok(())
    }
}

/// Installs a `tracing_subscriber` formatting layer reading its filter from
/// `RUST_LOG`. Optional: this crate never installs a subscriber on its own,
/// so embedding applications that already configure `tracing` should not
/// call this.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use echo_tasks::ArgValue;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct ConstTask {
        value: i64,
    }
    impl DynTask for ConstTask {
        fn class_name(&self) -> &'static str {
            "KernelConstTask"
        }
        fn source_token(&self) -> String {
            "v1".to_string()
        }
        fn args(&self) -> BTreeMap<String, ArgValue> {
            let mut m = BTreeMap::new();
            m.insert("value".to_string(), ArgValue::Literal(json!(self.value)));
            m
        }
        fn run(
            &self,
            _inputs: &BTreeMap<String, Value>,
            _scratch_dir: &std::path::Path,
        ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>> {
            Ok(json!(self.value))
        }
    }

    #[tokio::test]
    async fn run_graph_executes_and_then_caches() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Context::new(dir.path()));

        let root = Future::task(Arc::new(ConstTask { value: 7 }));
        let (value, stats) = engine
            .run_graph_with_stats(&root, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(value, json!(7));
        assert_eq!(stats.per_channel.get("KernelConstTask"), Some(&1));

        let root2 = Future::task(Arc::new(ConstTask { value: 7 }));
        let (value2, stats2) = engine
            .run_graph_with_stats(&root2, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(value2, json!(7));
        assert!(stats2.per_channel.is_empty());
    }

    #[tokio::test]
    async fn clear_task_forces_a_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Context::new(dir.path()));

        let root = Future::task(Arc::new(ConstTask { value: 1 }));
        engine
            .run_graph(&root, RunOptions::default())
            .await
            .unwrap();

        let root_again = Future::task(Arc::new(ConstTask { value: 1 }));
        engine.clear_task(&root_again).unwrap();

        let root_final = Future::task(Arc::new(ConstTask { value: 1 }));
        let (_, stats) = engine
            .run_graph_with_stats(&root_final, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.per_channel.get("KernelConstTask"), Some(&1));
    }

    #[tokio::test]
    async fn clear_task_on_a_literal_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Context::new(dir.path()));
        let literal = Future::constant(json!(42)).unwrap();
        let err = engine.clear_task(&literal).unwrap_err();
        assert!(matches!(err, EngineError::NotATask));
    }

    #[tokio::test]
    async fn clear_all_wipes_a_whole_class() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(Context::new(dir.path()));

        let root = Future::task(Arc::new(ConstTask { value: 9 }));
        engine
            .run_graph(&root, RunOptions::default())
            .await
            .unwrap();

        engine.clear_all("KernelConstTask").unwrap();

        let root_again = Future::task(Arc::new(ConstTask { value: 9 }));
        let (_, stats) = engine
            .run_graph_with_stats(&root_again, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(stats.per_channel.get("KernelConstTask"), Some(&1));
    }
}
