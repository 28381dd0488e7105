// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The pluggable [`Runner`] capability (spec.md §4.H).
//!
//! The scheduler never calls a task's [`echo_tasks::DynTask::run`] itself —
//! it hands the node and its resolved inputs to a `Runner` and trusts back
//! whatever bytes, stdout, and stderr come out. [`InlineRunner`] is the
//! default: it calls the task body directly on the worker thread.
//! [`PrefixCommandRunner`] is the subprocess-wrapping variant spec.md §1
//! calls out as an external collaborator with an interface-only contract
//! here: it spawns a caller-supplied argv prefix, captures that process's
//! stdout/stderr as a "caller log", then runs the task body inline as the
//! "callee", concatenating both logs in the order
//! `examples/original_source/tests/test_taskproc.py::test_prefix_command`
//! demonstrates.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

use serde_json::Value;

use echo_tasks::{DynTask, NodeKey};

use crate::error::RunnerError;

/// What running one node produced: its result value plus captured output
/// streams, ready to be written into the instance directory's `stdout` and
/// `stderr` files.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// The value the task body returned.
    pub value: Value,
    /// Captured standard output.
    pub stdout: Vec<u8>,
    /// Captured standard error.
    pub stderr: Vec<u8>,
}

/// Invokes a single node's compute and reports what happened.
///
/// Implementations must be safe to call from multiple worker threads
/// concurrently, for distinct nodes; the scheduler never calls `run` for the
/// same node twice concurrently.
pub trait Runner: Send + Sync {
    /// Executes `task` with its already-resolved `inputs`, keyed by slot
    /// name, identified by `key` for error reporting. `scratch_dir` is the
    /// node's persistent `data/` directory (spec.md §4.C), passed through
    /// unchanged to [`echo_tasks::DynTask::run`].
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] if the runner could not execute the node at
    /// all (spawn failure) or if the task body itself raised.
    fn run(
        &self,
        key: NodeKey,
        task: &dyn DynTask,
        inputs: &BTreeMap<String, Value>,
        scratch_dir: &Path,
    ) -> Result<RunOutput, RunnerError>;
}

/// The default runner: calls the task's compute directly on the calling
/// (worker) thread.
///
/// Per-task stdout/stderr capture is left empty — redirecting a specific
/// thread's view of the process-wide standard streams is not meaningful in
/// a multi-threaded scheduler without a subprocess boundary; tasks that need
/// captured output should run under [`PrefixCommandRunner`] instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineRunner;

impl Runner for InlineRunner {
    fn run(
        &self,
        key: NodeKey,
        task: &dyn DynTask,
        inputs: &BTreeMap<String, Value>,
        scratch_dir: &Path,
    ) -> Result<RunOutput, RunnerError> {
        let value = task.run(inputs, scratch_dir).map_err(|e| {
            tracing::debug!(class = %key.class_name, id = key.id, error = %e, "task body raised");
            RunnerError::TaskFailed(e.to_string())
        })?;
        Ok(RunOutput {
            value,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }
}

/// Wraps [`InlineRunner`] with a caller-supplied subprocess prefix.
///
/// The prefix command is spawned once per node run, with no arguments
/// appended (argv-construction from a node's identity is the pluggable part
/// spec.md §1 leaves to callers; a caller who needs that can implement
/// [`Runner`] directly instead of using this type). Its captured output is
/// the "caller log"; the inline task body's own output is the "callee log".
pub struct PrefixCommandRunner {
    prefix: Vec<String>,
    inline: InlineRunner,
}

impl PrefixCommandRunner {
    /// Creates a runner that spawns `prefix` (argv, first element is the
    /// program) before running each node's body inline.
    #[must_use]
    pub fn new(prefix: Vec<String>) -> Self {
        Self {
            prefix,
            inline: InlineRunner,
        }
    }
}

impl Runner for PrefixCommandRunner {
    fn run(
        &self,
        key: NodeKey,
        task: &dyn DynTask,
        inputs: &BTreeMap<String, Value>,
        scratch_dir: &Path,
    ) -> Result<RunOutput, RunnerError> {
        let Some((program, args)) = self.prefix.split_first() else {
            return self.inline.run(key, task, inputs, scratch_dir);
        };

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| RunnerError::Spawn(e.to_string()))?;
        if !output.status.success() {
            return Err(RunnerError::Spawn(format!(
                "prefix command exited with {}",
                output.status
            )));
        }

        let inline_output = self.inline.run(key, task, inputs, scratch_dir)?;

        let mut stdout = b"=== caller log ===\n".to_vec();
        stdout.extend_from_slice(&output.stdout);
        stdout.extend_from_slice(b"=== callee log ===\n");
        stdout.extend_from_slice(&inline_output.stdout);

        let mut stderr = b"=== caller log ===\n".to_vec();
        stderr.extend_from_slice(&output.stderr);
        stderr.extend_from_slice(b"=== callee log ===\n");
        stderr.extend_from_slice(&inline_output.stderr);

        Ok(RunOutput {
            value: inline_output.value,
            stdout,
            stderr,
        })
    }
}
