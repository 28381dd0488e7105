// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Errors raised while running or invoking a resolved graph.

use echo_tasks::NodeKey;

/// A task body failed, or the runner could not execute it at all.
///
/// spec.md §7 treats `RunnerError` (spawn failure, etc.) as a `FailedTask`
/// once it reaches the scheduler boundary, so both causes are folded into
/// this one variant rather than kept distinct.
#[derive(Debug, Clone, thiserror::Error)]
#[error("[FAILED_TASK] {class_name}#{id}: {cause}")]
pub struct FailedTask {
    /// The class name of the task that failed.
    pub class_name: &'static str,
    /// The instance id of the task that failed.
    pub id: u64,
    /// A human-readable description of the failure.
    pub cause: String,
}

impl FailedTask {
    pub(crate) fn new(key: NodeKey, cause: impl Into<String>) -> Self {
        Self {
            class_name: key.class_name,
            id: key.id,
            cause: cause.into(),
        }
    }
}

/// Raised by a [`crate::Runner`] that cannot execute a node body at all
/// (spawn failure, I/O error reading its own subprocess output, etc.).
#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnerError {
    /// The runner could not spawn or communicate with a subprocess.
    #[error("[RUNNER_SPAWN_ERROR] {0}")]
    Spawn(String),
    /// The task body itself raised.
    #[error("[RUNNER_TASK_ERROR] {0}")]
    TaskFailed(String),
}

/// Errors raised by [`crate::Scheduler::run_graph`] and
/// [`crate::Scheduler::run_graph_with_stats`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// At least one node failed; this names the first one observed.
    ///
    /// spec.md §4.G: only the first failure (by wall-clock at the worker)
    /// is surfaced as the cause. The scheduler still drains every
    /// outstanding run before returning this error.
    #[error("[FAILED_TASK_ERROR] graph execution failed: {0}")]
    FailedTaskError(#[source] FailedTask),
    /// Saving or loading a node's result through the cache layer failed.
    #[error("cache error: {0}")]
    Cas(#[from] echo_cas::CasError),
    /// A projection path could not be applied to a produced value.
    #[error("[CANON_INVALID_KEY] {0}")]
    InvalidKey(String),
}

impl From<echo_canon::CanonError> for SchedulerError {
    fn from(err: echo_canon::CanonError) -> Self {
        match err {
            echo_canon::CanonError::InvalidKey(msg) => Self::InvalidKey(msg),
        }
    }
}
