// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The Task/Future capability model.
//!
//! Grounded on `examples/original_source/taskproc/future.py`'s `Future`
//! protocol (`Task`/`Const`/`MappedFuture`, origin resolution, projection-
//! path collapsing). The reflective field-declaration surface the original
//! used to discover a task's inputs (`Requires[...]` annotations rewritten
//! onto instance attributes at construction time) has no counterpart here —
//! `DynTask::args` is the explicit builder/args-enumeration the corpus's own
//! design notes call for in a systems language: a task names its input
//! slots itself, instead of the framework inferring them by reflection.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use echo_canon::{const_ref, is_json_literal, to_canonical_string, CanonError};

/// Identifies a scheduled node: a task class together with the instance id
/// its fingerprint was assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    /// The task's class name.
    pub class_name: &'static str,
    /// The instance id assigned to this fingerprint within that class.
    pub id: echo_cas::InstanceId,
}

/// The value bound to one of a task's named input slots.
///
/// `Literal` covers both bare JSON-literal constructor arguments (spec.md
/// §3's "JSON-literal argument" case) and already-validated [`Const`]
/// values — both are inlined directly into a task's args object with no
/// separate scheduled node. `Future` covers everything that is itself a
/// [`Future`] (a task dependency, a constant future, or a projection of
/// either).
#[derive(Clone)]
pub enum ArgValue {
    /// A value known at graph-construction time; never scheduled.
    Literal(Value),
    /// A future: a task, constant, or projection.
    Future(Future),
}

/// A task's capability contract: identity, declared inputs, and its body.
///
/// Object-safe so a resolved graph can hold heterogeneous task
/// implementations behind `Arc<dyn DynTask>`.
pub trait DynTask: Send + Sync {
    /// The task's class name. Doubles as its default channel tag.
    fn class_name(&self) -> &'static str;

    /// A string identifying the current version of this class's body.
    /// Changing it invalidates every cached instance of the class on the
    /// next resolution (spec.md §4.D).
    fn source_token(&self) -> String;

    /// This task's named input slots, in the order the resolver should
    /// visit them (lexicographic by slot name is the conventional choice
    /// and is what [`BTreeMap`] gives for free).
    fn args(&self) -> BTreeMap<String, ArgValue>;

    /// Extra channel tags beyond the implicit `class_name` channel every
    /// task carries. Most tasks return an empty vec.
    fn channels(&self) -> Vec<String> {
        Vec::new()
    }

    /// Executes the task body given its resolved input values, keyed by
    /// slot name, and this instance's persistent scratch directory
    /// (spec.md §4.C's `data/`) for side artifacts the returned value may
    /// reference. The directory already exists and survives across reruns
    /// until `clear_task`/`clear_all` wipes it.
    ///
    /// # Errors
    ///
    /// Returns a boxed error describing why the task body failed; the
    /// scheduler wraps it as `FailedTask`.
    fn run(
        &self,
        inputs: &BTreeMap<String, Value>,
        scratch_dir: &Path,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>;
}

/// A constant, literal-safe value that participates in a fingerprint but is
/// never scheduled as its own node.
#[derive(Debug, Clone, PartialEq)]
pub struct Const(Value);

impl Const {
    /// Wraps `value`, checking it is literal-safe: canonicalizing it and
    /// reparsing yields back an identical value. This is the Rust-native
    /// substitute for the original's `eval(repr(x)) == x` check — it
    /// rejects the same class of bug (for example, a value that only
    /// round-trips through a lossy textual form).
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] if `value` cannot be canonicalized or fails
    /// the round-trip comparison.
    pub fn new(value: Value) -> Result<Self, CanonError> {
        let repr = to_canonical_string(&value)?;
        let reparsed: Value = serde_json::from_str(&repr)
            .map_err(|e| CanonError::InvalidKey(format!("const value did not round-trip: {e}")))?;
        if reparsed != value {
            return Err(CanonError::InvalidKey(format!(
                "const value is not literal-safe: {value} round-trips to {reparsed}"
            )));
        }
        Ok(Self(value))
    }

    /// The wrapped value.
    pub fn value(&self) -> &Value {
        &self.0
    }

    fn reference(&self) -> Result<Value, CanonError> {
        let repr = to_canonical_string(&self.0)?;
        Ok(const_ref(&repr))
    }
}

/// A structural projection of another future: `parent[key]`.
///
/// Chains collapse at read and fingerprint time — `parent[k1][k2]` records
/// the path `[k1, k2]` against `parent`'s own origin, not against an
/// intermediate projection. See [`Future::origin`] and
/// [`Future::projection_path`].
#[derive(Clone)]
pub struct MappedFuture {
    parent: Future,
    key: Value,
}

/// Anything that can appear as a task's input: a task, a constant, or a
/// structural projection of either.
#[derive(Clone)]
pub enum Future {
    /// A user-defined task node.
    Task(Arc<dyn DynTask>),
    /// A literal-safe constant.
    Const(Const),
    /// A structural projection of another future.
    Mapped(Box<MappedFuture>),
}

impl Future {
    /// Wraps a task as a future.
    pub fn task(task: Arc<dyn DynTask>) -> Self {
        Self::Task(task)
    }

    /// Wraps a literal-safe constant as a future.
    pub fn constant(value: Value) -> Result<Self, CanonError> {
        Ok(Self::Const(Const::new(value)?))
    }

    /// Projects this future through `key`: `self[key]`.
    ///
    /// `key` must be a JSON scalar; validity is checked by the resolver
    /// (spec.md §4.E), not eagerly here, since building the projection
    /// chain itself never fails.
    #[must_use]
    pub fn get(self, key: Value) -> Self {
        Self::Mapped(Box::new(MappedFuture { parent: self, key }))
    }

    /// The non-projection future this one ultimately reads from: itself,
    /// unless this is a chain of projections, in which case the innermost
    /// `Task` or `Const`.
    pub fn origin(&self) -> &Self {
        match self {
            Self::Mapped(m) => m.parent.origin(),
            other => other,
        }
    }

    /// The ordered sequence of projection keys applied on top of
    /// [`Future::origin`], outermost-last (`parent[k1][k2]` yields `[k1,
    /// k2]`).
    pub fn projection_path(&self) -> Vec<Value> {
        let mut path = Vec::new();
        let mut cur = self;
        while let Self::Mapped(m) = cur {
            path.push(m.key.clone());
            cur = &m.parent;
        }
        path.reverse();
        path
    }

}

impl MappedFuture {
    pub(crate) fn parent(&self) -> &Future {
        &self.parent
    }

    pub(crate) fn key(&self) -> &Value {
        &self.key
    }
}

impl Const {
    pub(crate) fn into_reference(&self) -> Result<Value, CanonError> {
        self.reference()
    }
}

/// Indexes `value` by each key in `path` in turn: numbers index arrays,
/// strings index objects. Mirrors the original's plain `out = out[k]` loop.
///
/// # Errors
///
/// Returns [`CanonError::InvalidKey`] if a key does not address anything in
/// `value` (wrong type, out of range, or missing object key).
pub fn project_value(value: &Value, path: &[Value]) -> Result<Value, CanonError> {
    let mut cur = value.clone();
    for key in path {
        cur = match (&cur, key) {
            (Value::Array(arr), Value::Number(n)) => {
                let idx = n.as_u64().ok_or_else(|| {
                    CanonError::InvalidKey(format!("array index must be a non-negative integer, got {n}"))
                })? as usize;
                arr.get(idx)
                    .cloned()
                    .ok_or_else(|| CanonError::InvalidKey(format!("index {idx} out of range")))?
            }
            (Value::Object(map), Value::String(s)) => map
                .get(s)
                .cloned()
                .ok_or_else(|| CanonError::InvalidKey(format!("no such key: {s}")))?,
            (other, key) => {
                return Err(CanonError::InvalidKey(format!(
                    "cannot project {key} into {other}"
                )))
            }
        };
    }
    Ok(cur)
}
