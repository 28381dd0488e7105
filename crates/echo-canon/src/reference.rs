// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reference-object shapes for the three things that can appear as an
//! argument to a task: another task, a constant, or a structural
//! projection of either. See spec §4.A and §6.

use serde_json::{json, Value};

use crate::{is_json_literal, CanonError};

/// Builds the fingerprint reference object for a task: `{"__task__": name,
/// "__args__": args}`.
///
/// `args` is taken as an already-built JSON object (typically a
/// `serde_json::Map` assembled from a task's named input slots); this
/// function does not sort it — sorting happens once, in
/// [`crate::to_canonical_bytes`], at the point the whole tree is encoded.
pub fn task_ref(class_name: &str, args: Value) -> Value {
    json!({
        "__task__": class_name,
        "__args__": args,
    })
}

/// Builds the fingerprint reference object for a constant:
/// `{"__const__": true, "__repr__": repr}`.
pub fn const_ref(repr: &str) -> Value {
    json!({
        "__const__": true,
        "__repr__": repr,
    })
}

/// Builds the fingerprint reference object for a structural projection of
/// `origin_ref` (itself a task or const reference object) through `path`.
///
/// Per spec §4.E, projection chains collapse: a reference to
/// `parent[k1][k2]` records `__key__: [k1, k2]` against `parent`'s own
/// origin, not against an intermediate projection. Callers are expected to
/// have already resolved `origin_ref` to that origin before calling this.
///
/// # Errors
///
/// Returns [`CanonError::InvalidKey`] if any element of `path` is not a
/// JSON scalar (string, number, bool, or null).
pub fn projection_ref(origin_ref: Value, path: &[Value]) -> Result<Value, CanonError> {
    for key in path {
        if !is_json_literal(key) {
            return Err(CanonError::InvalidKey(format!(
                "projection key must be a JSON literal, got {key}"
            )));
        }
    }
    let mut obj = match origin_ref {
        Value::Object(map) => map,
        other => {
            return Err(CanonError::InvalidKey(format!(
                "origin reference must be a JSON object, got {other}"
            )))
        }
    };
    obj.insert("__key__".to_string(), Value::Array(path.to_vec()));
    Ok(Value::Object(obj))
}
