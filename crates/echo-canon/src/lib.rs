// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical JSON fingerprinting for Echo task graphs.
//!
//! A task instance's identity is the canonical JSON encoding of its class
//! name and argument tree (its *fingerprint*, aka argkey). This crate owns
//! that encoding plus the reference-object shapes tasks, consts, and
//! projections serialize to when they appear inside another task's args.
//!
//! # Canonicalization
//!
//! Object keys are sorted by code point, there is no insignificant
//! whitespace, and the output is always valid UTF-8. `serde_json::Value`'s
//! `Object` variant is a `BTreeMap` under the default feature set (no
//! `preserve_order`), so correct key ordering falls out of serialization
//! for free — [`to_canonical_bytes`] exists to pin that contract down and
//! give it a name callers can rely on regardless of how `serde_json` is
//! configured elsewhere in a dependent crate.
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

mod reference;

pub use reference::{const_ref, projection_ref, task_ref};

use serde_json::Value;

/// Errors raised while canonicalizing an argument tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CanonError {
    /// A map key, projection key, or argument value was not JSON-representable
    /// (anything other than a string, number, bool, or null at a key
    /// position; any non-scalar at a projection-key position).
    #[error("[CANON_INVALID_KEY] {0}")]
    InvalidKey(String),
}

/// Returns `true` if `value` is a JSON scalar: string, number, bool, or null.
///
/// Projection keys and object keys must be scalars — spec.md §4.A rejects
/// arrays and objects in those positions with [`CanonError::InvalidKey`].
pub fn is_json_literal(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// Encodes `value` as canonical UTF-8 JSON bytes.
///
/// Keys are sorted lexicographically by code point, there is no
/// insignificant whitespace, and the result is idempotent:
/// `to_canonical_bytes(&reparse(&to_canonical_bytes(value)?)) ==
/// to_canonical_bytes(value)`.
///
/// # Errors
///
/// Returns [`CanonError::InvalidKey`] if `value` (or any value nested within
/// it) cannot be represented in JSON — in practice this only occurs for
/// non-finite floats, which `serde_json` refuses to serialize.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, CanonError> {
    serde_json::to_vec(value).map_err(|e| CanonError::InvalidKey(e.to_string()))
}

/// Encodes `value` as a canonical UTF-8 JSON string.
///
/// # Errors
///
/// See [`to_canonical_bytes`].
pub fn to_canonical_string(value: &Value) -> Result<String, CanonError> {
    let bytes = to_canonical_bytes(value)?;
    // `serde_json::to_vec` always emits valid UTF-8.
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
