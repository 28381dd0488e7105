// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Content-addressed task cache for Echo.
//!
//! `echo-cas` is the on-disk half of the task-graph executor: a persistent
//! fingerprint-to-instance-id map ([`IdTable`]), the per-instance filesystem
//! layout that hangs off each id ([`InstanceDirectory`]), and the
//! per-task-class container that owns both plus source-code versioning
//! ([`Database`]). The Phase-1 version of this crate was an in-memory blob
//! store keyed by a BLAKE3 content hash; this phase keys by the literal
//! canonical-JSON fingerprint produced by `echo-canon` instead, since
//! callers need that exact byte string back out of `args.json`, not a
//! one-way digest.
//!
//! # Layout
//!
//! ```text
//! <cache_root>/<class_name>/
//!   source.txt
//!   id_table/
//!   results/<id>/
//!     args.json
//!     result
//!     stdout
//!     stderr
//!     data/
//!     deps/
//!       <slot_name> -> <other instance dir>
//!       __NO_DEPENDENCIES__
//! ```
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

mod codec;
mod database;
mod id_table;
mod instance_dir;

pub use codec::{Codec, JsonCodec, OpaqueCodec};
pub use database::Database;
pub use id_table::IdTable;
pub use instance_dir::InstanceDirectory;

use std::path::{Path, PathBuf};

/// Non-negative integer, unique per task class, assigned on first sight of a
/// fingerprint and stable across process restarts.
pub type InstanceId = u64;

/// Errors raised by the cache layer.
#[derive(Debug, thiserror::Error)]
pub enum CasError {
    /// A filesystem operation failed.
    #[error("io error at {path}: {source}")]
    Io {
        /// Path the failing operation targeted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The embedded id-table store failed.
    #[error("id table error: {0}")]
    Sled(#[from] sled::Error),
    /// A result codec failed to encode or decode.
    #[error("[CAS_CODEC_ERROR] {0}")]
    Codec(String),
    /// A timestamp or load was requested on a result that was never produced.
    #[error("[CAS_MISSING_RESULT] no result has been stored for this instance")]
    MissingResult,
}

impl CasError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<sled::transaction::TransactionError<sled::Error>> for CasError {
    fn from(err: sled::transaction::TransactionError<sled::Error>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e)
            | sled::transaction::TransactionError::Storage(e) => Self::Sled(e),
        }
    }
}
