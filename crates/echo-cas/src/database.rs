// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-task-class cache container.
//!
//! Grounded on `examples/original_source/taskproc/database.py`'s
//! `Database` and `examples/original_source/checkpoint/base_db.py`'s
//! source-token bookkeeping: one `Database` per task class, owning that
//! class's [`IdTable`], its `results/` tree of [`InstanceDirectory`]s, and a
//! `source.txt` recording the class's current source token so a changed
//! task implementation invalidates every instance beneath it.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::{CasError, IdTable, InstanceDirectory, InstanceId};

/// Owns the on-disk cache for a single task class: id assignment, instance
/// directories, and source-token invalidation.
pub struct Database {
    name: String,
    base_path: PathBuf,
    id_table: IdTable,
}

impl Database {
    /// Opens (creating if absent) the database for task class `name` rooted
    /// under `cache_root`.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] or [`CasError::Sled`] if the store cannot be
    /// created or opened.
    pub fn open(cache_root: &Path, name: &str) -> Result<Self, CasError> {
        let base_path = cache_root.join(name);
        let results_dir = base_path.join("results");
        fs::create_dir_all(&results_dir).map_err(|e| CasError::io(&results_dir, e))?;
        let id_table = IdTable::open(&base_path.join("id_table"))?;
        Ok(Self {
            name: name.to_string(),
            base_path,
            id_table,
        })
    }

    /// The task class this database caches.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn results_dir(&self) -> PathBuf {
        self.base_path.join("results")
    }

    fn source_path(&self) -> PathBuf {
        self.base_path.join("source.txt")
    }

    /// Looks up (assigning if new) the id for `fingerprint`, and returns its
    /// [`InstanceDirectory`], materializing it with `dependencies` linked in
    /// if this is the first time the id has been seen.
    ///
    /// # Errors
    ///
    /// Returns [`CasError`] if id assignment or directory materialization
    /// fails.
    pub fn instance(
        &self,
        fingerprint: &[u8],
        dependencies: BTreeMap<String, PathBuf>,
    ) -> Result<(InstanceId, InstanceDirectory), CasError> {
        let id = self.id_table.get(fingerprint)?;
        tracing::debug!(class = %self.name, id, "resolved instance id");
        let dir = InstanceDirectory::open_or_init(&self.results_dir(), id, fingerprint, dependencies)?;
        Ok((id, dir))
    }

    /// Looks up the id already assigned to `fingerprint`, if any, without
    /// assigning one.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Sled`] if the underlying store fails.
    pub fn lookup_id(&self, fingerprint: &[u8]) -> Result<Option<InstanceId>, CasError> {
        if self.id_table.contains(fingerprint)? {
            Ok(Some(self.id_table.get(fingerprint)?))
        } else {
            Ok(None)
        }
    }

    /// Records `source` as this class's current source token if it differs
    /// from what is currently stored, and returns the token's modification
    /// timestamp.
    ///
    /// The token itself is typically a hash or version string identifying
    /// the task class's implementation; staleness (spec.md §4.F) compares an
    /// instance's result timestamp against this timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the token cannot be read or written.
    pub fn touch_source(&self, source: &str) -> Result<SystemTime, CasError> {
        let path = self.source_path();
        let current = fs::read_to_string(&path).ok();
        if current.as_deref() != Some(source) {
            fs::write(&path, source).map_err(|e| CasError::io(&path, e))?;
        }
        self.source_timestamp()
    }

    /// Returns the modification timestamp of the class's current source
    /// token.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if no source token has been recorded yet.
    pub fn source_timestamp(&self) -> Result<SystemTime, CasError> {
        let path = self.source_path();
        fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|e| CasError::io(&path, e))
    }

    /// Invalidates every instance of this class: clears the id table and
    /// wipes the `results/` tree. Subsequent lookups reassign ids from
    /// zero.
    ///
    /// # Errors
    ///
    /// Returns [`CasError`] if the underlying stores fail.
    pub fn clear(&self) -> Result<(), CasError> {
        tracing::info!(class = %self.name, "clearing database");
        self.id_table.clear()?;
        let results = self.results_dir();
        if results.exists() {
            fs::remove_dir_all(&results).map_err(|e| CasError::io(&results, e))?;
        }
        fs::create_dir_all(&results).map_err(|e| CasError::io(&results, e))?;
        Ok(())
    }

    /// Invalidates a single instance: the id is kept, but its stored
    /// result/stdout/stderr are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CasError`] if the instance has never been seen or if the
    /// filesystem operation fails.
    pub fn clear_instance(
        &self,
        fingerprint: &[u8],
        dependencies: BTreeMap<String, PathBuf>,
    ) -> Result<(), CasError> {
        let (_, dir) = self.instance(fingerprint, dependencies)?;
        dir.delete()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn instance_assigns_stable_ids_per_fingerprint() {
        let root = tempdir().unwrap();
        let db = Database::open(root.path(), "Choose").unwrap();
        let (id_a, _) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        let (id_b, _) = db.instance(b"fp-b", BTreeMap::new()).unwrap();
        let (id_a_again, _) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        assert_eq!(id_a, 0);
        assert_eq!(id_b, 1);
        assert_eq!(id_a_again, id_a);
    }

    #[test]
    fn touch_source_is_a_no_op_when_unchanged() {
        let root = tempdir().unwrap();
        let db = Database::open(root.path(), "Choose").unwrap();
        let first = db.touch_source("v1").unwrap();
        let second = db.touch_source("v1").unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn lookup_id_distinguishes_seen_from_unseen() {
        let root = tempdir().unwrap();
        let db = Database::open(root.path(), "Choose").unwrap();
        assert_eq!(db.lookup_id(b"fp-a").unwrap(), None);
        db.instance(b"fp-a", BTreeMap::new()).unwrap();
        assert_eq!(db.lookup_id(b"fp-a").unwrap(), Some(0));
    }

    #[test]
    fn clear_resets_ids_and_wipes_results() {
        let root = tempdir().unwrap();
        let db = Database::open(root.path(), "Choose").unwrap();
        let (_, dir) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        dir.save_result(b"cached").unwrap();
        db.clear().unwrap();
        assert_eq!(db.lookup_id(b"fp-a").unwrap(), None);
        let (id_again, dir_again) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        assert_eq!(id_again, 0);
        assert!(!dir_again.has_result());
    }

    #[test]
    fn clear_instance_keeps_id_but_drops_result() {
        let root = tempdir().unwrap();
        let db = Database::open(root.path(), "Choose").unwrap();
        let (id, dir) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        dir.save_result(b"cached").unwrap();
        db.clear_instance(b"fp-a", BTreeMap::new()).unwrap();
        let (id_again, dir_again) = db.instance(b"fp-a", BTreeMap::new()).unwrap();
        assert_eq!(id, id_again);
        assert!(!dir_again.has_result());
    }
}
