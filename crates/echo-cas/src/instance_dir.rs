// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! On-disk layout for a single task instance.
//!
//! Grounded on `examples/original_source/taskproc/database.py`'s
//! `InstanceDirectory`: a directory named after the instance id, holding the
//! serialized args, the result blob, captured stdout/stderr, a `data/`
//! scratch directory the task body may write into across reruns, and a
//! `deps/` directory recording, for a human poking at the cache, which
//! upstream instance directories fed this one.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::CasError;

const NO_DEPENDENCIES_MARKER: &str = "__NO_DEPENDENCIES__";

/// The on-disk directory backing one task instance.
///
/// Constructing a value does not by itself write anything; [`init`] does.
/// [`open_or_init`] is the usual entry point: it initializes the directory
/// the first time an id is seen and is a no-op thereafter, mirroring
/// upstream's "directory already exists" fast path.
///
/// [`init`]: InstanceDirectory::init
/// [`open_or_init`]: InstanceDirectory::open_or_init
pub struct InstanceDirectory {
    path: PathBuf,
    fingerprint: Vec<u8>,
    dependencies: BTreeMap<String, PathBuf>,
}

impl InstanceDirectory {
    /// Opens the directory for `instance_id` under `results_dir`,
    /// initializing it on first sight.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the directory cannot be created or
    /// written to.
    pub fn open_or_init(
        results_dir: &Path,
        instance_id: u64,
        fingerprint: &[u8],
        dependencies: BTreeMap<String, PathBuf>,
    ) -> Result<Self, CasError> {
        let path = results_dir.join(instance_id.to_string());
        let dir = Self {
            path,
            fingerprint: fingerprint.to_vec(),
            dependencies,
        };
        if !dir.path.exists() {
            dir.init()?;
        }
        Ok(dir)
    }

    /// The instance's root directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path to the stored fingerprint bytes.
    pub fn args_path(&self) -> PathBuf {
        self.path.join("args.json")
    }

    /// Path to the stored, codec-encoded result.
    pub fn result_path(&self) -> PathBuf {
        self.path.join("result")
    }

    /// Path the runner should write captured stdout to.
    pub fn stdout_path(&self) -> PathBuf {
        self.path.join("stdout")
    }

    /// Path the runner should write captured stderr to.
    pub fn stderr_path(&self) -> PathBuf {
        self.path.join("stderr")
    }

    /// Persistent scratch directory a task body may read and write across
    /// reruns of the same instance.
    pub fn data_dir(&self) -> PathBuf {
        self.path.join("data")
    }

    /// Directory recording links to upstream dependency instance directories.
    pub fn deps_dir(&self) -> PathBuf {
        self.path.join("deps")
    }

    /// Wipes and recreates the directory: `args.json`, `data/`, and `deps/`
    /// are rebuilt; `result`/`stdout`/`stderr` are gone until the task is
    /// rerun.
    ///
    /// This is the operation both first-time creation and explicit
    /// invalidation (`clear_task`) reduce to.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if any filesystem operation fails.
    pub fn init(&self) -> Result<(), CasError> {
        if self.path.exists() {
            fs::remove_dir_all(&self.path).map_err(|e| CasError::io(&self.path, e))?;
        }
        fs::create_dir_all(&self.path).map_err(|e| CasError::io(&self.path, e))?;
        fs::write(self.args_path(), &self.fingerprint)
            .map_err(|e| CasError::io(&self.args_path(), e))?;
        fs::create_dir_all(self.data_dir()).map_err(|e| CasError::io(&self.data_dir(), e))?;
        let deps_dir = self.deps_dir();
        fs::create_dir_all(&deps_dir).map_err(|e| CasError::io(&deps_dir, e))?;
        if self.dependencies.is_empty() {
            let marker = deps_dir.join(NO_DEPENDENCIES_MARKER);
            fs::write(&marker, b"").map_err(|e| CasError::io(&marker, e))?;
        } else {
            for (slot, target) in &self.dependencies {
                link_dependency(&deps_dir.join(slot), target)?;
            }
        }
        Ok(())
    }

    /// Invalidates this instance: rebuilds it from scratch via [`init`],
    /// discarding any stored result/stdout/stderr while keeping the same id
    /// and dependency links.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if any filesystem operation fails.
    ///
    /// [`init`]: InstanceDirectory::init
    pub fn delete(&self) -> Result<(), CasError> {
        self.init()
    }

    /// Atomically stores `bytes` as this instance's result, returning the
    /// modification timestamp recorded by the filesystem.
    ///
    /// Writes to a temp file in the same directory then renames over the
    /// final path, so a reader never observes a partially written result.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Io`] if the write or rename fails.
    pub fn save_result(&self, bytes: &[u8]) -> Result<SystemTime, CasError> {
        let tmp = self.path.join("result.tmp");
        fs::write(&tmp, bytes).map_err(|e| CasError::io(&tmp, e))?;
        let dest = self.result_path();
        fs::rename(&tmp, &dest).map_err(|e| CasError::io(&dest, e))?;
        self.result_timestamp()
    }

    /// Loads this instance's stored result bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::MissingResult`] if no result has been stored yet.
    pub fn load_result(&self) -> Result<Vec<u8>, CasError> {
        fs::read(self.result_path()).map_err(|_| CasError::MissingResult)
    }

    /// Returns `true` if a result has been stored for this instance.
    pub fn has_result(&self) -> bool {
        self.result_path().exists()
    }

    /// Returns the modification timestamp of the stored result.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::MissingResult`] if no result has been stored yet.
    pub fn result_timestamp(&self) -> Result<SystemTime, CasError> {
        fs::metadata(self.result_path())
            .and_then(|m| m.modified())
            .map_err(|_| CasError::MissingResult)
    }
}

#[cfg(unix)]
fn link_dependency(link: &Path, target: &Path) -> Result<(), CasError> {
    std::os::unix::fs::symlink(target, link).map_err(|e| CasError::io(link, e))
}

#[cfg(not(unix))]
fn link_dependency(link: &Path, target: &Path) -> Result<(), CasError> {
    fs::write(link, target.to_string_lossy().as_bytes()).map_err(|e| CasError::io(link, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn init_creates_expected_layout() {
        let root = tempdir().unwrap();
        let dir = InstanceDirectory::open_or_init(root.path(), 0, b"fingerprint-bytes", BTreeMap::new())
            .unwrap();
        assert!(dir.args_path().exists());
        assert!(dir.data_dir().is_dir());
        assert!(dir.deps_dir().join(NO_DEPENDENCIES_MARKER).exists());
        assert!(!dir.has_result());
        assert_eq!(fs::read(dir.args_path()).unwrap(), b"fingerprint-bytes");
    }

    #[test]
    fn dependencies_are_linked_by_slot_name() {
        let root = tempdir().unwrap();
        let upstream =
            InstanceDirectory::open_or_init(root.path(), 0, b"upstream", BTreeMap::new()).unwrap();
        let mut deps = BTreeMap::new();
        deps.insert("n".to_string(), upstream.path().to_path_buf());
        let downstream =
            InstanceDirectory::open_or_init(root.path(), 1, b"downstream", deps).unwrap();
        assert!(downstream.deps_dir().join("n").exists());
    }

    #[test]
    fn save_and_load_result_round_trips() {
        let root = tempdir().unwrap();
        let dir =
            InstanceDirectory::open_or_init(root.path(), 0, b"fp", BTreeMap::new()).unwrap();
        dir.save_result(b"encoded-result").unwrap();
        assert!(dir.has_result());
        assert_eq!(dir.load_result().unwrap(), b"encoded-result");
    }

    #[test]
    fn load_result_before_save_is_missing_result_error() {
        let root = tempdir().unwrap();
        let dir =
            InstanceDirectory::open_or_init(root.path(), 0, b"fp", BTreeMap::new()).unwrap();
        let err = dir.load_result().unwrap_err();
        assert!(matches!(err, CasError::MissingResult));
    }

    #[test]
    fn delete_wipes_result_but_keeps_args_and_deps() {
        let root = tempdir().unwrap();
        let upstream =
            InstanceDirectory::open_or_init(root.path(), 0, b"upstream", BTreeMap::new()).unwrap();
        let mut deps = BTreeMap::new();
        deps.insert("n".to_string(), upstream.path().to_path_buf());
        let dir = InstanceDirectory::open_or_init(root.path(), 1, b"fp", deps).unwrap();
        dir.save_result(b"stale").unwrap();
        dir.delete().unwrap();
        assert!(!dir.has_result());
        assert!(dir.args_path().exists());
        assert!(dir.deps_dir().join("n").exists());
    }

    #[test]
    fn open_or_init_is_idempotent_for_existing_directory() {
        let root = tempdir().unwrap();
        let dir =
            InstanceDirectory::open_or_init(root.path(), 0, b"fp", BTreeMap::new()).unwrap();
        dir.save_result(b"keep-me").unwrap();
        let reopened =
            InstanceDirectory::open_or_init(root.path(), 0, b"fp", BTreeMap::new()).unwrap();
        assert!(reopened.has_result());
        assert_eq!(reopened.load_result().unwrap(), b"keep-me");
    }
}
