// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistent fingerprint -> instance id map.
//!
//! Grounded on `examples/original_source/taskproc/database.py`'s `IdTable`:
//! a dict assigning each new key the next integer in sequence, persisted so
//! ids survive process restarts. Here the dict is a `sled::Tree` and "next
//! integer in sequence" is tracked in a reserved counter key so the
//! read-or-assign step can run inside a single transaction.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::{CasError, InstanceId};

const COUNTER_KEY: &[u8] = b"__echo_cas_next_id__";

fn decode_id(bytes: &[u8]) -> InstanceId {
    let mut buf = [0u8; 8];
    let n = bytes.len().min(8);
    buf[..n].copy_from_slice(&bytes[..n]);
    InstanceId::from_be_bytes(buf)
}

/// A durable map from fingerprint bytes to a stable, densely assigned
/// integer id, fronted by an in-process cache.
///
/// The in-process cache makes repeated lookups of a fingerprint already
/// seen by this process id-table-free; the `sled` tree underneath is the
/// source of truth across restarts and is only touched on a cache miss.
pub struct IdTable {
    tree: sled::Tree,
    cache: Mutex<HashMap<Vec<u8>, InstanceId>>,
}

impl IdTable {
    /// Opens (creating if absent) the id table rooted at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Sled`] if the store cannot be opened.
    pub fn open(path: &Path) -> Result<Self, CasError> {
        let db = sled::open(path)?;
        let tree = db.open_tree("fingerprints")?;
        Ok(Self {
            tree,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Returns the id assigned to `fingerprint`, assigning the next unused
    /// id if this is the first time it has been seen.
    ///
    /// Read-or-assign is performed inside a single `sled` transaction, so
    /// two fingerprints racing for the same id within one process (or two
    /// processes sharing the same store) can never both win.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Sled`] if the underlying store fails.
    pub fn get(&self, fingerprint: &[u8]) -> Result<InstanceId, CasError> {
        if let Some(&id) = self.lock_cache().get(fingerprint) {
            return Ok(id);
        }
        let id = self
            .tree
            .transaction(|tx| {
                if let Some(existing) = tx.get(fingerprint)? {
                    return Ok(decode_id(&existing));
                }
                let next = match tx.get(COUNTER_KEY)? {
                    Some(v) => decode_id(&v),
                    None => 0,
                };
                tx.insert(fingerprint, &next.to_be_bytes())?;
                tx.insert(COUNTER_KEY, &(next + 1).to_be_bytes())?;
                Ok(next)
            })
            .map_err(CasError::from)?;
        self.lock_cache().insert(fingerprint.to_vec(), id);
        Ok(id)
    }

    /// Returns `true` if `fingerprint` has already been assigned an id.
    pub fn contains(&self, fingerprint: &[u8]) -> Result<bool, CasError> {
        if self.lock_cache().contains_key(fingerprint) {
            return Ok(true);
        }
        Ok(self.tree.contains_key(fingerprint)?)
    }

    /// Returns every fingerprint currently in the table.
    ///
    /// Not transactionally consistent with concurrent writers — callers
    /// that need a strict snapshot should serialize access externally. In
    /// practice this is used for diagnostics and tests, not executor logic.
    pub fn keys(&self) -> Result<Vec<Vec<u8>>, CasError> {
        let mut out = Vec::new();
        for entry in self.tree.iter() {
            let (key, _) = entry?;
            if key.as_ref() == COUNTER_KEY {
                continue;
            }
            out.push(key.to_vec());
        }
        Ok(out)
    }

    /// Removes every fingerprint/id mapping, resetting the counter.
    ///
    /// # Errors
    ///
    /// Returns [`CasError::Sled`] if the underlying store fails.
    pub fn clear(&self) -> Result<(), CasError> {
        self.tree.clear()?;
        self.lock_cache().clear();
        Ok(())
    }

    #[allow(clippy::significant_drop_tightening)]
    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<Vec<u8>, InstanceId>> {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
