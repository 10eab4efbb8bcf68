//! In-memory timestamped key-value store backing the KV handlers.
//!
//! Writes carry the caller's timestamp. A write older than the stored entry is
//! rejected as stale and a write with the same timestamp as an existing key is
//! rejected as a duplicate, which lets replicated writes be applied blindly.

use crate::error::{MeshError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// A stored value with the timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Default)]
pub struct KvStore {
    entries: RwLock<BTreeMap<Vec<u8>, VersionedValue>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `key` at `timestamp`.
    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>, timestamp: i64) -> Result<()> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = entries.get(&key) {
            if current.timestamp > timestamp {
                debug!(
                    requested = timestamp,
                    current = current.timestamp,
                    "rejecting stale write"
                );
                return Err(MeshError::StaleData {
                    current: current.timestamp,
                    requested: timestamp,
                });
            }
            if current.timestamp == timestamp {
                return Err(MeshError::ExistingKey);
            }
        }
        entries.insert(key, VersionedValue { value, timestamp });
        Ok(())
    }

    pub fn read(&self, key: &[u8]) -> Result<VersionedValue> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or(MeshError::KeyNotFound)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
