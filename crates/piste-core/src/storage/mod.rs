//! Durable key-value storage contract.
//!
//! The store persists its durable snapshot through this adapter; it is the
//! only boundary at which the core touches storage. Adapters are expected to
//! be cheap for small values and may report a quota estimate out of band.

mod file;

use std::collections::HashMap;

use crate::error::Result;

pub use file::FileStorage;

/// Persisted keys used by the store.
pub mod keys {
    pub const ENTRIES: &str = "entries";
    pub const SETTINGS: &str = "settings";
    pub const LANGUAGE: &str = "language";
    pub const DEVICE_ID: &str = "deviceId";
    pub const DEVICE_NAME: &str = "deviceName";
    pub const RACE_ID: &str = "raceId";
    pub const LAST_SYNCED_RACE_ID: &str = "lastSyncedRaceId";
    pub const SYNC_QUEUE: &str = "syncQueue";
    pub const SCHEMA_VERSION: &str = "schemaVersion";

    /// All keys, in the order they are written during a flush.
    pub const ALL: &[&str] = &[
        SCHEMA_VERSION,
        ENTRIES,
        SETTINGS,
        LANGUAGE,
        DEVICE_ID,
        DEVICE_NAME,
        RACE_ID,
        LAST_SYNCED_RACE_ID,
        SYNC_QUEUE,
    ];
}

/// Out-of-band storage quota estimate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEstimate {
    pub usage_bytes: u64,
    pub quota_bytes: u64,
}

impl QuotaEstimate {
    /// Fraction of the quota in use, in `[0, 1]`.
    #[must_use]
    pub fn usage_ratio(&self) -> f64 {
        if self.quota_bytes == 0 {
            return 0.0;
        }
        self.usage_bytes as f64 / self.quota_bytes as f64
    }
}

/// Key-value durable storage consumed by the store.
///
/// Each value is a JSON-serialized string. `get` on a missing key returns
/// `Ok(None)`; `quota` returns `None` when the backend cannot estimate usage.
pub trait StorageAdapter {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> Result<()>;
    fn quota(&self) -> Option<QuotaEstimate>;
}

/// In-memory adapter used in tests and as a default backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: HashMap<String, String>,
    quota: Option<QuotaEstimate>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the backend reports the given quota estimate.
    #[must_use]
    pub fn with_quota(mut self, usage_bytes: u64, quota_bytes: u64) -> Self {
        self.quota = Some(QuotaEstimate {
            usage_bytes,
            quota_bytes,
        });
        self
    }
}

impl StorageAdapter for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn quota(&self) -> Option<QuotaEstimate> {
        self.quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_memory_storage_round_trip() {
        let mut storage = MemoryStorage::new();
        assert_eq!(storage.get("entries").unwrap(), None);
        storage.set("entries", "[]").unwrap();
        assert_eq!(storage.get("entries").unwrap().as_deref(), Some("[]"));
    }

    #[test]
    fn test_quota_ratio() {
        let estimate = QuotaEstimate {
            usage_bytes: 90,
            quota_bytes: 100,
        };
        assert!((estimate.usage_ratio() - 0.9).abs() < f64::EPSILON);

        let unknown = QuotaEstimate {
            usage_bytes: 10,
            quota_bytes: 0,
        };
        assert!(unknown.usage_ratio().abs() < f64::EPSILON);
    }
}
