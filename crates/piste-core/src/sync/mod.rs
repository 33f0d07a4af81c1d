//! Merge engine: reconciles remote batches into local state.
//!
//! The transport that carries batches between devices is out of scope; it
//! delivers unordered, at-least-once. Everything here is therefore
//! idempotent, and merge commutes with deletion propagation so a deletion
//! arriving before its entry produces the same final state as one arriving
//! after.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Entry;
use crate::store::Store;
use crate::validate::sanitize_entry;

/// Device id substituted for remote entries that arrive without provenance.
const UNKNOWN_REMOTE_DEVICE: &str = "unknown-remote-device";

/// Inbound unit handed over by the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteBatch {
    #[serde(default)]
    pub entries: Vec<Value>,
    /// Deletion identifiers: `"<id>"` or `"<id>:<deviceId>"`
    #[serde(default)]
    pub deleted_ids: Vec<String>,
}

/// Whether the deletion set names this entry, by bare id or composite key.
fn is_deleted(deleted_ids: &HashSet<String>, entry: &Entry) -> bool {
    deleted_ids.contains(&entry.id) || deleted_ids.contains(&entry.composite_key())
}

impl Store {
    /// Fold a batch of remote entries into local state.
    ///
    /// Per entry: reject structural garbage, skip echoes of our own data,
    /// skip anything named by the deletion set, skip composite keys already
    /// present. Accepted entries are appended and the whole set re-sorted.
    /// Returns how many entries were actually added; calling again with the
    /// same batch returns 0.
    pub fn merge_cloud_entries(
        &self,
        remote: &[Value],
        deleted_ids: &HashSet<String>,
    ) -> usize {
        let state = self.state();
        let local_device_id = state.device_id.clone();

        let mut seen: HashSet<String> = state
            .entries
            .iter()
            .map(Entry::composite_key)
            .collect();

        let mut accepted = Vec::new();
        let mut rejected = 0usize;

        for raw in remote {
            let Some(entry) = sanitize_entry(raw, UNKNOWN_REMOTE_DEVICE) else {
                rejected += 1;
                continue;
            };
            if entry.device_id == local_device_id {
                continue; // echo of our own upload
            }
            if is_deleted(deleted_ids, &entry) {
                continue;
            }
            let key = entry.composite_key();
            if seen.contains(&key) {
                continue;
            }
            seen.insert(key);
            accepted.push(entry);
        }

        if rejected > 0 {
            tracing::warn!(rejected, "rejected malformed remote entries during merge");
        }

        let added = self.adopt_entries(accepted);
        if added > 0 {
            tracing::debug!(added, "merged remote entries");
        }
        added
    }

    /// Apply a set of remote deletion identifiers to local state.
    ///
    /// Runs independently of merge; returns how many entries were removed.
    pub fn remove_deleted_cloud_entries(&self, deleted_ids: &HashSet<String>) -> usize {
        if deleted_ids.is_empty() {
            return 0;
        }
        let removed = self.retain_entries(|entry| !is_deleted(deleted_ids, entry));
        if removed > 0 {
            tracing::debug!(removed, "removed entries deleted on other devices");
        }
        removed
    }

    /// Convenience for the transport: apply one inbound batch whole.
    /// Returns `(added, removed)`.
    pub fn apply_remote_batch(&self, batch: &RemoteBatch) -> (usize, usize) {
        let deleted: HashSet<String> = batch.deleted_ids.iter().cloned().collect();
        let removed = self.remove_deleted_cloud_entries(&deleted);
        let added = self.merge_cloud_entries(&batch.entries, &deleted);
        (added, removed)
    }
}
