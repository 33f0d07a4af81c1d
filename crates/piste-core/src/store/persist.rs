//! Debounced persistence of the durable snapshot.
//!
//! The store never awaits storage; mutations arm an explicit debounce handle
//! and the embedding loop calls [`crate::store::Store::tick`] (or
//! `flush_now` before shutdown). Write failures surface as [`StorageEvent`]s
//! so the UI can warn the user; they are never returned to the mutator.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::models::{sort_entries, AppState, Entry};
use crate::storage::{keys, StorageAdapter};
use crate::validate::{migrate_schema, DataSchema, SCHEMA_VERSION};

/// Debounce window between a mutation and the durable write.
pub const PERSIST_DEBOUNCE: Duration = Duration::from_millis(100);

/// Quota usage ratio past which a warning event is raised.
pub const QUOTA_WARNING_RATIO: f64 = 0.9;

/// Process-wide storage event, delivered via the store's storage callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    /// A durable write failed; state lives on in memory only.
    WriteFailed { key: String, message: String },
    /// Storage usage crossed [`QUOTA_WARNING_RATIO`].
    QuotaWarning { usage_bytes: u64, quota_bytes: u64 },
}

/// Explicit scheduled-write handle: armed on mutation, cancelled on flush.
///
/// Re-arming pushes the deadline out, so a burst of mutations produces a
/// single write once the burst settles.
#[derive(Debug)]
pub struct PersistScheduler {
    deadline: Option<Instant>,
    delay: Duration,
}

impl PersistScheduler {
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self {
            deadline: None,
            delay,
        }
    }

    /// Arm (or re-arm) the scheduler relative to `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the debounce window has elapsed.
    #[must_use]
    pub fn due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

impl Default for PersistScheduler {
    fn default() -> Self {
        Self::new(PERSIST_DEBOUNCE)
    }
}

/// Reduce a photo field to an opaque marker before persisting.
///
/// Raw payloads (data URLs) must never reach durable storage through this
/// layer; markers pass through unchanged.
fn strip_photo_payload(entry: &Entry) -> Entry {
    let mut entry = entry.clone();
    if let Some(photo) = &entry.photo {
        if photo.starts_with("data:") || photo.len() > 128 {
            entry.photo = Some("[photo]".to_string());
        }
    }
    entry
}

/// Build the durable snapshot for the given state.
#[must_use]
pub(crate) fn durable_schema(state: &AppState) -> DataSchema {
    DataSchema {
        version: SCHEMA_VERSION,
        entries: state.entries.iter().map(strip_photo_payload).collect(),
        settings: state.settings,
        language: state.language.clone(),
        device_id: state.device_id.clone(),
        device_name: state.device_name.clone(),
        race_id: state.race_id.clone(),
        last_synced_race_id: state.last_synced_race_id.clone(),
        sync_queue: state.sync_queue.clone(),
    }
}

/// Write the durable snapshot, one key at a time.
///
/// A failing key is reported and skipped so the remaining keys still land.
/// Returns the events to deliver; empty means a clean write.
pub(crate) fn write_durable_snapshot(
    adapter: &mut dyn StorageAdapter,
    state: &AppState,
) -> Vec<StorageEvent> {
    let mut events = Vec::new();

    if let Some(quota) = adapter.quota() {
        if quota.usage_ratio() >= QUOTA_WARNING_RATIO {
            tracing::warn!(
                usage = quota.usage_bytes,
                quota = quota.quota_bytes,
                "storage quota nearly exhausted"
            );
            events.push(StorageEvent::QuotaWarning {
                usage_bytes: quota.usage_bytes,
                quota_bytes: quota.quota_bytes,
            });
        }
    }

    let schema = durable_schema(state);
    let pairs: Vec<(&str, serde_json::Result<String>)> = vec![
        (keys::SCHEMA_VERSION, serde_json::to_string(&schema.version)),
        (keys::ENTRIES, serde_json::to_string(&schema.entries)),
        (keys::SETTINGS, serde_json::to_string(&schema.settings)),
        (keys::LANGUAGE, serde_json::to_string(&schema.language)),
        (keys::DEVICE_ID, serde_json::to_string(&schema.device_id)),
        (keys::DEVICE_NAME, serde_json::to_string(&schema.device_name)),
        (keys::RACE_ID, serde_json::to_string(&schema.race_id)),
        (
            keys::LAST_SYNCED_RACE_ID,
            serde_json::to_string(&schema.last_synced_race_id),
        ),
        (keys::SYNC_QUEUE, serde_json::to_string(&schema.sync_queue)),
    ];

    for (key, serialized) in pairs {
        let value = match serialized {
            Ok(value) => value,
            Err(error) => {
                events.push(StorageEvent::WriteFailed {
                    key: key.to_string(),
                    message: error.to_string(),
                });
                continue;
            }
        };
        if let Err(error) = adapter.set(key, &value) {
            tracing::warn!(key, %error, "durable write failed");
            events.push(StorageEvent::WriteFailed {
                key: key.to_string(),
                message: error.to_string(),
            });
        }
    }

    events
}

/// Load persisted state through migration, falling back to defaults.
///
/// Read failures on individual keys degrade to absence; the blob assembled
/// from whatever was readable goes through [`migrate_schema`], which never
/// fails.
pub(crate) fn load_persisted(
    adapter: &dyn StorageAdapter,
    fallback_device_id: &str,
) -> DataSchema {
    let mut blob = serde_json::Map::new();

    let fields = [
        (keys::SCHEMA_VERSION, "version"),
        (keys::ENTRIES, "entries"),
        (keys::SETTINGS, "settings"),
        (keys::LANGUAGE, "language"),
        (keys::DEVICE_ID, "deviceId"),
        (keys::DEVICE_NAME, "deviceName"),
        (keys::RACE_ID, "raceId"),
        (keys::LAST_SYNCED_RACE_ID, "lastSyncedRaceId"),
        (keys::SYNC_QUEUE, "syncQueue"),
    ];

    for (key, field) in fields {
        match adapter.get(key) {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => {
                    blob.insert(field.to_string(), value);
                }
                Err(error) => {
                    tracing::warn!(key, %error, "persisted value unparseable; ignoring");
                }
            },
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(key, %error, "persisted value unreadable; ignoring");
            }
        }
    }

    let mut schema = migrate_schema(&Value::Object(blob), fallback_device_id);
    sort_entries(&mut schema.entries);
    schema
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunNumber, TimingPoint};
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scheduler_arm_cancel_due() {
        let mut scheduler = PersistScheduler::new(Duration::from_millis(100));
        let start = Instant::now();
        assert!(!scheduler.due(start));

        scheduler.arm(start);
        assert!(scheduler.is_armed());
        assert!(!scheduler.due(start + Duration::from_millis(50)));
        assert!(scheduler.due(start + Duration::from_millis(100)));

        // re-arming pushes the deadline out
        scheduler.arm(start + Duration::from_millis(80));
        assert!(!scheduler.due(start + Duration::from_millis(100)));
        assert!(scheduler.due(start + Duration::from_millis(180)));

        scheduler.cancel();
        assert!(!scheduler.due(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_strip_photo_payload() {
        let mut entry = Entry::new(TimingPoint::Finish, RunNumber::One, None, "dev1", "Finish");
        entry.photo = Some("data:image/jpeg;base64,AAAA".to_string());
        assert_eq!(strip_photo_payload(&entry).photo.as_deref(), Some("[photo]"));

        entry.photo = Some("photo:abc123".to_string());
        assert_eq!(
            strip_photo_payload(&entry).photo.as_deref(),
            Some("photo:abc123")
        );
    }

    #[test]
    fn test_write_then_load_round_trip() {
        let mut adapter = MemoryStorage::new();
        let mut state = AppState::fresh("0192ab34-5678-7abc-9def-0123456789ab", "Start gate");
        state
            .entries
            .push(Entry::new(TimingPoint::Start, RunNumber::One, Some("7".into()), state.device_id.clone(), "Start gate"));
        state.race_id = Some("GS-2026".to_string());

        let events = write_durable_snapshot(&mut adapter, &state);
        assert!(events.is_empty());

        let schema = load_persisted(&adapter, "fallback-0000-0000");
        assert_eq!(schema.entries.len(), 1);
        assert_eq!(schema.device_id, "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.race_id.as_deref(), Some("GS-2026"));
    }

    #[test]
    fn test_quota_warning_event() {
        let mut adapter = MemoryStorage::new().with_quota(95, 100);
        let state = AppState::fresh("0192ab34-5678-7abc-9def-0123456789ab", "Start gate");
        let events = write_durable_snapshot(&mut adapter, &state);
        assert_eq!(
            events,
            vec![StorageEvent::QuotaWarning {
                usage_bytes: 95,
                quota_bytes: 100
            }]
        );
    }
}
