//! Aggregate application state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Entry, RunNumber, Settings, SyncQueueItem, TimingPoint};

/// Top-level view shown by the application shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum View {
    #[default]
    Timer,
    Results,
    Settings,
}

/// Unified sync state shared with the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Offline,
    Syncing,
    Synced,
    Error,
}

/// GPS capture status mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpsStatus {
    #[default]
    Off,
    Acquiring,
    Ready,
    Error,
}

/// Camera capture status mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraStatus {
    #[default]
    Off,
    Ready,
    Error,
}

/// Another device known to be sharing the race id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub device_id: String,
    pub device_name: String,
    /// Epoch millis of the last message seen from this device
    pub last_seen: i64,
}

/// The aggregate root held by the store.
///
/// Created once at startup from persisted storage (or defaults) and replaced
/// wholesale on every mutation; callers treat snapshots as frozen.
#[derive(Debug, Clone, PartialEq)]
pub struct AppState {
    pub view: View,
    pub language: String,
    /// Bib digits typed but not yet attached to an entry
    pub pending_bib: String,
    pub selected_point: TimingPoint,
    pub selected_run: RunNumber,
    /// Always sorted ascending by timestamp
    pub entries: Vec<Entry>,
    pub settings: Settings,
    /// Stable device identity, generated once and persisted
    pub device_id: String,
    pub device_name: String,
    pub race_id: Option<String>,
    pub last_synced_race_id: Option<String>,
    pub sync_status: SyncStatus,
    pub sync_queue: Vec<SyncQueueItem>,
    pub connected_devices: BTreeMap<String, ConnectedDevice>,
    pub cloud_device_count: u32,
    pub cloud_highest_bib: Option<u32>,
    pub gps_status: GpsStatus,
    pub camera_status: CameraStatus,
}

impl AppState {
    /// Fresh defaults for a device with the given identity.
    #[must_use]
    pub fn fresh(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            view: View::default(),
            language: "en".to_string(),
            pending_bib: String::new(),
            selected_point: TimingPoint::Start,
            selected_run: RunNumber::One,
            entries: Vec::new(),
            settings: Settings::default(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            race_id: None,
            last_synced_race_id: None,
            sync_status: SyncStatus::Offline,
            sync_queue: Vec::new(),
            connected_devices: BTreeMap::new(),
            cloud_device_count: 0,
            cloud_highest_bib: None,
            gps_status: GpsStatus::Off,
            camera_status: CameraStatus::Off,
        }
    }
}

/// Sort entries ascending by timestamp, breaking ties by id so the order is
/// deterministic across devices that merged the same set.
pub fn sort_entries(entries: &mut [Entry]) {
    entries.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn entry_at(id: &str, secs: i64) -> Entry {
        let mut entry = Entry::new(TimingPoint::Start, RunNumber::One, None, "dev1", "Start");
        entry.id = id.to_string();
        entry.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
        entry
    }

    #[test]
    fn test_sort_entries_by_timestamp_then_id() {
        let mut entries = vec![entry_at("b", 20), entry_at("c", 10), entry_at("a", 20)];
        sort_entries(&mut entries);
        let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_fresh_state_has_no_entries() {
        let state = AppState::fresh("dev1", "Start gate");
        assert!(state.entries.is_empty());
        assert_eq!(state.sync_status, SyncStatus::Offline);
        assert_eq!(state.language, "en");
    }
}
