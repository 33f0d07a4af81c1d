//! Validation and schema migration for untrusted input.
//!
//! Everything arriving from outside the process — the persisted blob at
//! startup, an imported document, a remote sync batch — passes through here
//! before it reaches the store. Classification never mutates; sanitization
//! produces bounded, typed values; migration never fails.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{
    Entry, EntryStatus, GpsCoords, RunNumber, Settings, SyncQueueItem, TimingPoint,
};

/// Current persisted schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Maximum bib length in characters
pub const MAX_BIB_LEN: usize = 10;

/// Maximum device name length in characters
pub const MAX_DEVICE_NAME_LEN: usize = 50;

/// Structural predicate over an untrusted entry value.
///
/// Accepts legacy numeric ids (positive numbers) alongside string ids.
/// Optional fields are rejected when present with the wrong type or out of
/// range; absence is always fine.
#[must_use]
pub fn is_valid_entry(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };

    match obj.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => {}
        Some(Value::Number(id)) if id.as_f64().is_some_and(|n| n > 0.0) => {}
        _ => return false,
    }

    match obj.get("point").and_then(Value::as_str) {
        Some("start" | "finish") => {}
        _ => return false,
    }

    let timestamp_ok = obj
        .get("timestamp")
        .and_then(Value::as_str)
        .is_some_and(|raw| raw.parse::<DateTime<Utc>>().is_ok());
    if !timestamp_ok {
        return false;
    }

    if let Some(bib) = obj.get("bib") {
        match bib.as_str() {
            Some(bib) if bib.chars().count() <= MAX_BIB_LEN => {}
            _ => return false,
        }
    }

    if let Some(run) = obj.get("run") {
        if !matches!(run.as_u64(), Some(1 | 2)) {
            return false;
        }
    }

    if let Some(status) = obj.get("status") {
        let valid = status.as_str().is_some_and(|s| EntryStatus::parse(s).is_some());
        if !valid {
            return false;
        }
    }

    if let Some(synced_at) = obj.get("syncedAt") {
        let valid = synced_at
            .as_f64()
            .is_some_and(|n| n.is_finite() && n >= 0.0);
        if !valid {
            return false;
        }
    }

    for key in ["deviceId", "deviceName"] {
        if let Some(field) = obj.get(key) {
            if !field.is_string() {
                return false;
            }
        }
    }

    if let Some(coords) = obj.get("gpsCoords") {
        let valid = serde_json::from_value::<GpsCoords>(coords.clone())
            .is_ok_and(|c| c.is_well_formed());
        if !valid {
            return false;
        }
    }

    true
}

/// Strip HTML-sensitive and control characters and truncate to `max_len`.
#[must_use]
pub fn sanitize_text(raw: &str, max_len: usize) -> String {
    raw.chars()
        .filter(|c| !c.is_control() && !matches!(c, '<' | '>' | '"' | '\'' | '&' | '`'))
        .take(max_len)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Normalize a structurally valid entry into a typed [`Entry`].
///
/// Returns `None` when the value fails [`is_valid_entry`]. Missing device
/// provenance is substituted with the fallback identity. Photo markers pass
/// through untouched; they are opaque tokens, not rendered text.
#[must_use]
pub fn sanitize_entry(value: &Value, fallback_device_id: &str) -> Option<Entry> {
    if !is_valid_entry(value) {
        return None;
    }
    let obj = value.as_object()?;

    let id = match obj.get("id")? {
        Value::String(id) => id.trim().to_string(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };

    let point = match obj.get("point").and_then(Value::as_str)? {
        "finish" => TimingPoint::Finish,
        _ => TimingPoint::Start,
    };

    let timestamp = obj
        .get("timestamp")
        .and_then(Value::as_str)?
        .parse::<DateTime<Utc>>()
        .ok()?;

    let run = match obj.get("run").and_then(Value::as_u64) {
        Some(2) => RunNumber::Two,
        _ => RunNumber::One,
    };

    let status = obj
        .get("status")
        .and_then(Value::as_str)
        .and_then(EntryStatus::parse)
        .unwrap_or_default();

    let bib = obj
        .get("bib")
        .and_then(Value::as_str)
        .map(|bib| sanitize_text(bib, MAX_BIB_LEN))
        .filter(|bib| !bib.is_empty());

    let device_id = obj
        .get("deviceId")
        .and_then(Value::as_str)
        .map(|id| sanitize_text(id, 64))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| fallback_device_id.to_string());

    let device_name = obj
        .get("deviceName")
        .and_then(Value::as_str)
        .map(|name| sanitize_text(name, MAX_DEVICE_NAME_LEN))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "Unknown device".to_string());

    let synced_at = obj
        .get("syncedAt")
        .and_then(Value::as_f64)
        .map(|n| n as i64);

    let photo = obj
        .get("photo")
        .and_then(Value::as_str)
        .map(ToString::to_string);

    let gps_coords = obj
        .get("gpsCoords")
        .and_then(|coords| serde_json::from_value(coords.clone()).ok());

    Some(Entry {
        id,
        bib,
        point,
        run,
        timestamp,
        status,
        device_id,
        device_name,
        synced_at,
        photo,
        gps_coords,
    })
}

/// Check a device id against the accepted format.
#[must_use]
pub fn is_valid_device_id(id: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z0-9-]{8,64}$").expect("Invalid regex");
    re.is_match(id)
}

/// Check a race id against the allow-listed character set.
#[must_use]
pub fn is_valid_race_id(id: &str) -> bool {
    let re = Regex::new(r"^[A-Za-z0-9_-]{1,32}$").expect("Invalid regex");
    re.is_match(id)
}

/// Structural predicate over an untrusted sync-queue item.
#[must_use]
pub fn is_valid_sync_queue_item(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    let entry_ok = obj.get("entry").is_some_and(is_valid_entry);
    let retry_ok = obj
        .get("retryCount")
        .is_none_or(|n| n.as_u64().is_some());
    let attempt_ok = obj
        .get("lastAttempt")
        .is_none_or(|n| n.as_i64().is_some_and(|ms| ms >= 0));
    entry_ok && retry_ok && attempt_ok
}

/// The current durable snapshot shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSchema {
    pub version: u32,
    pub entries: Vec<Entry>,
    pub settings: Settings,
    pub language: String,
    pub device_id: String,
    pub device_name: String,
    pub race_id: Option<String>,
    pub last_synced_race_id: Option<String>,
    pub sync_queue: Vec<SyncQueueItem>,
}

impl DataSchema {
    /// Fresh defaults for a device with the given identity.
    #[must_use]
    pub fn fresh(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            entries: Vec::new(),
            settings: Settings::default(),
            language: "en".to_string(),
            device_id: device_id.into(),
            device_name: device_name.into(),
            race_id: None,
            last_synced_race_id: None,
            sync_queue: Vec::new(),
        }
    }
}

/// Upgrade an arbitrary persisted blob to the current schema.
///
/// Never fails: completely malformed input yields fresh defaults, because a
/// corrupted blob must not prevent the application from starting. Invalid
/// entries and queue items are dropped; settings are rebuilt field-by-field;
/// identity fields are accepted only when they match the expected format.
#[must_use]
pub fn migrate_schema(value: &Value, fallback_device_id: &str) -> DataSchema {
    let mut schema = DataSchema::fresh(fallback_device_id, default_device_name(fallback_device_id));
    let Some(obj) = value.as_object() else {
        if !value.is_null() {
            tracing::warn!("persisted blob is not an object; starting from defaults");
        }
        return schema;
    };

    if let Some(Value::Array(raw_entries)) = obj.get("entries") {
        let mut dropped = 0usize;
        for raw in raw_entries {
            match sanitize_entry(raw, fallback_device_id) {
                Some(entry) => schema.entries.push(entry),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            tracing::warn!(dropped, "dropped invalid entries during schema migration");
        }
    }

    if let Some(raw_settings) = obj.get("settings") {
        schema.settings = Settings::from_untrusted(raw_settings);
    }

    if let Some(language) = obj.get("language").and_then(Value::as_str) {
        let language = sanitize_text(language, 8);
        if !language.is_empty() {
            schema.language = language;
        }
    }

    if let Some(device_id) = obj.get("deviceId").and_then(Value::as_str) {
        if is_valid_device_id(device_id) {
            schema.device_id = device_id.to_string();
        } else {
            tracing::warn!("persisted device id has unexpected format; regenerating");
        }
    }

    if let Some(device_name) = obj.get("deviceName").and_then(Value::as_str) {
        let device_name = sanitize_text(device_name, MAX_DEVICE_NAME_LEN);
        if !device_name.is_empty() {
            schema.device_name = device_name;
        }
    }

    schema.race_id = obj
        .get("raceId")
        .and_then(Value::as_str)
        .filter(|id| is_valid_race_id(id))
        .map(ToString::to_string);

    schema.last_synced_race_id = obj
        .get("lastSyncedRaceId")
        .and_then(Value::as_str)
        .filter(|id| is_valid_race_id(id))
        .map(ToString::to_string);

    if let Some(Value::Array(raw_queue)) = obj.get("syncQueue") {
        for raw in raw_queue {
            if !is_valid_sync_queue_item(raw) {
                continue;
            }
            let Some(obj) = raw.as_object() else { continue };
            let Some(entry) = obj
                .get("entry")
                .and_then(|e| sanitize_entry(e, fallback_device_id))
            else {
                continue;
            };
            let retry_count = obj
                .get("retryCount")
                .and_then(Value::as_u64)
                .map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));
            let last_attempt = obj.get("lastAttempt").and_then(Value::as_i64).unwrap_or(0);
            schema.sync_queue.push(SyncQueueItem {
                entry,
                retry_count,
                last_attempt,
            });
        }
    }

    schema
}

/// Default human-readable name derived from a device id suffix.
#[must_use]
pub fn default_device_name(device_id: &str) -> String {
    let suffix: String = device_id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("Timer-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn valid_entry_value() -> Value {
        json!({
            "id": "e1",
            "bib": "42",
            "point": "finish",
            "run": 2,
            "timestamp": "2026-02-07T10:15:30Z",
            "status": "ok",
            "deviceId": "finish-timer-01",
            "deviceName": "Finish"
        })
    }

    #[test]
    fn test_is_valid_entry_accepts_well_formed() {
        assert!(is_valid_entry(&valid_entry_value()));
    }

    #[test]
    fn test_is_valid_entry_accepts_legacy_numeric_id() {
        let mut value = valid_entry_value();
        value["id"] = json!(17);
        assert!(is_valid_entry(&value));
        value["id"] = json!(-3);
        assert!(!is_valid_entry(&value));
    }

    #[test]
    fn test_is_valid_entry_rejects_bad_shapes() {
        assert!(!is_valid_entry(&json!(null)));
        assert!(!is_valid_entry(&json!("entry")));

        let mut missing_point = valid_entry_value();
        missing_point.as_object_mut().unwrap().remove("point");
        assert!(!is_valid_entry(&missing_point));

        let mut bad_timestamp = valid_entry_value();
        bad_timestamp["timestamp"] = json!("yesterday");
        assert!(!is_valid_entry(&bad_timestamp));

        let mut long_bib = valid_entry_value();
        long_bib["bib"] = json!("12345678901");
        assert!(!is_valid_entry(&long_bib));

        let mut bad_status = valid_entry_value();
        bad_status["status"] = json!("won");
        assert!(!is_valid_entry(&bad_status));

        let mut negative_synced = valid_entry_value();
        negative_synced["syncedAt"] = json!(-5);
        assert!(!is_valid_entry(&negative_synced));

        let mut bad_run = valid_entry_value();
        bad_run["run"] = json!(3);
        assert!(!is_valid_entry(&bad_run));

        let mut bad_coords = valid_entry_value();
        bad_coords["gpsCoords"] = json!({"latitude": 46.0});
        assert!(!is_valid_entry(&bad_coords));
    }

    #[test]
    fn test_sanitize_entry_normalizes_defaults() {
        let value = json!({
            "id": 99,
            "point": "start",
            "timestamp": "2026-02-07T10:15:30Z"
        });
        let entry = sanitize_entry(&value, "fallback-dev").unwrap();
        assert_eq!(entry.id, "99");
        assert_eq!(entry.run, RunNumber::One);
        assert_eq!(entry.status, EntryStatus::Ok);
        assert_eq!(entry.device_id, "fallback-dev");
        assert_eq!(entry.device_name, "Unknown device");
    }

    #[test]
    fn test_sanitize_entry_scrubs_free_text() {
        let mut value = valid_entry_value();
        value["deviceName"] = json!("<script>Gate\u{0007} B</script>");
        let entry = sanitize_entry(&value, "fallback-dev").unwrap();
        assert_eq!(entry.device_name, "scriptGate B/script");
    }

    #[test]
    fn test_sanitize_entry_passes_photo_marker_through() {
        let mut value = valid_entry_value();
        value["photo"] = json!("photo:abc<123>");
        let entry = sanitize_entry(&value, "fallback-dev").unwrap();
        assert_eq!(entry.photo.as_deref(), Some("photo:abc<123>"));
    }

    #[test]
    fn test_sanitize_text_caps_length() {
        let out = sanitize_text("1234567890123", MAX_BIB_LEN);
        assert_eq!(out, "1234567890");
    }

    #[test]
    fn test_device_and_race_id_formats() {
        assert!(is_valid_device_id("0192ab34-5678-7abc-9def-0123456789ab"));
        assert!(!is_valid_device_id("short"));
        assert!(!is_valid_device_id("has space in it"));

        assert!(is_valid_race_id("GS-2026_run1"));
        assert!(!is_valid_race_id(""));
        assert!(!is_valid_race_id("race id!"));
    }

    #[test]
    fn test_migrate_schema_empty_object_yields_defaults() {
        let schema = migrate_schema(&json!({}), "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.version, SCHEMA_VERSION);
        assert!(schema.entries.is_empty());
        assert_eq!(schema.settings, Settings::default());
        assert_eq!(schema.device_id, "0192ab34-5678-7abc-9def-0123456789ab");
    }

    #[test]
    fn test_migrate_schema_never_panics_on_garbage() {
        for garbage in [json!(null), json!(42), json!("corrupt"), json!([1, 2, 3])] {
            let schema = migrate_schema(&garbage, "0192ab34-5678-7abc-9def-0123456789ab");
            assert!(schema.entries.is_empty());
        }
    }

    #[test]
    fn test_migrate_schema_drops_invalid_entries() {
        let blob = json!({
            "entries": [
                valid_entry_value(),
                {"id": "", "point": "start", "timestamp": "2026-02-07T10:15:30Z"},
                "not an entry"
            ]
        });
        let schema = migrate_schema(&blob, "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.entries.len(), 1);
        assert_eq!(schema.entries[0].id, "e1");
    }

    #[test]
    fn test_migrate_schema_rejects_malformed_identity() {
        let blob = json!({
            "deviceId": "not a device id",
            "raceId": "bad race id!",
            "lastSyncedRaceId": "GS-2026"
        });
        let schema = migrate_schema(&blob, "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.device_id, "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.race_id, None);
        assert_eq!(schema.last_synced_race_id.as_deref(), Some("GS-2026"));
    }

    #[test]
    fn test_migrate_schema_filters_sync_queue() {
        let blob = json!({
            "syncQueue": [
                {"entry": valid_entry_value(), "retryCount": 3, "lastAttempt": 1700000000000i64},
                {"entry": {"id": "", "point": "start"}, "retryCount": 0},
                {"retryCount": 1}
            ]
        });
        let schema = migrate_schema(&blob, "0192ab34-5678-7abc-9def-0123456789ab");
        assert_eq!(schema.sync_queue.len(), 1);
        assert_eq!(schema.sync_queue[0].retry_count, 3);
    }

    #[test]
    fn test_default_device_name_uses_id_suffix() {
        assert_eq!(default_device_name("abcdef123456"), "Timer-3456");
    }
}
