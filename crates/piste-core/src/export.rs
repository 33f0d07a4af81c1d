//! Versioned export and import of race data.
//!
//! Exports are plain JSON documents a race official can archive or hand to
//! another device; imports run through the same migration pipeline as the
//! persisted blob, so a tampered or ancient document degrades to a partial
//! import instead of an error.

use std::collections::HashSet;
use std::fmt::Write as _;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Entry, Settings};
use crate::store::Store;
use crate::validate::{migrate_schema, SCHEMA_VERSION};

/// Export output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    Json,
    Csv,
}

impl ExportFormat {
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Versioned export document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub entries: Vec<Entry>,
    pub settings: Settings,
    pub device_id: String,
    pub device_name: String,
    pub race_id: Option<String>,
    /// Epoch millis at which the export was produced
    pub exported_at: i64,
}

/// Outcome of an import attempt. Never raised as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOutcome {
    pub success: bool,
    pub entries_imported: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot the store into an export document.
#[must_use]
pub fn export_data(store: &Store) -> ExportDocument {
    let state = store.state();
    ExportDocument {
        version: SCHEMA_VERSION,
        entries: state.entries.clone(),
        settings: state.settings,
        device_id: state.device_id.clone(),
        device_name: state.device_name.clone(),
        race_id: state.race_id.clone(),
        exported_at: Utc::now().timestamp_millis(),
    }
}

/// Render an export document as pretty-printed JSON.
pub fn render_json_export(document: &ExportDocument) -> serde_json::Result<String> {
    serde_json::to_string_pretty(document)
}

/// Render entries as CSV for spreadsheet-based result processing.
#[must_use]
pub fn render_csv_export(entries: &[Entry]) -> String {
    let mut output = String::from("bib,point,run,timestamp,status,device\n");
    for entry in entries {
        let _ = writeln!(
            output,
            "{},{},{},{},{},{}",
            entry.bib.as_deref().unwrap_or(""),
            entry.point,
            u8::from(entry.run),
            entry.timestamp.to_rfc3339(),
            entry.status,
            entry.device_name.replace(',', " "),
        );
    }
    output
}

/// Build a deterministic default file name for export flows.
#[must_use]
pub fn suggested_export_file_name(format: ExportFormat, timestamp_ms: i64) -> String {
    format!("piste-export-{timestamp_ms}.{}", format.extension())
}

/// Import a JSON document produced by [`export_data`] (any past version).
///
/// Entries whose bare id already exists locally are skipped; the rest are
/// appended and the set re-sorted. Returns a partial-success count rather
/// than failing wholesale.
pub fn import_data(store: &Store, raw: &str) -> ImportOutcome {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(error) => {
            return ImportOutcome {
                success: false,
                entries_imported: 0,
                error: Some(format!("invalid JSON: {error}")),
            }
        }
    };

    let local_device_id = store.state().device_id.clone();
    let schema = migrate_schema(&value, &local_device_id);

    let existing: HashSet<String> = store
        .state()
        .entries
        .iter()
        .map(|entry| entry.id.clone())
        .collect();

    let mut fresh = Vec::new();
    let mut staged: HashSet<String> = HashSet::new();
    for entry in schema.entries {
        if existing.contains(&entry.id) || staged.contains(&entry.id) {
            continue;
        }
        staged.insert(entry.id.clone());
        fresh.push(entry);
    }

    let entries_imported = store.adopt_entries(fresh);
    tracing::info!(entries_imported, "imported entries from document");
    ImportOutcome {
        success: true,
        entries_imported,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RunNumber, TimingPoint};
    use crate::storage::MemoryStorage;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn test_store() -> Store {
        Store::open(Box::new(MemoryStorage::new()))
    }

    fn entry_at(store: &Store, id: &str, secs: u8) -> Entry {
        let state = store.state();
        let mut entry = Entry::new(
            TimingPoint::Finish,
            RunNumber::One,
            Some("9".to_string()),
            state.device_id.clone(),
            state.device_name.clone(),
        );
        entry.id = id.to_string();
        entry.timestamp = chrono::Utc
            .with_ymd_and_hms(2026, 2, 7, 10, 0, u32::from(secs))
            .unwrap();
        entry
    }

    #[test]
    fn export_then_import_into_empty_store() {
        let source = test_store();
        source.add_entry(entry_at(&source, "e1", 10));
        source.add_entry(entry_at(&source, "e2", 20));
        let json = render_json_export(&export_data(&source)).unwrap();

        let target = test_store();
        let outcome = import_data(&target, &json);
        assert_eq!(
            outcome,
            ImportOutcome {
                success: true,
                entries_imported: 2,
                error: None
            }
        );
        assert_eq!(target.state().entries.len(), 2);
    }

    #[test]
    fn import_skips_entries_already_present() {
        let store = test_store();
        store.add_entry(entry_at(&store, "e1", 10));
        let json = render_json_export(&export_data(&store)).unwrap();

        let outcome = import_data(&store, &json);
        assert_eq!(outcome.entries_imported, 0);
        assert!(outcome.success);
        assert_eq!(store.state().entries.len(), 1);
    }

    #[test]
    fn import_reports_invalid_json_without_panicking() {
        let store = test_store();
        let outcome = import_data(&store, "{broken");
        assert!(!outcome.success);
        assert_eq!(outcome.entries_imported, 0);
        assert!(outcome.error.unwrap().contains("invalid JSON"));
    }

    #[test]
    fn import_counts_partial_success_over_garbage_entries() {
        let store = test_store();
        let raw = r#"{
            "entries": [
                {"id": "good", "point": "start", "timestamp": "2026-02-07T10:00:00Z"},
                {"id": "", "point": "start", "timestamp": "2026-02-07T10:00:00Z"},
                {"point": "finish"}
            ]
        }"#;
        let outcome = import_data(&store, raw);
        assert!(outcome.success);
        assert_eq!(outcome.entries_imported, 1);
    }

    #[test]
    fn imported_entries_are_sorted_into_place() {
        let store = test_store();
        store.add_entry(entry_at(&store, "mid", 20));
        let raw = r#"{
            "entries": [
                {"id": "late", "point": "start", "timestamp": "2026-02-07T10:00:30Z"},
                {"id": "early", "point": "start", "timestamp": "2026-02-07T10:00:01Z"}
            ]
        }"#;
        import_data(&store, raw);
        let state = store.state();
        let ids: Vec<&str> = state.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["early", "mid", "late"]);
    }

    #[test]
    fn csv_export_renders_one_line_per_entry() {
        let store = test_store();
        store.add_entry(entry_at(&store, "e1", 10));
        let csv = render_csv_export(&store.state().entries);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "bib,point,run,timestamp,status,device");
        assert!(lines[1].starts_with("9,finish,1,"));
    }

    #[test]
    fn suggested_export_file_name_uses_format_extension() {
        assert_eq!(
            suggested_export_file_name(ExportFormat::Json, 123),
            "piste-export-123.json"
        );
        assert_eq!(
            suggested_export_file_name(ExportFormat::Csv, 456),
            "piste-export-456.csv"
        );
    }
}
