//! Piste CLI - Record and inspect race timing entries from the terminal
//!
//! A thin shell over `piste-core`; every command opens the store, performs
//! one operation, and flushes the durable snapshot before exiting.

use std::fs;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand, ValueEnum};
use piste_core::export::{export_data, import_data, render_csv_export, render_json_export};
use piste_core::models::{Action, RunNumber, TimingPoint};
use piste_core::storage::FileStorage;
use piste_core::{Entry, Settings, Store};
use serde::Serialize;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "piste")]
#[command(about = "Race timing from the command line")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to the local state file
    #[arg(long, value_name = "PATH")]
    data_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a timing entry
    #[command(alias = "rec")]
    Record {
        /// Timing point
        #[arg(value_enum)]
        point: PointArg,
        /// Racer bib number
        #[arg(short, long)]
        bib: Option<String>,
        /// Run number (1 or 2)
        #[arg(short, long, default_value = "1")]
        run: u8,
    },
    /// List recorded entries
    List {
        /// Number of entries to show (most recent)
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete an entry by id
    Delete {
        /// Entry id
        id: String,
    },
    /// Delete every entry
    Clear,
    /// Revert the most recent entry action
    Undo,
    /// Re-apply the most recently undone action
    Redo,
    /// Export race data
    Export {
        /// Export format
        #[arg(long, value_enum, default_value_t = FormatArg::Json)]
        format: FormatArg,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Import a previously exported document
    Import {
        /// Path to the export document
        path: PathBuf,
    },
    /// Show entries awaiting remote delivery
    Queue {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show device and race status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Join a race (or leave with --leave)
    Race {
        /// Race identifier shared across devices
        id: Option<String>,
        /// Leave the current race
        #[arg(long)]
        leave: bool,
    },
    /// Rename this device
    Device {
        /// New device name
        name: String,
    },
    /// Toggle sync on or off
    Sync {
        /// Enable or disable
        #[arg(value_enum)]
        state: ToggleArg,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] piste_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid run number: {0} (expected 1 or 2)")]
    InvalidRun(u8),
    #[error("Entry not found: {0}")]
    EntryNotFound(String),
    #[error("Nothing to undo")]
    NothingToUndo,
    #[error("Nothing to redo")]
    NothingToRedo,
    #[error("Race id required (or pass --leave)")]
    RaceIdRequired,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum PointArg {
    Start,
    Finish,
}

impl From<PointArg> for TimingPoint {
    fn from(point: PointArg) -> Self {
        match point {
            PointArg::Start => Self::Start,
            PointArg::Finish => Self::Finish,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum FormatArg {
    Json,
    Csv,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ToggleArg {
    On,
    Off,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("piste=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let data_path = resolve_data_path(cli.data_path);
    tracing::debug!(path = %data_path.display(), "opening state file");
    let store = open_store(&data_path)?;

    match cli.command {
        Commands::Record { point, bib, run } => run_record(&store, point, bib, run)?,
        Commands::List { limit, json } => run_list(&store, limit, json)?,
        Commands::Delete { id } => run_delete(&store, &id)?,
        Commands::Clear => run_clear(&store),
        Commands::Undo => run_undo(&store)?,
        Commands::Redo => run_redo(&store)?,
        Commands::Export { format, output } => run_export(&store, format, output.as_deref())?,
        Commands::Import { path } => run_import(&store, &path)?,
        Commands::Queue { json } => run_queue(&store, json)?,
        Commands::Status { json } => run_status(&store, json)?,
        Commands::Race { id, leave } => run_race(&store, id, leave)?,
        Commands::Device { name } => run_device(&store, name),
        Commands::Sync { state } => run_sync_toggle(&store, state),
    }

    // durable write before exit, bypassing the debounce
    store.flush_now();
    Ok(())
}

fn resolve_data_path(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("piste")
            .join("state.json")
    })
}

fn open_store(data_path: &Path) -> Result<Store, CliError> {
    let adapter = FileStorage::open(data_path)?;
    let store = Store::open(Box::new(adapter));
    store.on_storage_event(|event| eprintln!("Warning: {event:?}"));
    Ok(store)
}

fn run_record(
    store: &Store,
    point: PointArg,
    bib: Option<String>,
    run: u8,
) -> Result<(), CliError> {
    let run = RunNumber::try_from(run).map_err(|_| CliError::InvalidRun(run))?;
    let state = store.state();
    let entry = Entry::new(
        point.into(),
        run,
        bib,
        state.device_id.clone(),
        state.device_name.clone(),
    );
    let id = entry.id.clone();
    store.add_entry(entry);
    println!("{id}");
    Ok(())
}

#[derive(Debug, Serialize)]
struct EntryListItem {
    id: String,
    bib: String,
    point: String,
    run: u8,
    timestamp: String,
    status: String,
    device: String,
    synced: bool,
}

fn entry_to_list_item(entry: &Entry) -> EntryListItem {
    EntryListItem {
        id: entry.id.clone(),
        bib: entry.bib.clone().unwrap_or_default(),
        point: entry.point.to_string(),
        run: entry.run.into(),
        timestamp: entry.timestamp.to_rfc3339(),
        status: entry.status.to_string(),
        device: entry.device_name.clone(),
        synced: entry.synced_at.is_some(),
    }
}

fn run_list(store: &Store, limit: usize, as_json: bool) -> Result<(), CliError> {
    let state = store.state();
    let shown = state.entries.iter().rev().take(limit).rev();

    if as_json {
        let items: Vec<EntryListItem> = shown.map(entry_to_list_item).collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for entry in shown {
            let bib = entry.bib.as_deref().unwrap_or("-");
            println!(
                "{}  bib {:>4}  {:6}  run {}  {}  [{}]",
                entry.timestamp.format("%H:%M:%S%.3f"),
                bib,
                entry.point.to_string(),
                u8::from(entry.run),
                entry.status,
                entry.id,
            );
        }
    }
    Ok(())
}

fn run_delete(store: &Store, id: &str) -> Result<(), CliError> {
    let removed = store
        .delete_entry(id)
        .ok_or_else(|| CliError::EntryNotFound(id.to_string()))?;
    println!("deleted {}", removed.id);
    Ok(())
}

fn run_clear(store: &Store) {
    let cleared = store.clear_entries();
    println!("cleared {} entries", cleared.len());
}

fn run_undo(store: &Store) -> Result<(), CliError> {
    let action = store.undo().ok_or(CliError::NothingToUndo)?;
    // an undone add must not reach other devices
    if let Action::AddEntry(entry) = &action {
        store.remove_from_sync_queue(&entry.id);
    }
    println!("undid: {}", action.label());
    Ok(())
}

fn run_redo(store: &Store) -> Result<(), CliError> {
    let action = store.redo().ok_or(CliError::NothingToRedo)?;
    println!("redid: {}", action.label());
    Ok(())
}

fn run_export(
    store: &Store,
    format: FormatArg,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let rendered = match format {
        FormatArg::Json => render_json_export(&export_data(store))?,
        FormatArg::Csv => render_csv_export(&store.state().entries),
    };

    match output {
        Some(path) => {
            fs::write(path, rendered)?;
            println!("exported to {}", path.display());
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

fn run_import(store: &Store, path: &Path) -> Result<(), CliError> {
    let raw = fs::read_to_string(path)?;
    let outcome = import_data(store, &raw);
    if outcome.success {
        println!("imported {} entries", outcome.entries_imported);
    } else {
        println!(
            "import failed: {}",
            outcome.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}

fn run_queue(store: &Store, as_json: bool) -> Result<(), CliError> {
    let state = store.state();
    if as_json {
        println!("{}", serde_json::to_string_pretty(&state.sync_queue)?);
    } else if state.sync_queue.is_empty() {
        println!("sync queue empty");
    } else {
        for item in &state.sync_queue {
            println!(
                "{}  retries {}  last attempt {}",
                item.entry.id, item.retry_count, item.last_attempt
            );
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StatusReport {
    device_id: String,
    device_name: String,
    race_id: Option<String>,
    entries: usize,
    queued: usize,
    sync_enabled: bool,
}

fn run_status(store: &Store, as_json: bool) -> Result<(), CliError> {
    let state = store.state();
    let report = StatusReport {
        device_id: state.device_id.clone(),
        device_name: state.device_name.clone(),
        race_id: state.race_id.clone(),
        entries: state.entries.len(),
        queued: state.sync_queue.len(),
        sync_enabled: state.settings.sync_enabled,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("device: {} ({})", report.device_name, report.device_id);
        println!(
            "race:   {}",
            report.race_id.as_deref().unwrap_or("(none)")
        );
        println!("entries: {}  queued: {}", report.entries, report.queued);
        println!("sync:    {}", if report.sync_enabled { "on" } else { "off" });
    }
    Ok(())
}

fn run_race(store: &Store, id: Option<String>, leave: bool) -> Result<(), CliError> {
    if leave {
        store.set_race_id(None)?;
        println!("left race");
        return Ok(());
    }
    let id = id.ok_or(CliError::RaceIdRequired)?;
    store.set_race_id(Some(id.clone()))?;
    println!("joined race {id}");
    Ok(())
}

fn run_device(store: &Store, name: String) {
    store.set_device_name(name);
    println!("device renamed to {}", store.state().device_name);
}

fn run_sync_toggle(store: &Store, state: ToggleArg) {
    let settings = Settings {
        sync_enabled: state == ToggleArg::On,
        ..store.state().settings
    };
    store.update_settings(settings);
    println!(
        "sync {}",
        if state == ToggleArg::On { "enabled" } else { "disabled" }
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_at(dir: &Path) -> Store {
        open_store(&dir.join("state.json")).unwrap()
    }

    #[test]
    fn record_then_list_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        run_record(&store, PointArg::Start, Some("7".to_string()), 1).unwrap();
        store.flush_now();

        let reopened = store_at(dir.path());
        let state = reopened.state();
        assert_eq!(state.entries.len(), 1);
        assert_eq!(state.entries[0].bib.as_deref(), Some("7"));
    }

    #[test]
    fn record_rejects_invalid_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        let error = run_record(&store, PointArg::Start, None, 3).unwrap_err();
        assert!(matches!(error, CliError::InvalidRun(3)));
    }

    #[test]
    fn undo_clears_pending_sync_for_the_undone_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        store.update_settings(Settings {
            sync_enabled: true,
            ..store.state().settings
        });
        store.set_race_id(Some("GS-2026".to_string())).unwrap();
        run_record(&store, PointArg::Start, Some("7".to_string()), 1).unwrap();
        assert_eq!(store.state().sync_queue.len(), 1);

        run_undo(&store).unwrap();
        assert!(store.state().entries.is_empty());
        assert!(store.state().sync_queue.is_empty());
    }

    #[test]
    fn undo_without_history_reports_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_at(dir.path());
        assert!(matches!(run_undo(&store), Err(CliError::NothingToUndo)));
    }

    #[test]
    fn resolve_data_path_prefers_explicit() {
        let explicit = PathBuf::from("/tmp/custom.json");
        assert_eq!(resolve_data_path(Some(explicit.clone())), explicit);
    }
}
