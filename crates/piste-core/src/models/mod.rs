//! Data models for piste-core

mod action;
mod app_state;
mod entry;
mod settings;
mod sync_queue;

pub use action::{Action, UndoRecord, MAX_UNDO_DEPTH};
pub use app_state::{
    sort_entries, AppState, CameraStatus, ConnectedDevice, GpsStatus, SyncStatus, View,
};
pub use entry::{Entry, EntryStatus, GpsCoords, RunNumber, TimingPoint};
pub use settings::Settings;
pub use sync_queue::SyncQueueItem;
