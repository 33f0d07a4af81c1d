//! piste-core - Core library for Piste
//!
//! This crate contains the local-first state store, the multi-device merge
//! engine, and the validation/migration layer shared by all Piste
//! interfaces. The UI, capture hardware, and sync transport live outside;
//! they interact with this core only through [`Store`] methods and state
//! snapshots.

pub mod error;
pub mod export;
pub mod models;
pub mod storage;
pub mod store;
pub mod sync;
pub mod validate;

pub use error::{Error, Result};
pub use models::{AppState, Entry, EntryStatus, RunNumber, Settings, TimingPoint};
pub use store::{ChangedKey, ListenerId, Notification, StorageEvent, Store};
