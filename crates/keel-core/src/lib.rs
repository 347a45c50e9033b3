//! keel-core - Offline-first sync engine for the Keel logbook
//!
//! This crate contains the local store, the durable change log, conflict
//! detection and the sync orchestrator shared by all Keel clients.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod sync;
pub mod util;

pub use config::SyncSettings;
pub use error::{Error, Result};
pub use models::{ChangeKind, ChangeRecord, EntityId, EntityType, SyncConflict, SyncableEntity};
pub use services::DatabaseService;
pub use sync::{HttpRemote, RealtimeChannel, SyncOrchestrator, SyncResult};
