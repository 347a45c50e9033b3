use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] keel_core::Error),
    #[error(transparent)]
    Remote(#[from] keel_core::sync::RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("No payload provided")]
    EmptyPayload,
    #[error("Payload must be a JSON object")]
    PayloadNotObject,
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("Invalid id: {0}")]
    InvalidId(String),
    #[error("Conflict not found: {0}")]
    ConflictNotFound(i64),
    #[error(
        "Sync is not configured. Set remote_base_url in the settings file or KEEL_REMOTE_URL."
    )]
    SyncNotConfigured,
}
