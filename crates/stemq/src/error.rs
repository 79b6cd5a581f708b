use thiserror::Error;
use uuid::Uuid;
use crate::models::JobStatus;

/// Failures of the record store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{table} record {id} not found")]
    NotFound { table: &'static str, id: Uuid },

    #[error("duplicate {table} record: {detail}")]
    Duplicate { table: &'static str, detail: String },

    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("record store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Terminal failures of a pipeline run. The `Display` text is what ends up in
/// the record's `error` field.
#[derive(Debug, Error)]
pub enum JobError {
    /// Source audio could not be retrieved
    #[error("Failed to fetch source audio: {0}")]
    Fetch(String),

    /// Expected output file(s) absent after separation
    #[error("Error writing to file: {0}")]
    Write(String),

    /// The separation capability itself failed
    #[error("{0}")]
    Capability(String),

    /// Remote storage rejected or failed an upload
    #[error("Upload of {key} failed: {message}")]
    Upload { key: String, message: String },

    /// Track or file referenced by the job no longer exists
    #[error("Missing source: {0}")]
    MissingSource(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure of a cascade-delete side effect. Always logged and swallowed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("remote delete of {public_id} failed: {message}")]
    RemoteDelete { public_id: String, message: String },

    #[error("filesystem cleanup failed: {0}")]
    Filesystem(#[from] std::io::Error),
}

/// Rejected job submissions
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("a static mix needs at least one selected part")]
    NoPartsSelected,

    #[error("source track {0} does not exist")]
    UnknownTrack(Uuid),

    #[error("an identical job already exists: {0}")]
    Duplicate(Uuid),

    /// Replacing a job mid-run would pull its workspace out from under it
    #[error("an identical job is still running: {0}")]
    Running(Uuid),

    #[error("failed to store source audio: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}
