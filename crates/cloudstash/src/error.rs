use std::path::PathBuf;
use thiserror::Error;

use crate::model::ValidationError;

#[derive(Error, Debug)]
pub enum CloudstashError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backup not started: {0}")]
    Admission(#[from] AdmissionError),

    #[error("Transfer error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// Errors raised by a [`crate::store::BackupStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] crate::db::DatabaseError),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid record: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Run {0} is still running")]
    RunActive(String),

    #[error("Corrupt {kind} record '{id}': {reason}")]
    Corrupt {
        kind: &'static str,
        id: String,
        reason: String,
    },
}

/// Errors from the process supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("A transfer is already running")]
    Busy,

    #[error("Failed to launch transfer tool '{binary}': {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Reasons a backup trigger was not turned into a running transfer.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Another backup is already running")]
    Busy { active_job_id: Option<String> },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("No source path given and no job to take it from")]
    MissingSource,

    /// The run was recorded and immediately finalized as failed.
    #[error("Transfer tool could not be started: {message}")]
    Spawn { run_id: String, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AdmissionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, AdmissionError::Busy { .. })
    }
}

/// Errors from remote bucket operations (listing, purging artifacts).
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to launch transfer tool '{binary}': {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote command failed: {0}")]
    CommandFailed(String),

    #[error("Failed to parse remote listing: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, CloudstashError>;
