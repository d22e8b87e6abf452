use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error(transparent)]
    Engine(#[from] cloudstash::CloudstashError),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[source] std::io::Error),

    #[error("Failed to encode output: {0}")]
    Output(#[from] serde_json::Error),

    #[error("Backup {run_id} failed: {message}")]
    BackupFailed { run_id: String, message: String },

    #[error("Event stream closed before the backup finished")]
    EventsClosed,
}

impl From<cloudstash::AdmissionError> for DaemonError {
    fn from(e: cloudstash::AdmissionError) -> Self {
        DaemonError::Engine(e.into())
    }
}

impl From<cloudstash::ConfigError> for DaemonError {
    fn from(e: cloudstash::ConfigError) -> Self {
        DaemonError::Engine(e.into())
    }
}

impl From<cloudstash::db::DatabaseError> for DaemonError {
    fn from(e: cloudstash::db::DatabaseError) -> Self {
        DaemonError::Engine(e.into())
    }
}

pub type Result<T> = std::result::Result<T, DaemonError>;
