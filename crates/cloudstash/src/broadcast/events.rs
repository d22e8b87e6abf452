//! Events published while backups run.

use serde::{Deserialize, Serialize};

use crate::transfer::ProgressSample;

/// Why a trigger did not produce a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    /// Another run was active.
    Busy,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Busy => write!(f, "busy"),
        }
    }
}

/// Lifecycle and progress of runs, plus job-level outcomes.
///
/// Within one run, `Started` comes first and exactly one terminal event
/// (`Complete`, `Stopped` or a fatal `Error`) comes last. Job-level events
/// (`Backup*`) follow the run's terminal event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BackupEvent {
    Started {
        run_id: String,
        job_id: Option<String>,
        job_name: Option<String>,
        source_path: String,
        destination: String,
        dry_run: bool,
    },
    Progress {
        run_id: String,
        progress: ProgressSample,
    },
    FileTransferred {
        run_id: String,
        file: String,
    },
    FileSkipped {
        run_id: String,
        file: String,
    },
    UsingPath {
        run_id: String,
        path: String,
    },
    NothingToTransfer {
        run_id: String,
    },
    Log {
        run_id: String,
        line: String,
    },
    /// An error line from the tool (`fatal = false`) or the run's failure.
    Error {
        run_id: String,
        message: String,
        fatal: bool,
    },
    Complete {
        run_id: String,
        files_transferred: u64,
        files_skipped: u64,
        total_bytes: u64,
    },
    Stopped {
        run_id: String,
    },

    BackupStarted {
        run_id: String,
        job_id: Option<String>,
        manual: bool,
    },
    BackupCompleted {
        run_id: String,
        job_id: Option<String>,
        files_transferred: u64,
        total_size: u64,
    },
    BackupError {
        run_id: String,
        job_id: Option<String>,
        error: String,
    },
    BackupSkipped {
        job_id: Option<String>,
        reason: SkipReason,
    },
}

impl BackupEvent {
    pub fn run_id(&self) -> Option<&str> {
        match self {
            BackupEvent::Started { run_id, .. }
            | BackupEvent::Progress { run_id, .. }
            | BackupEvent::FileTransferred { run_id, .. }
            | BackupEvent::FileSkipped { run_id, .. }
            | BackupEvent::UsingPath { run_id, .. }
            | BackupEvent::NothingToTransfer { run_id }
            | BackupEvent::Log { run_id, .. }
            | BackupEvent::Error { run_id, .. }
            | BackupEvent::Complete { run_id, .. }
            | BackupEvent::Stopped { run_id }
            | BackupEvent::BackupStarted { run_id, .. }
            | BackupEvent::BackupCompleted { run_id, .. }
            | BackupEvent::BackupError { run_id, .. } => Some(run_id.as_str()),
            BackupEvent::BackupSkipped { .. } => None,
        }
    }

    /// Job id carried by job-level events.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            BackupEvent::Started { job_id, .. }
            | BackupEvent::BackupStarted { job_id, .. }
            | BackupEvent::BackupCompleted { job_id, .. }
            | BackupEvent::BackupError { job_id, .. }
            | BackupEvent::BackupSkipped { job_id, .. } => job_id.as_deref(),
            _ => None,
        }
    }

    /// Whether this is the last run-scoped event of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BackupEvent::Complete { .. }
                | BackupEvent::Stopped { .. }
                | BackupEvent::Error { fatal: true, .. }
        )
    }

    /// Whether this reports how a job's run ended.
    pub fn is_job_outcome(&self) -> bool {
        matches!(
            self,
            BackupEvent::BackupCompleted { .. } | BackupEvent::BackupError { .. }
        )
    }
}
