//! Backup run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a run. Every status except `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "completed" => Some(RunStatus::Completed),
            "failed" => Some(RunStatus::Failed),
            "stopped" => Some(RunStatus::Stopped),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Run {
    pub id: String,
    /// `None` for ad-hoc backups started without a job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket_id: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
    /// Path inside the bucket the run wrote to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dry_run: bool,
    pub manual: bool,
    /// Process that admitted the run. Unknown for records written by older
    /// builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<RunOwner>,
}

/// Identity of the process supervising a live run.
///
/// `instance` is unique per process lifetime, so a reused pid can be told
/// apart from the process that originally admitted the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOwner {
    pub pid: u32,
    pub instance: String,
}

impl Run {
    /// Creates a run in `Running` state with a fresh id.
    pub fn start(job_id: Option<&str>, bucket_id: Option<&str>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.map(str::to_string),
            bucket_id: bucket_id.map(str::to_string),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            files_transferred: 0,
            files_skipped: 0,
            total_bytes: 0,
            backup_path: None,
            error: None,
            dry_run: false,
            manual: false,
            owner: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    /// Applies a partial update. Fields left as `None` are untouched.
    pub fn apply(&mut self, update: &RunUpdate) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if update.completed_at.is_some() {
            self.completed_at = update.completed_at;
        }
        if let Some(n) = update.files_transferred {
            self.files_transferred = n;
        }
        if let Some(n) = update.files_skipped {
            self.files_skipped = n;
        }
        if let Some(n) = update.total_bytes {
            self.total_bytes = n;
        }
        if update.backup_path.is_some() {
            self.backup_path = update.backup_path.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
    }
}

/// Partial update of a run record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub files_transferred: Option<u64>,
    pub files_skipped: Option<u64>,
    pub total_bytes: Option<u64>,
    pub backup_path: Option<String>,
    pub error: Option<String>,
}

impl RunUpdate {
    /// Update that moves a run into a terminal status.
    pub fn finish(status: RunStatus, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status),
            completed_at: Some(completed_at),
            ..Default::default()
        }
    }
}
