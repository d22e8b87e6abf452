//! Run records and their lifecycle transitions.
//!
//! A run is created in `running` state and moves to exactly one terminal
//! state. Once terminal it is never modified again; late updates are dropped
//! with a warning.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Run, RunStatus, RunUpdate};
use crate::process;
use crate::store::BackupStore;

/// Error message given to runs left `running` by a previous process.
pub const INTERRUPTED_MESSAGE: &str = "Interrupted by restart";

/// Counters of a run, written when the run finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub files_transferred: u64,
    pub files_skipped: u64,
    pub total_bytes: u64,
}

impl RunCounts {
    fn apply_to(self, update: &mut RunUpdate) {
        update.files_transferred = Some(self.files_transferred);
        update.files_skipped = Some(self.files_skipped);
        update.total_bytes = Some(self.total_bytes);
    }
}

#[derive(Clone)]
pub struct RunLedger {
    store: Arc<dyn BackupStore>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn BackupStore>) -> Self {
        Self { store }
    }

    /// Appends a freshly started run.
    pub fn create(&self, run: &Run) -> Result<(), StoreError> {
        debug_assert!(run.is_running());
        self.store.append_run(run)
    }

    /// Appends a freshly started run unless another run is recorded as
    /// `running`, in this process or any other sharing the store. Returns
    /// `false` when refused.
    pub fn admit(&self, run: &Run) -> Result<bool, StoreError> {
        debug_assert!(run.is_running());
        self.store.append_run_exclusive(run)
    }

    pub fn get(&self, id: &str) -> Result<Option<Run>, StoreError> {
        self.store.get_run(id)
    }

    pub fn list(&self, job_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Run>, StoreError> {
        self.store.list_runs(job_id, limit)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        self.store.delete_run(id)
    }

    /// Runs currently recorded as `running`.
    pub fn running(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .store
            .list_runs(None, None)?
            .into_iter()
            .filter(Run::is_running)
            .collect())
    }

    pub fn finish_completed(
        &self,
        id: &str,
        at: DateTime<Utc>,
        counts: RunCounts,
        backup_path: Option<String>,
    ) -> Result<Option<Run>, StoreError> {
        let mut update = RunUpdate::finish(RunStatus::Completed, at);
        counts.apply_to(&mut update);
        update.backup_path = backup_path;
        self.update_live(id, update)
    }

    pub fn finish_failed(
        &self,
        id: &str,
        at: DateTime<Utc>,
        counts: RunCounts,
        backup_path: Option<String>,
        error: &str,
    ) -> Result<Option<Run>, StoreError> {
        let mut update = RunUpdate::finish(RunStatus::Failed, at);
        counts.apply_to(&mut update);
        update.backup_path = backup_path;
        update.error = Some(error.to_string());
        self.update_live(id, update)
    }

    pub fn finish_stopped(
        &self,
        id: &str,
        at: DateTime<Utc>,
        counts: RunCounts,
        backup_path: Option<String>,
    ) -> Result<Option<Run>, StoreError> {
        let mut update = RunUpdate::finish(RunStatus::Stopped, at);
        counts.apply_to(&mut update);
        update.backup_path = backup_path;
        self.update_live(id, update)
    }

    /// Marks `running` runs whose owning process is gone as failed.
    ///
    /// Runs admitted by this process, or by another process that is still
    /// alive, are left alone.
    pub fn recover_interrupted(&self, now: DateTime<Utc>) -> Result<Vec<Run>, StoreError> {
        let mut recovered = Vec::new();
        for run in self.running()? {
            if !process::is_orphaned(&run) {
                log::debug!("Run {} is still supervised, not recovering it", run.id);
                continue;
            }

            let mut update = RunUpdate::finish(RunStatus::Failed, now);
            update.error = Some(INTERRUPTED_MESSAGE.to_string());
            let Some(run) = self.update_live(&run.id, update)? else {
                continue;
            };
            log::warn!(
                "Run {} (job {}) was interrupted by a restart, marked as failed",
                run.id,
                run.job_id.as_deref().unwrap_or("-")
            );
            recovered.push(run);
        }
        Ok(recovered)
    }

    /// Applies `update` if the run is still live. Returns `None` when the run
    /// is already terminal.
    fn update_live(&self, id: &str, update: RunUpdate) -> Result<Option<Run>, StoreError> {
        let run = self.store.get_run(id)?.ok_or_else(|| StoreError::NotFound {
            kind: "run",
            id: id.to_string(),
        })?;

        if !run.is_running() {
            log::warn!(
                "Ignoring update to run {} which already finished as {}",
                id,
                run.status
            );
            return Ok(None);
        }

        self.store.update_run(id, &update).map(Some)
    }
}
