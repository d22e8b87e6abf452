//! Pruning of old completed runs.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::StoreError;
use crate::ledger::RunLedger;
use crate::model::{Retention, Run, RunStatus};
use crate::store::BackupStore;
use crate::transfer::ArtifactStore;

/// What one enforcement pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Completed runs still kept.
    pub kept: usize,
    /// Ids of removed runs, oldest last.
    pub pruned: Vec<String>,
    /// Pruned runs whose artifacts could not be deleted.
    pub artifact_failures: usize,
}

pub struct RetentionManager {
    store: Arc<dyn BackupStore>,
    ledger: RunLedger,
    artifacts: Arc<dyn ArtifactStore>,
}

impl RetentionManager {
    pub fn new(
        store: Arc<dyn BackupStore>,
        ledger: RunLedger,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            store,
            ledger,
            artifacts,
        }
    }

    /// Removes completed runs of `job_id` beyond its retention count, with
    /// their artifacts.
    ///
    /// Only completed, non-dry runs count and are pruned. A retention count
    /// of zero still keeps the newest one. Artifact deletion failures are
    /// logged and counted; the run record stays deleted.
    pub async fn enforce(&self, job_id: &str) -> Result<RetentionReport, StoreError> {
        let Some(job) = self.store.get_job(job_id)? else {
            log::debug!("Retention skipped, job {} no longer exists", job_id);
            return Ok(RetentionReport::default());
        };

        let keep = match job.retention {
            Retention::Unlimited => return Ok(RetentionReport::default()),
            Retention::Keep(n) => (n as usize).max(1),
        };

        let runs = self.ledger.list(Some(job_id), None)?;
        let doomed: HashSet<&str> = runs
            .iter()
            .filter(|run| run.status == RunStatus::Completed && !run.dry_run)
            .skip(keep)
            .map(|run| run.id.as_str())
            .collect();

        // Folders still referenced by a surviving run are never purged.
        let referenced: HashSet<(Option<&str>, &str)> = runs
            .iter()
            .filter(|run| !doomed.contains(run.id.as_str()))
            .filter_map(|run| {
                run.backup_path
                    .as_deref()
                    .map(|path| (run.bucket_id.as_deref(), path))
            })
            .collect();

        let mut report = RetentionReport::default();
        for run in &runs {
            if run.status != RunStatus::Completed || run.dry_run {
                continue;
            }
            if !doomed.contains(run.id.as_str()) {
                report.kept += 1;
                continue;
            }
            if !self.ledger.delete(&run.id)? {
                continue;
            }
            log::info!(
                "Pruned run {} of job '{}' (retention {})",
                run.id,
                job.name,
                keep
            );

            let shared = run
                .backup_path
                .as_deref()
                .is_some_and(|path| referenced.contains(&(run.bucket_id.as_deref(), path)));
            if shared {
                log::warn!(
                    "Keeping artifacts of pruned run {}, a kept run still uses {}",
                    run.id,
                    run.backup_path.as_deref().unwrap_or_default()
                );
            } else if !self.delete_artifacts(run).await {
                report.artifact_failures += 1;
            }
            report.pruned.push(run.id.clone());
        }

        Ok(report)
    }

    /// Returns `false` if the run had artifacts that could not be removed.
    pub async fn delete_artifacts(&self, run: &Run) -> bool {
        let Some(path) = run.backup_path.as_deref() else {
            return true;
        };
        if run.dry_run {
            return true;
        }

        let bucket = match run.bucket_id.as_deref().map(|id| self.store.get_bucket(id)) {
            Some(Ok(Some(bucket))) => bucket,
            Some(Ok(None)) | None => {
                log::warn!(
                    "Cannot delete artifacts of run {}: bucket is unknown",
                    run.id
                );
                return false;
            }
            Some(Err(e)) => {
                log::warn!("Cannot delete artifacts of run {}: {}", run.id, e);
                return false;
            }
        };

        match self.artifacts.delete(&bucket, path).await {
            Ok(()) => {
                log::debug!("Deleted artifacts at {}", path);
                true
            }
            Err(e) => {
                log::warn!("Failed to delete artifacts of run {} at {}: {}", run.id, path, e);
                false
            }
        }
    }
}
