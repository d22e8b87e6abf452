//! SQLite-backed store.

use std::path::PathBuf;

use chrono::{DateTime, Utc};

use super::BackupStore;
use crate::db::bucket_repo::{self, BucketRow};
use crate::db::job_repo::{self, JobRow};
use crate::db::run_repo::{self, RunRow};
use crate::db::{format_timestamp, Database};
use crate::error::StoreError;
use crate::model::{Bucket, Job, Recurrence, Retention, Run, RunOwner, RunStatus, RunUpdate};

// ─── Helpers ────────────────────────────────────────────────────────────────

fn parse_timestamp(s: &str, kind: &'static str, id: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            kind,
            id: id.to_string(),
            reason: format!("bad timestamp '{}': {}", s, e),
        })
}

fn to_count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

fn from_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn job_from_row(row: JobRow) -> Result<Job, StoreError> {
    let schedule = match row.schedule.as_deref() {
        Some(json) => Some(
            serde_json::from_str::<Recurrence>(json).map_err(|e| StoreError::Corrupt {
                kind: "job",
                id: row.id.clone(),
                reason: format!("bad schedule: {}", e),
            })?,
        ),
        None => None,
    };

    Ok(Job {
        created_at: parse_timestamp(&row.created_at, "job", &row.id)?,
        updated_at: parse_timestamp(&row.updated_at, "job", &row.id)?,
        source_path: PathBuf::from(row.source_path),
        retention: Retention::from(row.retention_count),
        schedule,
        id: row.id,
        name: row.name,
        bucket_id: row.bucket_id,
        destination: row.destination,
    })
}

fn job_to_row(job: &Job) -> Result<JobRow, StoreError> {
    let schedule = match &job.schedule {
        Some(schedule) => Some(serde_json::to_string(schedule).map_err(|e| {
            StoreError::Corrupt {
                kind: "job",
                id: job.id.clone(),
                reason: e.to_string(),
            }
        })?),
        None => None,
    };

    Ok(JobRow {
        id: job.id.clone(),
        name: job.name.clone(),
        source_path: job.source_path.to_string_lossy().to_string(),
        bucket_id: job.bucket_id.clone(),
        destination: job.destination.clone(),
        schedule,
        retention_count: job.retention.as_count(),
        created_at: format_timestamp(job.created_at),
        updated_at: format_timestamp(job.updated_at),
    })
}

fn bucket_from_row(row: BucketRow) -> Bucket {
    Bucket {
        id: row.id,
        name: row.name,
        provider: row.provider,
        endpoint: row.endpoint,
        region: row.region,
        bucket: row.bucket,
        access_key_id: row.access_key_id,
        secret_access_key: row.secret_access_key,
        prefix: row.prefix,
    }
}

fn bucket_to_row(bucket: &Bucket) -> BucketRow {
    BucketRow {
        id: bucket.id.clone(),
        name: bucket.name.clone(),
        provider: bucket.provider.clone(),
        endpoint: bucket.endpoint.clone(),
        region: bucket.region.clone(),
        bucket: bucket.bucket.clone(),
        access_key_id: bucket.access_key_id.clone(),
        secret_access_key: bucket.secret_access_key.clone(),
        prefix: bucket.prefix.clone(),
        created_at: format_timestamp(Utc::now()),
    }
}

fn run_from_row(row: RunRow) -> Result<Run, StoreError> {
    let status = RunStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
        kind: "run",
        id: row.id.clone(),
        reason: format!("unknown status '{}'", row.status),
    })?;
    let started_at = parse_timestamp(&row.started_at, "run", &row.id)?;
    let completed_at = match row.completed_at.as_deref() {
        Some(s) => Some(parse_timestamp(s, "run", &row.id)?),
        None => None,
    };
    let pid = row.owner_pid.and_then(|pid| u32::try_from(pid).ok());
    let owner = match (pid, row.owner_instance) {
        (Some(pid), Some(instance)) => Some(RunOwner { pid, instance }),
        _ => None,
    };

    Ok(Run {
        id: row.id,
        job_id: row.job_id,
        bucket_id: row.bucket_id,
        status,
        started_at,
        completed_at,
        files_transferred: to_count(row.files_transferred),
        files_skipped: to_count(row.files_skipped),
        total_bytes: to_count(row.total_bytes),
        backup_path: row.backup_path,
        error: row.error,
        dry_run: row.dry_run,
        manual: row.manual,
        owner,
    })
}

fn run_to_row(run: &Run) -> RunRow {
    RunRow {
        id: run.id.clone(),
        job_id: run.job_id.clone(),
        bucket_id: run.bucket_id.clone(),
        status: run.status.as_str().to_string(),
        started_at: format_timestamp(run.started_at),
        completed_at: run.completed_at.map(format_timestamp),
        files_transferred: from_count(run.files_transferred),
        files_skipped: from_count(run.files_skipped),
        total_bytes: from_count(run.total_bytes),
        backup_path: run.backup_path.clone(),
        error: run.error.clone(),
        dry_run: run.dry_run,
        manual: run.manual,
        owner_pid: run.owner.as_ref().map(|o| i64::from(o.pid)),
        owner_instance: run.owner.as_ref().map(|o| o.instance.clone()),
    }
}

// ─── SqliteStore ────────────────────────────────────────────────────────────

/// Persistent store backed by rusqlite.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

impl BackupStore for SqliteStore {
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        job_repo::list(&self.db)?
            .into_iter()
            .map(job_from_row)
            .collect()
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_id(&self.db, id)?
            .map(job_from_row)
            .transpose()
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        job.validate()?;
        job_repo::upsert(&self.db, &job_to_row(job)?)?;
        Ok(())
    }

    fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(job_repo::delete(&self.db, id)?)
    }

    fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        Ok(bucket_repo::list(&self.db)?
            .into_iter()
            .map(bucket_from_row)
            .collect())
    }

    fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(bucket_repo::find_by_id(&self.db, id)?.map(bucket_from_row))
    }

    fn save_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        bucket_repo::upsert(&self.db, &bucket_to_row(bucket))?;
        Ok(())
    }

    fn delete_bucket(&self, id: &str) -> Result<bool, StoreError> {
        Ok(bucket_repo::delete(&self.db, id)?)
    }

    fn list_runs(&self, job_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Run>, StoreError> {
        run_repo::list(&self.db, job_id, limit.map(|l| l as u64))?
            .into_iter()
            .map(run_from_row)
            .collect()
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        run_repo::find_by_id(&self.db, id)?
            .map(run_from_row)
            .transpose()
    }

    fn append_run(&self, run: &Run) -> Result<(), StoreError> {
        run_repo::insert(&self.db, &run_to_row(run))?;
        Ok(())
    }

    fn append_run_exclusive(&self, run: &Run) -> Result<bool, StoreError> {
        Ok(run_repo::insert_exclusive(&self.db, &run_to_row(run))?)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> Result<Run, StoreError> {
        let mut run = self.get_run(id)?.ok_or_else(|| StoreError::NotFound {
            kind: "run",
            id: id.to_string(),
        })?;
        run.apply(update);
        run_repo::update(&self.db, &run_to_row(&run))?;
        Ok(run)
    }

    fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        Ok(run_repo::delete(&self.db, id)?)
    }
}
