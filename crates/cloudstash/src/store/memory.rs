//! In-memory store.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::BackupStore;
use crate::error::StoreError;
use crate::model::{Bucket, Job, Run, RunUpdate};

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    buckets: HashMap<String, Bucket>,
    runs: HashMap<String, Run>,
}

/// Store that keeps every record in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        match self.tables.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Memory store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        match self.tables.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Memory store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }
}

impl BackupStore for MemoryStore {
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.read().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        Ok(jobs)
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.read().jobs.get(id).cloned())
    }

    fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        job.validate()?;
        self.write().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write().jobs.remove(id).is_some())
    }

    fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError> {
        let mut buckets: Vec<Bucket> = self.read().buckets.values().cloned().collect();
        buckets.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(buckets)
    }

    fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, StoreError> {
        Ok(self.read().buckets.get(id).cloned())
    }

    fn save_bucket(&self, bucket: &Bucket) -> Result<(), StoreError> {
        self.write()
            .buckets
            .insert(bucket.id.clone(), bucket.clone());
        Ok(())
    }

    fn delete_bucket(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write().buckets.remove(id).is_some())
    }

    fn list_runs(&self, job_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Run>, StoreError> {
        let mut runs: Vec<Run> = self
            .read()
            .runs
            .values()
            .filter(|r| job_id.is_none() || r.job_id.as_deref() == job_id)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError> {
        Ok(self.read().runs.get(id).cloned())
    }

    fn append_run(&self, run: &Run) -> Result<(), StoreError> {
        self.write().runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    fn append_run_exclusive(&self, run: &Run) -> Result<bool, StoreError> {
        let mut tables = self.write();
        if tables.runs.values().any(Run::is_running) {
            return Ok(false);
        }
        tables.runs.insert(run.id.clone(), run.clone());
        Ok(true)
    }

    fn update_run(&self, id: &str, update: &RunUpdate) -> Result<Run, StoreError> {
        let mut tables = self.write();
        let run = tables.runs.get_mut(id).ok_or_else(|| StoreError::NotFound {
            kind: "run",
            id: id.to_string(),
        })?;
        run.apply(update);
        Ok(run.clone())
    }

    fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.write().runs.remove(id).is_some())
    }
}
