//! Keyed storage of jobs, buckets and runs.
//!
//! The engine only talks to [`BackupStore`]; [`SqliteStore`] is the
//! persistent implementation and [`MemoryStore`] backs tests and
//! throw-away sessions.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::StoreError;
use crate::model::{Bucket, Job, Run, RunUpdate};

/// Storage operations consumed by the backup engine.
///
/// Implementations must be cheap to call from async code; every
/// operation is expected to complete in well under a millisecond.
pub trait BackupStore: Send + Sync {
    fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;
    fn get_job(&self, id: &str) -> Result<Option<Job>, StoreError>;
    /// Validates and inserts or replaces a job.
    fn save_job(&self, job: &Job) -> Result<(), StoreError>;
    /// Returns `true` if the job existed.
    fn delete_job(&self, id: &str) -> Result<bool, StoreError>;

    fn list_buckets(&self) -> Result<Vec<Bucket>, StoreError>;
    fn get_bucket(&self, id: &str) -> Result<Option<Bucket>, StoreError>;
    fn save_bucket(&self, bucket: &Bucket) -> Result<(), StoreError>;
    fn delete_bucket(&self, id: &str) -> Result<bool, StoreError>;

    /// Lists runs ordered by start time, newest first.
    fn list_runs(&self, job_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Run>, StoreError>;
    fn get_run(&self, id: &str) -> Result<Option<Run>, StoreError>;
    fn append_run(&self, run: &Run) -> Result<(), StoreError>;
    /// Appends `run` only if no stored run is `running`, atomically with
    /// respect to every writer of the same store. Returns `false` when
    /// refused.
    fn append_run_exclusive(&self, run: &Run) -> Result<bool, StoreError>;
    /// Applies a partial update and returns the updated record.
    fn update_run(&self, id: &str, update: &RunUpdate) -> Result<Run, StoreError>;
    /// Removes the run record only. Remote artifacts are handled by the caller.
    fn delete_run(&self, id: &str) -> Result<bool, StoreError>;
}
