//! Builders for seeding stores with test data.

#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};

use cloudstash::{Bucket, Run, RunStatus};

/// A bucket with throwaway credentials.
pub fn test_bucket() -> Bucket {
    let mut bucket = Bucket::new("Test bucket", "test-bucket", "AKIDTEST", "s3cr3t");
    bucket.endpoint = Some("http://127.0.0.1:9000".to_string());
    bucket
}

/// Fixed reference instant used for seeded history.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap()
}

/// Builder for run records written straight to a store.
pub struct RunBuilder {
    run: Run,
}

impl RunBuilder {
    /// A completed run of `job_id` that started `days_ago` days before
    /// [`base_time`].
    pub fn completed(job_id: &str, bucket_id: &str, days_ago: i64) -> Self {
        let started_at = base_time() - Duration::days(days_ago);
        let mut run = Run::start(Some(job_id), Some(bucket_id), started_at);
        run.status = RunStatus::Completed;
        run.completed_at = Some(started_at + Duration::minutes(5));
        run.files_transferred = 3;
        run.total_bytes = 1024;
        run.backup_path = Some(format!(
            "docs/{}",
            started_at.format("%Y-%m-%d_%H-%M-%S")
        ));
        Self { run }
    }

    /// A run left in `Running` state, as after a crash.
    pub fn running(job_id: &str, bucket_id: &str) -> Self {
        Self {
            run: Run::start(Some(job_id), Some(bucket_id), base_time()),
        }
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.run.status = status;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.run.dry_run = true;
        self
    }

    pub fn backup_path(mut self, path: &str) -> Self {
        self.run.backup_path = Some(path.to_string());
        self
    }

    pub fn build(self) -> Run {
        self.run
    }
}
