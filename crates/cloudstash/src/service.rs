//! The backup engine as one object.
//!
//! [`BackupService`] wires store, event bus, supervisor, coordinator,
//! scheduler and retention together and exposes the control surface used by
//! hosts such as the daemon.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::{EventBus, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::coordinator::{RunCoordinator, StartAccepted, StartRequest};
use crate::error::{AdmissionError, RemoteError, Result, StoreError};
use crate::ledger::RunLedger;
use crate::model::{Bucket, Job, Run};
use crate::retention::RetentionManager;
use crate::scheduler::{ScheduleEntry, ScheduleZone, Scheduler};
use crate::store::BackupStore;
use crate::transfer::{ArtifactStore, RemoteClient, RemoteEntry, TransferSupervisor};

/// Answer to "is a backup running, and which".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub is_running: bool,
    pub active_job_id: Option<String>,
    pub active_run_id: Option<String>,
    /// Whether the timing loop is active.
    pub scheduler_active: bool,
    pub scheduled_jobs: usize,
}

pub struct BackupService {
    store: Arc<dyn BackupStore>,
    bus: EventBus,
    ledger: RunLedger,
    artifacts: Arc<dyn ArtifactStore>,
    retention: Arc<RetentionManager>,
    coordinator: RunCoordinator,
    scheduler: Scheduler,
    clock: Arc<dyn Clock>,
}

impl BackupService {
    /// Service using the transfer tool for artifacts, the system clock and
    /// the local time zone.
    pub fn new(store: Arc<dyn BackupStore>, config: &Config) -> Self {
        let artifacts = Arc::new(RemoteClient::new(config.transfer.clone()));
        Self::with_parts(
            store,
            config,
            artifacts,
            Arc::new(SystemClock),
            ScheduleZone::Local,
        )
    }

    pub fn with_parts(
        store: Arc<dyn BackupStore>,
        config: &Config,
        artifacts: Arc<dyn ArtifactStore>,
        clock: Arc<dyn Clock>,
        zone: ScheduleZone,
    ) -> Self {
        let bus = EventBus::new(config.events.capacity);
        let ledger = RunLedger::new(Arc::clone(&store));
        let supervisor = Arc::new(TransferSupervisor::new(Duration::from_secs(
            config.transfer.stop_grace_secs,
        )));
        let retention = Arc::new(RetentionManager::new(
            Arc::clone(&store),
            ledger.clone(),
            Arc::clone(&artifacts),
        ));
        let coordinator = RunCoordinator::new(
            Arc::clone(&store),
            ledger.clone(),
            supervisor,
            Arc::clone(&retention),
            bus.clone(),
            config.transfer.clone(),
            Arc::clone(&clock),
        );
        let scheduler = Scheduler::new(Arc::clone(&clock), zone);

        Self {
            store,
            bus,
            ledger,
            artifacts,
            retention,
            coordinator,
            scheduler,
            clock,
        }
    }

    /// Recovers runs interrupted by a previous process, then arms and starts
    /// the scheduler. Returns the recovered runs.
    pub fn start(&self) -> Result<Vec<Run>> {
        let recovered = self.recover_interrupted()?;

        let scheduled = self.load_schedules()?;
        self.scheduler
            .start(Arc::new(self.coordinator.clone()), &self.bus);
        log::info!("Backup service started, {} job(s) scheduled", scheduled);

        Ok(recovered)
    }

    /// Fails `running` runs whose supervising process has exited. Runs of
    /// this process and of other live processes are kept.
    pub fn recover_interrupted(&self) -> Result<Vec<Run>> {
        let recovered = self.ledger.recover_interrupted(self.clock.now())?;
        if !recovered.is_empty() {
            log::warn!("Recovered {} interrupted run(s)", recovered.len());
        }
        Ok(recovered)
    }

    /// Arms the scheduler from the stored jobs without starting its loop.
    /// Returns how many jobs have a next trigger.
    pub fn load_schedules(&self) -> Result<usize> {
        let jobs = self.store.list_jobs()?;
        self.scheduler.rearm_all(&jobs);
        Ok(self.scheduler.all_scheduled().len())
    }

    /// Stops the scheduler loop and any active transfer.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        if self.coordinator.stop() {
            log::info!("Stopping active backup for shutdown");
        }
    }

    pub fn start_backup(&self, request: StartRequest) -> std::result::Result<StartAccepted, AdmissionError> {
        self.coordinator.start(request, true)
    }

    /// Stops the active backup. Returns `false` if none was running.
    pub fn stop_backup(&self) -> bool {
        self.coordinator.stop()
    }

    /// Manually runs a stored job. Returns the run id.
    pub fn trigger_backup(&self, job_id: &str) -> std::result::Result<String, AdmissionError> {
        self.coordinator.trigger(job_id, true)
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        let active = self.coordinator.status();
        SchedulerStatus {
            is_running: active.is_running,
            active_job_id: active.active_job_id,
            active_run_id: active.active_run_id,
            scheduler_active: self.scheduler.is_running(),
            scheduled_jobs: self.scheduler.all_scheduled().len(),
        }
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.scheduler.next_run(job_id)
    }

    pub fn all_scheduled(&self) -> Vec<ScheduleEntry> {
        self.scheduler.all_scheduled()
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        Ok(self.store.list_jobs()?)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        Ok(self.store.get_job(id)?)
    }

    /// Persists `job` and re-arms its schedule. Returns the next trigger.
    pub fn save_job(&self, job: &Job) -> Result<Option<DateTime<Utc>>> {
        let mut job = job.clone();
        job.updated_at = self.clock.now();
        self.store.save_job(&job)?;
        Ok(self.scheduler.arm(&job))
    }

    /// Deletes a job and cancels its schedule. Its runs are kept.
    pub fn delete_job(&self, id: &str) -> Result<bool> {
        self.scheduler.disarm(id);
        Ok(self.store.delete_job(id)?)
    }

    pub fn list_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self.store.list_buckets()?)
    }

    pub fn save_bucket(&self, bucket: &Bucket) -> Result<()> {
        Ok(self.store.save_bucket(bucket)?)
    }

    pub fn delete_bucket(&self, id: &str) -> Result<bool> {
        Ok(self.store.delete_bucket(id)?)
    }

    /// Lists one folder of a bucket.
    pub async fn list_remote(&self, path: &str, bucket_id: &str) -> Result<Vec<RemoteEntry>> {
        let bucket = self
            .store
            .get_bucket(bucket_id)
            .map_err(RemoteError::from)?
            .ok_or_else(|| RemoteError::BucketNotFound(bucket_id.to_string()))?;
        Ok(self.artifacts.list(&bucket, path).await?)
    }

    pub fn list_runs(&self, job_id: Option<&str>, limit: Option<usize>) -> Result<Vec<Run>> {
        Ok(self.ledger.list(job_id, limit)?)
    }

    /// Deletes a finished run and optionally what it wrote to the bucket.
    ///
    /// Artifact deletion failures are logged; the record is removed anyway.
    pub async fn delete_run(&self, id: &str, delete_artifacts: bool) -> Result<bool> {
        let Some(run) = self.ledger.get(id)? else {
            return Ok(false);
        };
        if run.is_running() {
            return Err(StoreError::RunActive(id.to_string()).into());
        }

        let deleted = self.ledger.delete(id)?;
        if deleted && delete_artifacts && !self.retention.delete_artifacts(&run).await {
            log::warn!("Run {} deleted, but its artifacts may remain", id);
        }
        Ok(deleted)
    }

    pub fn subscribe(&self, observer: &str) -> Subscription {
        self.bus.subscribe(observer)
    }

    pub fn unsubscribe_all(&self, observer: &str) -> bool {
        self.bus.unsubscribe_all(observer)
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }
}
