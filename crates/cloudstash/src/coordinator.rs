//! Admission and lifecycle of backup runs.
//!
//! [`RunCoordinator`] owns the process's active-run slot. A trigger claims
//! the slot (test-and-set under one lock), records a `running` run only if
//! the store holds no other live run, starts the transfer and hands the
//! process to a monitor task. The monitor finalizes the run, frees the
//! slot, prunes old runs and reports the outcome on the event bus.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::Instrument;

use crate::broadcast::{BackupEvent, EventBus, SkipReason};
use crate::clock::Clock;
use crate::config::TransferConfig;
use crate::error::{AdmissionError, SupervisorError};
use crate::ledger::{RunCounts, RunLedger};
use crate::model::{Bucket, Job, Run};
use crate::process;
use crate::retention::RetentionManager;
use crate::scheduler::JobTrigger;
use crate::store::BackupStore;
use crate::transfer::command::{build_copy, default_base, resolve_destination};
use crate::transfer::{TransferEvent, TransferHandle, TransferLine, TransferOutcome, TransferSupervisor};

/// Job-level error reported for a stopped run.
const STOPPED_MESSAGE: &str = "Backup was stopped";

/// A request to start a backup.
///
/// Fields left empty are taken from the job, if one is given.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartRequest {
    pub job_id: Option<String>,
    pub source_path: Option<PathBuf>,
    /// Folder inside the bucket, before the per-run folder is appended.
    pub destination: Option<String>,
    pub bucket_id: Option<String>,
    pub dry_run: bool,
}

impl StartRequest {
    pub fn for_job(job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAccepted {
    pub run_id: String,
    /// Path inside the bucket the run writes to.
    pub resolved_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorStatus {
    pub is_running: bool,
    pub active_job_id: Option<String>,
    pub active_run_id: Option<String>,
}

#[derive(Debug, Clone)]
struct ActiveRun {
    job_id: Option<String>,
    run_id: Option<String>,
}

type ActiveSlot = Arc<Mutex<Option<ActiveRun>>>;

fn lock_slot(slot: &ActiveSlot) -> MutexGuard<'_, Option<ActiveRun>> {
    slot.lock().unwrap_or_else(|poisoned| {
        log::warn!("Active run lock was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Claim on the active-run slot, released on drop.
struct SlotGuard {
    slot: ActiveSlot,
}

impl SlotGuard {
    /// Claims the slot, or returns the job id of the run holding it.
    fn claim(slot: &ActiveSlot, job_id: Option<&str>) -> Result<Self, Option<String>> {
        let mut active = lock_slot(slot);
        if let Some(current) = active.as_ref() {
            return Err(current.job_id.clone());
        }
        *active = Some(ActiveRun {
            job_id: job_id.map(str::to_string),
            run_id: None,
        });
        Ok(Self {
            slot: Arc::clone(slot),
        })
    }

    fn set_run_id(&self, run_id: &str) {
        if let Some(active) = lock_slot(&self.slot).as_mut() {
            active.run_id = Some(run_id.to_string());
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        lock_slot(&self.slot).take();
    }
}

struct RunPlan {
    job: Option<Job>,
    source: PathBuf,
    bucket: Bucket,
    base: String,
}

/// What the monitor learned while the process ran.
#[derive(Debug, Default)]
struct RunState {
    counts: RunCounts,
    backup_path: String,
}

#[derive(Clone)]
pub struct RunCoordinator {
    store: Arc<dyn BackupStore>,
    ledger: RunLedger,
    supervisor: Arc<TransferSupervisor>,
    retention: Arc<RetentionManager>,
    bus: EventBus,
    config: TransferConfig,
    clock: Arc<dyn Clock>,
    active: ActiveSlot,
}

impl RunCoordinator {
    pub fn new(
        store: Arc<dyn BackupStore>,
        ledger: RunLedger,
        supervisor: Arc<TransferSupervisor>,
        retention: Arc<RetentionManager>,
        bus: EventBus,
        config: TransferConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            ledger,
            supervisor,
            retention,
            bus,
            config,
            clock,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts a run of a stored job. Returns the run id.
    pub fn trigger(&self, job_id: &str, manual: bool) -> Result<String, AdmissionError> {
        self.start(StartRequest::for_job(job_id), manual)
            .map(|accepted| accepted.run_id)
    }

    /// Admits and starts a backup.
    ///
    /// Fails with [`AdmissionError::Busy`] while any run is active, here or
    /// in another process sharing the store; a `BackupSkipped` event is
    /// published in that case and nothing else changes.
    pub fn start(
        &self,
        request: StartRequest,
        manual: bool,
    ) -> Result<StartAccepted, AdmissionError> {
        let guard = match SlotGuard::claim(&self.active, request.job_id.as_deref()) {
            Ok(guard) => guard,
            Err(active_job_id) => return Err(self.skip_busy(&request, active_job_id)),
        };

        let plan = self.plan(&request)?;

        let started_at = self.clock.now();
        let mut run = Run::start(request.job_id.as_deref(), Some(&plan.bucket.id), started_at);
        let resolved_path = resolve_destination(&plan.bucket, &plan.base, started_at, &run.id);
        run.dry_run = request.dry_run;
        run.manual = manual;
        run.backup_path = Some(resolved_path.clone());
        run.owner = Some(process::current_owner());
        guard.set_run_id(&run.id);
        if !self.ledger.admit(&run)? {
            // Another process sharing the store has a live run.
            drop(guard);
            let active_job_id = self
                .ledger
                .running()?
                .into_iter()
                .next()
                .and_then(|other| other.job_id);
            return Err(self.skip_busy(&request, active_job_id));
        }

        let job_name = plan.job.as_ref().map(|j| j.name.clone());
        log::info!(
            "Starting {}backup run {} of {} to {}:{}",
            if request.dry_run { "dry-run " } else { "" },
            run.id,
            plan.source.display(),
            plan.bucket.bucket,
            resolved_path
        );

        self.bus.publish(BackupEvent::Started {
            run_id: run.id.clone(),
            job_id: run.job_id.clone(),
            job_name: job_name.clone(),
            source_path: plan.source.display().to_string(),
            destination: resolved_path.clone(),
            dry_run: run.dry_run,
        });
        self.bus.publish(BackupEvent::BackupStarted {
            run_id: run.id.clone(),
            job_id: run.job_id.clone(),
            manual,
        });
        self.bus.publish(BackupEvent::UsingPath {
            run_id: run.id.clone(),
            path: resolved_path.clone(),
        });

        let invocation = build_copy(
            &self.config,
            &plan.bucket,
            &plan.source,
            &resolved_path,
            request.dry_run,
        );

        let mut state = RunState {
            backup_path: resolved_path.clone(),
            ..Default::default()
        };

        let handle = match self.supervisor.start(&invocation, &run.id) {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("Backup run {} could not start: {}", run.id, e);
                let message = e.to_string();
                let outcome = TransferOutcome::Failed(message.clone());
                self.record_end(&run, &state, &outcome);
                drop(guard);
                self.publish_terminal(&run, &state, &outcome);
                self.publish_job_outcome(&run, &state, &outcome);

                return Err(match e {
                    SupervisorError::Busy => AdmissionError::Busy {
                        active_job_id: None,
                    },
                    SupervisorError::Spawn { .. } => AdmissionError::Spawn {
                        run_id: run.id,
                        message,
                    },
                });
            }
        };

        let span = tracing::info_span!(
            "backup_run",
            run_id = %run.id,
            job = job_name.as_deref().unwrap_or("-"),
        );
        let accepted = StartAccepted {
            run_id: run.id.clone(),
            resolved_path,
        };

        let coordinator = self.clone();
        tokio::spawn(
            async move {
                let outcome = coordinator.watch(&run, handle, &mut state).await;
                coordinator.finish(run, state, outcome, guard).await;
            }
            .instrument(span),
        );

        Ok(accepted)
    }

    fn skip_busy(&self, request: &StartRequest, active_job_id: Option<String>) -> AdmissionError {
        log::info!(
            "Backup of {} skipped, another backup is running",
            request.job_id.as_deref().unwrap_or("ad-hoc source")
        );
        self.bus.publish(BackupEvent::BackupSkipped {
            job_id: request.job_id.clone(),
            reason: SkipReason::Busy,
        });
        AdmissionError::Busy { active_job_id }
    }

    /// Requests the active transfer to stop. No-op when nothing runs.
    pub fn stop(&self) -> bool {
        self.supervisor.stop()
    }

    pub fn status(&self) -> CoordinatorStatus {
        match lock_slot(&self.active).as_ref() {
            Some(active) => CoordinatorStatus {
                is_running: true,
                active_job_id: active.job_id.clone(),
                active_run_id: active.run_id.clone(),
            },
            None => CoordinatorStatus::default(),
        }
    }

    pub fn is_busy(&self) -> bool {
        lock_slot(&self.active).is_some()
    }

    fn plan(&self, request: &StartRequest) -> Result<RunPlan, AdmissionError> {
        let job = match request.job_id.as_deref() {
            Some(id) => Some(
                self.store
                    .get_job(id)?
                    .ok_or_else(|| AdmissionError::JobNotFound(id.to_string()))?,
            ),
            None => None,
        };

        let source = request
            .source_path
            .clone()
            .or_else(|| job.as_ref().map(|j| j.source_path.clone()))
            .ok_or(AdmissionError::MissingSource)?;

        let bucket = self.resolve_bucket(
            request
                .bucket_id
                .as_deref()
                .or(job.as_ref().map(|j| j.bucket_id.as_str())),
        )?;

        let base = request
            .destination
            .as_deref()
            .or(job.as_ref().and_then(|j| j.destination.as_deref()))
            .map(|d| d.trim_matches('/').to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| default_base(job.as_ref().map(|j| j.name.as_str()), &source));

        Ok(RunPlan {
            job,
            source,
            bucket,
            base,
        })
    }

    /// Looks up `id`, or falls back to the only configured bucket.
    fn resolve_bucket(&self, id: Option<&str>) -> Result<Bucket, AdmissionError> {
        match id {
            Some(id) => self
                .store
                .get_bucket(id)?
                .ok_or_else(|| AdmissionError::BucketNotFound(id.to_string())),
            None => {
                let mut buckets = self.store.list_buckets()?;
                if buckets.len() == 1 {
                    Ok(buckets.remove(0))
                } else {
                    Err(AdmissionError::BucketNotFound(
                        "no bucket selected".to_string(),
                    ))
                }
            }
        }
    }

    /// Relays process output until it exits.
    async fn watch(
        &self,
        run: &Run,
        mut handle: TransferHandle,
        state: &mut RunState,
    ) -> TransferOutcome {
        loop {
            match handle.next_event().await {
                Some(TransferEvent::Line(line)) => self.on_line(&run.id, state, line),
                Some(TransferEvent::Exited(outcome)) => return outcome,
                None => {
                    return TransferOutcome::Failed(
                        "Lost track of the transfer process".to_string(),
                    )
                }
            }
        }
    }

    fn on_line(&self, run_id: &str, state: &mut RunState, line: TransferLine) {
        let run_id = run_id.to_string();
        let event = match line {
            TransferLine::Progress(progress) => {
                state.counts.total_bytes = state.counts.total_bytes.max(progress.bytes_transferred);
                BackupEvent::Progress { run_id, progress }
            }
            TransferLine::FileTransferred(file) => {
                state.counts.files_transferred += 1;
                BackupEvent::FileTransferred { run_id, file }
            }
            TransferLine::FileSkipped(file) => {
                state.counts.files_skipped += 1;
                BackupEvent::FileSkipped { run_id, file }
            }
            TransferLine::UsingPath(path) => {
                state.backup_path = path.clone();
                BackupEvent::UsingPath { run_id, path }
            }
            TransferLine::NothingToTransfer => BackupEvent::NothingToTransfer { run_id },
            TransferLine::Log(line) => {
                log::debug!("transfer: {}", line);
                BackupEvent::Log { run_id, line }
            }
            TransferLine::Error(message) => {
                log::warn!("transfer: {}", message);
                BackupEvent::Error {
                    run_id,
                    message,
                    fatal: false,
                }
            }
        };
        self.bus.publish(event);
    }

    async fn finish(&self, run: Run, state: RunState, outcome: TransferOutcome, guard: SlotGuard) {
        self.record_end(&run, &state, &outcome);
        drop(guard);
        self.publish_terminal(&run, &state, &outcome);

        if outcome == TransferOutcome::Completed && !run.dry_run {
            if let Some(job_id) = run.job_id.as_deref() {
                match self.retention.enforce(job_id).await {
                    Ok(report) if !report.pruned.is_empty() => log::info!(
                        "Retention pruned {} run(s), kept {}",
                        report.pruned.len(),
                        report.kept
                    ),
                    Ok(_) => {}
                    Err(e) => log::warn!("Retention for job {} failed: {}", job_id, e),
                }
            }
        }

        self.publish_job_outcome(&run, &state, &outcome);
    }

    fn record_end(&self, run: &Run, state: &RunState, outcome: &TransferOutcome) {
        let now = self.clock.now();
        let path = Some(state.backup_path.clone()).filter(|p| !p.is_empty());
        let result = match outcome {
            TransferOutcome::Completed => {
                self.ledger
                    .finish_completed(&run.id, now, state.counts, path)
            }
            TransferOutcome::Stopped => self.ledger.finish_stopped(&run.id, now, state.counts, path),
            TransferOutcome::Failed(message) => {
                self.ledger
                    .finish_failed(&run.id, now, state.counts, path, message)
            }
        };

        match result {
            Ok(_) => log::info!(
                "Backup run {} finished: {:?} ({} transferred, {} skipped, {} bytes)",
                run.id,
                outcome,
                state.counts.files_transferred,
                state.counts.files_skipped,
                state.counts.total_bytes
            ),
            Err(e) => log::error!("Failed to record end of run {}: {}", run.id, e),
        }
    }

    fn publish_terminal(&self, run: &Run, state: &RunState, outcome: &TransferOutcome) {
        let run_id = run.id.clone();
        self.bus.publish(match outcome {
            TransferOutcome::Completed => BackupEvent::Complete {
                run_id,
                files_transferred: state.counts.files_transferred,
                files_skipped: state.counts.files_skipped,
                total_bytes: state.counts.total_bytes,
            },
            TransferOutcome::Stopped => BackupEvent::Stopped { run_id },
            TransferOutcome::Failed(message) => BackupEvent::Error {
                run_id,
                message: message.clone(),
                fatal: true,
            },
        });
    }

    fn publish_job_outcome(&self, run: &Run, state: &RunState, outcome: &TransferOutcome) {
        let run_id = run.id.clone();
        let job_id = run.job_id.clone();
        self.bus.publish(match outcome {
            TransferOutcome::Completed => BackupEvent::BackupCompleted {
                run_id,
                job_id,
                files_transferred: state.counts.files_transferred,
                total_size: state.counts.total_bytes,
            },
            TransferOutcome::Stopped => BackupEvent::BackupError {
                run_id,
                job_id,
                error: STOPPED_MESSAGE.to_string(),
            },
            TransferOutcome::Failed(message) => BackupEvent::BackupError {
                run_id,
                job_id,
                error: message.clone(),
            },
        });
    }
}

impl JobTrigger for RunCoordinator {
    fn trigger_scheduled(&self, job_id: &str) -> Result<String, AdmissionError> {
        self.trigger(job_id, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Subscription;
    use crate::clock::SystemClock;
    use crate::model::RunStatus;
    use crate::store::MemoryStore;
    use crate::transfer::RemoteClient;
    use chrono::Utc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        coordinator: RunCoordinator,
        events: Subscription,
        bucket: Bucket,
    }

    fn fixture(binary: &str) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let bucket = Bucket::new("main", "my-bucket", "key", "secret");
        store.save_bucket(&bucket).unwrap();

        let config = TransferConfig {
            binary: PathBuf::from(binary),
            ..Default::default()
        };
        let bus = EventBus::new(64);
        let events = bus.subscribe("test");
        let ledger = RunLedger::new(store.clone());
        let retention = Arc::new(RetentionManager::new(
            store.clone(),
            ledger.clone(),
            Arc::new(RemoteClient::new(config.clone())),
        ));
        let coordinator = RunCoordinator::new(
            store.clone(),
            ledger,
            Arc::new(TransferSupervisor::new(Duration::from_secs(1))),
            retention,
            bus,
            config,
            Arc::new(SystemClock),
        );

        Fixture {
            store,
            coordinator,
            events,
            bucket,
        }
    }

    fn drain(events: &mut Subscription) -> Vec<BackupEvent> {
        std::iter::from_fn(|| events.try_recv()).collect()
    }

    #[tokio::test]
    async fn test_unknown_job_is_rejected_without_side_effects() {
        let mut fx = fixture("/nonexistent/transfer");

        let result = fx.coordinator.trigger("missing", true);

        assert!(matches!(result, Err(AdmissionError::JobNotFound(_))));
        assert!(!fx.coordinator.is_busy());
        assert!(fx.store.list_runs(None, None).unwrap().is_empty());
        assert!(drain(&mut fx.events).is_empty());
    }

    #[tokio::test]
    async fn test_missing_source_and_bucket() {
        let fx = fixture("/nonexistent/transfer");

        let result = fx.coordinator.start(StartRequest::default(), true);
        assert!(matches!(result, Err(AdmissionError::MissingSource)));

        let request = StartRequest {
            source_path: Some(PathBuf::from("/data")),
            bucket_id: Some("nope".to_string()),
            ..Default::default()
        };
        let result = fx.coordinator.start(request, true);
        assert!(matches!(result, Err(AdmissionError::BucketNotFound(_))));
        assert!(!fx.coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_busy_slot_rejects_and_publishes_skip() {
        let mut fx = fixture("/nonexistent/transfer");
        let _held = SlotGuard::claim(&fx.coordinator.active, Some("job-a")).unwrap();

        let result = fx.coordinator.trigger("job-b", false);

        match result {
            Err(AdmissionError::Busy { active_job_id }) => {
                assert_eq!(active_job_id.as_deref(), Some("job-a"))
            }
            other => panic!("expected busy, got {:?}", other),
        }
        assert_eq!(
            drain(&mut fx.events),
            vec![BackupEvent::BackupSkipped {
                job_id: Some("job-b".to_string()),
                reason: SkipReason::Busy,
            }]
        );
        assert_eq!(fx.coordinator.status().active_job_id.as_deref(), Some("job-a"));
    }

    #[tokio::test]
    async fn test_live_run_in_store_rejects_and_frees_slot() {
        let mut fx = fixture("/nonexistent/transfer");
        let job = Job::new("Docs", "/data/docs", &fx.bucket.id);
        fx.store.save_job(&job).unwrap();
        let elsewhere = Run::start(Some("job-a"), Some(&fx.bucket.id), Utc::now());
        fx.store.append_run(&elsewhere).unwrap();

        let result = fx.coordinator.trigger(&job.id, false);

        match result {
            Err(AdmissionError::Busy { active_job_id }) => {
                assert_eq!(active_job_id.as_deref(), Some("job-a"))
            }
            other => panic!("expected busy, got {:?}", other),
        }
        assert!(!fx.coordinator.is_busy());
        assert_eq!(fx.store.list_runs(None, None).unwrap(), vec![elsewhere]);
        assert_eq!(
            drain(&mut fx.events),
            vec![BackupEvent::BackupSkipped {
                job_id: Some(job.id.clone()),
                reason: SkipReason::Busy,
            }]
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_records_failed_run() {
        let mut fx = fixture("/nonexistent/transfer");
        let job = Job::new("Docs", "/data/docs", &fx.bucket.id);
        fx.store.save_job(&job).unwrap();

        let result = fx.coordinator.trigger(&job.id, true);

        let run_id = match result {
            Err(AdmissionError::Spawn { run_id, .. }) => run_id,
            other => panic!("expected spawn error, got {:?}", other),
        };
        assert!(!fx.coordinator.is_busy());

        let run = fx.store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.manual);
        assert!(run.error.unwrap().contains("/nonexistent/transfer"));
        assert!(run.backup_path.unwrap().starts_with("Docs/"));

        let events = drain(&mut fx.events);
        assert!(matches!(events.first(), Some(BackupEvent::Started { .. })));
        assert!(events.iter().any(|e| matches!(e, BackupEvent::Error { fatal: true, .. })));
        assert!(matches!(events.last(), Some(BackupEvent::BackupError { .. })));
    }

    #[tokio::test]
    async fn test_single_bucket_fallback_for_ad_hoc_backup() {
        let fx = fixture("/nonexistent/transfer");
        let request = StartRequest {
            source_path: Some(PathBuf::from("/home/me/Pictures")),
            destination: Some("/photos/".to_string()),
            dry_run: true,
            ..Default::default()
        };

        let plan = fx.coordinator.plan(&request).unwrap();

        assert_eq!(plan.bucket.id, fx.bucket.id);
        assert_eq!(plan.base, "photos");
        assert!(plan.job.is_none());
    }

    #[tokio::test]
    async fn test_stop_without_active_run_is_noop() {
        let mut fx = fixture("/nonexistent/transfer");
        assert!(!fx.coordinator.stop());
        assert_eq!(fx.coordinator.status(), CoordinatorStatus::default());
        assert!(drain(&mut fx.events).is_empty());
    }
}
