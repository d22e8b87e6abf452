//! Recurring backup triggers.
//!
//! Each job with a recurrence policy is armed with its next trigger time. A
//! single loop sleeps until the earliest trigger, fires every due job and
//! re-arms it from the current time. Triggers that were missed or rejected
//! are not queued.

pub mod recurrence;

pub use recurrence::{next_trigger, ScheduleZone};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{BackupEvent, EventBus, Subscription};
use crate::clock::Clock;
use crate::error::AdmissionError;
use crate::model::{Job, Recurrence};

/// Upper bound on one sleep, so wall-clock jumps (suspend, NTP) are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// Receives scheduled triggers.
pub trait JobTrigger: Send + Sync {
    /// Starts a scheduled run of `job_id` and returns its run id.
    fn trigger_scheduled(&self, job_id: &str) -> Result<String, AdmissionError>;
}

/// Armed state of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub job_id: String,
    pub job_name: String,
    pub recurrence: Recurrence,
    pub next_trigger: DateTime<Utc>,
}

struct Inner {
    entries: Mutex<HashMap<String, ScheduleEntry>>,
    wake: Notify,
    clock: Arc<dyn Clock>,
    zone: ScheduleZone,
}

#[derive(Default)]
struct LoopState {
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    state: Mutex<LoopState>,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, zone: ScheduleZone) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                clock,
                zone,
            }),
            state: Mutex::new(LoopState::default()),
        }
    }

    /// Arms `job` if it has a recurrence policy, otherwise disarms it.
    /// Returns the next trigger time.
    pub fn arm(&self, job: &Job) -> Option<DateTime<Utc>> {
        let Some(recurrence) = job.schedule else {
            self.disarm(&job.id);
            return None;
        };

        let now = self.inner.clock.now();
        let Some(next) = self.inner.zone.next_trigger(&recurrence, now) else {
            log::warn!("Job '{}' has an invalid schedule, not arming it", job.name);
            self.disarm(&job.id);
            return None;
        };

        self.inner.lock_entries().insert(
            job.id.clone(),
            ScheduleEntry {
                job_id: job.id.clone(),
                job_name: job.name.clone(),
                recurrence,
                next_trigger: next,
            },
        );
        log::info!("Scheduled job '{}' for {}", job.name, next);
        self.inner.wake.notify_one();
        Some(next)
    }

    /// Returns `true` if the job was armed.
    pub fn disarm(&self, job_id: &str) -> bool {
        let removed = self.inner.lock_entries().remove(job_id).is_some();
        if removed {
            log::info!("Unscheduled job {}", job_id);
            self.inner.wake.notify_one();
        }
        removed
    }

    /// Replaces all armed jobs with `jobs`.
    pub fn rearm_all(&self, jobs: &[Job]) {
        self.inner.lock_entries().clear();
        for job in jobs {
            self.arm(job);
        }
        self.inner.wake.notify_one();
    }

    pub fn next_run(&self, job_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock_entries()
            .get(job_id)
            .map(|entry| entry.next_trigger)
    }

    /// Every armed job, soonest first.
    pub fn all_scheduled(&self) -> Vec<ScheduleEntry> {
        let mut entries: Vec<ScheduleEntry> =
            self.inner.lock_entries().values().cloned().collect();
        entries.sort_by(|a, b| {
            a.next_trigger
                .cmp(&b.next_trigger)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        entries
    }

    /// Starts the timing loop. Returns `false` if it was already running.
    ///
    /// `bus` is watched for finished runs, which re-arm their job.
    pub fn start(&self, trigger: Arc<dyn JobTrigger>, bus: &EventBus) -> bool {
        let mut state = self.lock_state();
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            return false;
        }

        let cancel = CancellationToken::new();
        let events = bus.subscribe("scheduler");
        state.task = Some(tokio::spawn(run_loop(
            Arc::clone(&self.inner),
            trigger,
            events,
            cancel.clone(),
        )));
        state.cancel = Some(cancel);
        log::info!("Scheduler started");
        true
    }

    /// Stops the timing loop and waits for it to exit. Armed jobs are kept.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut state = self.lock_state();
            (state.cancel.take(), state.task.take())
        };

        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Scheduler loop ended abnormally: {}", e);
            }
            log::info!("Scheduler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_state()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Fires every job whose trigger time has arrived. Returns the fired
    /// job ids.
    pub fn fire_due(&self, trigger: &dyn JobTrigger) -> Vec<String> {
        self.inner.fire_due(trigger)
    }

    fn lock_state(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            log::warn!("Scheduler state lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

impl Inner {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, ScheduleEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| {
            log::warn!("Scheduler entries lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn fire_due(&self, trigger: &dyn JobTrigger) -> Vec<String> {
        let now = self.clock.now();

        // Re-arm before firing so a slow or failing trigger cannot fire twice.
        let due: Vec<ScheduleEntry> = {
            let mut entries = self.lock_entries();
            let mut due = Vec::new();
            entries.retain(|_, entry| {
                if entry.next_trigger > now {
                    return true;
                }
                due.push(entry.clone());
                match self.zone.next_trigger(&entry.recurrence, now) {
                    Some(next) => {
                        entry.next_trigger = next;
                        true
                    }
                    None => false,
                }
            });
            due
        };

        let mut fired = Vec::with_capacity(due.len());
        for entry in due {
            log::info!("Triggering scheduled backup of '{}'", entry.job_name);
            match trigger.trigger_scheduled(&entry.job_id) {
                Ok(run_id) => log::debug!("Scheduled run {} started", run_id),
                Err(e) if e.is_busy() => {
                    log::info!(
                        "Skipped scheduled backup of '{}': another backup is running",
                        entry.job_name
                    );
                }
                Err(AdmissionError::JobNotFound(id)) => {
                    log::warn!("Scheduled job {} no longer exists, unscheduling", id);
                    self.lock_entries().remove(&id);
                }
                Err(e) => {
                    log::warn!("Scheduled backup of '{}' failed to start: {}", entry.job_name, e);
                }
            }
            fired.push(entry.job_id);
        }
        fired
    }

    /// Recomputes a job's trigger from now, if it is armed.
    fn refresh(&self, job_id: &str) {
        let now = self.clock.now();
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get_mut(job_id) {
            if let Some(next) = self.zone.next_trigger(&entry.recurrence, now) {
                entry.next_trigger = next;
            }
        }
    }

    fn time_until_next(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.lock_entries()
            .values()
            .map(|entry| entry.next_trigger)
            .min()
            .map(|next| (next - now).to_std().unwrap_or(Duration::ZERO))
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    trigger: Arc<dyn JobTrigger>,
    events: Subscription,
    cancel: CancellationToken,
) {
    let mut events = Some(events);

    loop {
        inner.fire_due(trigger.as_ref());

        let sleep_for = inner
            .time_until_next()
            .map_or(MAX_SLEEP, |d| d.min(MAX_SLEEP));

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
            event = next_event(&mut events) => match event {
                Some(event) if event.is_job_outcome() => {
                    if let Some(job_id) = event.job_id() {
                        inner.refresh(job_id);
                    }
                }
                Some(_) => {}
                None => {
                    log::debug!("Scheduler event subscription ended");
                    events = None;
                }
            },
        }
    }
}

async fn next_event(events: &mut Option<Subscription>) -> Option<BackupEvent> {
    match events {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use chrono::TimeZone;

    #[derive(Default)]
    struct RecordingTrigger {
        fired: Mutex<Vec<String>>,
        busy: bool,
    }

    impl RecordingTrigger {
        fn fired(&self) -> Vec<String> {
            self.fired.lock().unwrap().clone()
        }
    }

    impl JobTrigger for RecordingTrigger {
        fn trigger_scheduled(&self, job_id: &str) -> Result<String, AdmissionError> {
            self.fired.lock().unwrap().push(job_id.to_string());
            if self.busy {
                Err(AdmissionError::Busy {
                    active_job_id: None,
                })
            } else {
                Ok(format!("run-{}", job_id))
            }
        }
    }

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 1, 0, 0).unwrap()
    }

    fn daily_job(name: &str, hour: u32) -> Job {
        Job::new(name, "/data", "bucket-1").with_schedule(Recurrence::Daily { hour, minute: 0 })
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(
            Arc::new(TokioClock::starting_at(origin())),
            ScheduleZone::utc(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_and_query() {
        let scheduler = scheduler();
        let job = daily_job("docs", 2);

        let next = scheduler.arm(&job);

        assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap()));
        assert_eq!(scheduler.next_run(&job.id), next);
        let all = scheduler.all_scheduled();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].job_name, "docs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_arm_without_schedule_disarms() {
        let scheduler = scheduler();
        let mut job = daily_job("docs", 2);
        scheduler.arm(&job);

        job.schedule = None;
        assert_eq!(scheduler.arm(&job), None);
        assert_eq!(scheduler.next_run(&job.id), None);
        assert!(!scheduler.disarm(&job.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_scheduled_sorted_by_next_trigger() {
        let scheduler = scheduler();
        let late = daily_job("late", 5);
        let early = daily_job("early", 3);
        scheduler.rearm_all(&[late.clone(), early.clone()]);

        let names: Vec<String> = scheduler
            .all_scheduled()
            .into_iter()
            .map(|e| e.job_name)
            .collect();
        assert_eq!(names, vec!["early", "late"]);

        scheduler.rearm_all(&[late]);
        assert_eq!(scheduler.all_scheduled().len(), 1);
        assert_eq!(scheduler.next_run(&early.id), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_due_rearms_even_when_busy() {
        let scheduler = scheduler();
        let job = daily_job("docs", 2);
        scheduler.arm(&job);
        let trigger = RecordingTrigger {
            busy: true,
            ..Default::default()
        };

        assert!(scheduler.fire_due(&trigger).is_empty());

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(scheduler.fire_due(&trigger), vec![job.id.clone()]);
        assert_eq!(
            scheduler.next_run(&job.id),
            Some(Utc.with_ymd_and_hms(2026, 1, 2, 2, 0, 0).unwrap())
        );

        // Not fired again until tomorrow.
        assert!(scheduler.fire_due(&trigger).is_empty());
        assert_eq!(trigger.fired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_fires_at_trigger_time() {
        let scheduler = scheduler();
        let bus = EventBus::new(16);
        let trigger = Arc::new(RecordingTrigger::default());
        let job = daily_job("docs", 2);
        scheduler.arm(&job);

        assert!(scheduler.start(trigger.clone(), &bus));
        assert!(!scheduler.start(trigger.clone(), &bus));
        assert!(scheduler.is_running());

        tokio::time::sleep(Duration::from_secs(3599)).await;
        assert!(trigger.fired().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(trigger.fired(), vec![job.id.clone()]);

        // A full day later it has fired exactly once more.
        tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        assert_eq!(trigger.fired().len(), 2);

        scheduler.stop().await;
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_picks_up_newly_armed_job() {
        let scheduler = scheduler();
        let bus = EventBus::new(16);
        let trigger = Arc::new(RecordingTrigger::default());
        scheduler.start(trigger.clone(), &bus);

        // Let the loop go idle with nothing armed.
        tokio::time::sleep(Duration::from_secs(1)).await;

        let job = Job::new("hourly", "/data", "bucket-1").with_schedule(Recurrence::Hourly);
        scheduler.arm(&job);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(trigger.fired(), vec![job.id.clone()]);

        scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarmed_job_does_not_fire() {
        let scheduler = scheduler();
        let bus = EventBus::new(16);
        let trigger = Arc::new(RecordingTrigger::default());
        let job = daily_job("docs", 2);
        scheduler.arm(&job);
        scheduler.start(trigger.clone(), &bus);

        tokio::time::sleep(Duration::from_secs(60)).await;
        scheduler.disarm(&job.id);
        tokio::time::sleep(Duration::from_secs(2 * 3600)).await;

        assert!(trigger.fired().is_empty());
        scheduler.stop().await;
    }
}
