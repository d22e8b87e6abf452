//! Scheduler, crash recovery and service start-up.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, TimeZone, Utc};

use cloudstash::config::TransferConfig;
use cloudstash::{
    BackupEvent, BackupService, BackupStore, Config, Job, MemoryStore, Recurrence, RemoteClient,
    RunStatus, ScheduleZone, TokioClock, INTERRUPTED_MESSAGE,
};

use common::{test_bucket, RunBuilder};

struct Fixture {
    store: Arc<MemoryStore>,
    service: BackupService,
    bucket_id: String,
}

/// Service on a paused clock starting at 2026-01-01 01:59 UTC, with a
/// transfer binary that cannot be launched.
fn fixture() -> Fixture {
    let store = Arc::new(MemoryStore::new());
    let bucket = test_bucket();
    store.save_bucket(&bucket).unwrap();

    let config = Config {
        transfer: TransferConfig {
            binary: PathBuf::from("/nonexistent/cloudstash-test-tool"),
            ..Default::default()
        },
        ..Default::default()
    };
    let origin = Utc.with_ymd_and_hms(2026, 1, 1, 1, 59, 0).unwrap();
    let service = BackupService::with_parts(
        store.clone(),
        &config,
        Arc::new(RemoteClient::new(config.transfer.clone())),
        Arc::new(TokioClock::starting_at(origin)),
        ScheduleZone::Fixed(FixedOffset::east_opt(0).unwrap()),
    );

    Fixture {
        store,
        service,
        bucket_id: bucket.id,
    }
}

#[tokio::test(start_paused = true)]
async fn test_daily_job_fires_at_trigger_time() {
    let fx = fixture();
    let job = Job::new("nightly", "/data/docs", &fx.bucket_id)
        .with_schedule(Recurrence::Daily { hour: 2, minute: 0 });
    let next = fx.service.save_job(&job).unwrap();
    assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap()));

    let mut events = fx.service.subscribe("test");
    assert!(fx.service.start().unwrap().is_empty());
    assert!(fx.service.scheduler_status().scheduler_active);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(fx.store.list_runs(None, None).unwrap().is_empty());

    tokio::time::sleep(Duration::from_secs(40)).await;
    let runs = fx.store.list_runs(Some(&job.id), None).unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].manual);
    // The stand-in binary cannot be launched, so the run fails right away.
    assert_eq!(runs[0].status, RunStatus::Failed);
    assert!(runs[0]
        .error
        .as_deref()
        .unwrap()
        .contains("/nonexistent/cloudstash-test-tool"));

    let mut seen = Vec::new();
    while let Some(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(seen.iter().any(|e| matches!(
        e,
        BackupEvent::BackupStarted { manual: false, job_id: Some(id), .. } if *id == job.id
    )));
    assert!(matches!(seen.last(), Some(BackupEvent::BackupError { .. })));

    assert_eq!(
        fx.service.next_run(&job.id),
        Some(Utc.with_ymd_and_hms(2026, 1, 2, 2, 0, 0).unwrap())
    );

    fx.service.shutdown().await;
    assert!(!fx.service.scheduler_status().scheduler_active);
}

#[tokio::test(start_paused = true)]
async fn test_weekly_job_counts_weekdays_from_sunday() {
    let fx = fixture();
    // 2026-01-01 is a Thursday; weekday 0 is the following Sunday.
    let job = Job::new("weekly", "/data/docs", &fx.bucket_id).with_schedule(Recurrence::Weekly {
        weekday: 0,
        hour: 9,
        minute: 30,
    });

    let next = fx.service.save_job(&job).unwrap();

    assert_eq!(next, Some(Utc.with_ymd_and_hms(2026, 1, 4, 9, 30, 0).unwrap()));
}

#[tokio::test(start_paused = true)]
async fn test_deleted_job_is_disarmed() {
    let fx = fixture();
    let job = Job::new("hourly", "/data/docs", &fx.bucket_id).with_schedule(Recurrence::Hourly);
    fx.service.save_job(&job).unwrap();
    assert_eq!(fx.service.all_scheduled().len(), 1);

    assert!(fx.service.delete_job(&job.id).unwrap());
    assert!(fx.service.all_scheduled().is_empty());
    assert_eq!(fx.service.next_run(&job.id), None);

    fx.service.start().unwrap();
    tokio::time::sleep(Duration::from_secs(2 * 3600)).await;
    assert!(fx.store.list_runs(None, None).unwrap().is_empty());
    fx.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_recovers_interrupted_runs_before_scheduling() {
    let fx = fixture();
    let job = Job::new("nightly", "/data/docs", &fx.bucket_id)
        .with_schedule(Recurrence::Daily { hour: 2, minute: 0 });
    fx.store.save_job(&job).unwrap();
    let stale = RunBuilder::running(&job.id, &fx.bucket_id).build();
    fx.store.append_run(&stale).unwrap();

    let recovered = fx.service.start().unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, stale.id);
    let run = fx.store.get_run(&stale.id).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some(INTERRUPTED_MESSAGE));
    assert!(run.completed_at.is_some());

    // Jobs already in the store are armed by start().
    assert_eq!(
        fx.service.next_run(&job.id),
        Some(Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap())
    );
    assert!(!fx.service.scheduler_status().is_running);
    fx.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_load_schedules_does_not_start_loop() {
    let fx = fixture();
    let job = Job::new("nightly", "/data/docs", &fx.bucket_id)
        .with_schedule(Recurrence::Daily { hour: 2, minute: 0 });
    fx.store.save_job(&job).unwrap();

    assert_eq!(fx.service.load_schedules().unwrap(), 1);
    assert!(!fx.service.scheduler_status().scheduler_active);

    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(fx.store.list_runs(None, None).unwrap().is_empty());
}
