//! Mirrors engine events into the log.

use cloudstash::{BackupEvent, Subscription};
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;

/// Observer name the bridge subscribes under.
pub const BRIDGE_OBSERVER: &str = "daemon-log";

/// Spawns a task that logs every event until the subscription ends.
pub fn start_event_bridge(mut subscription: Subscription) -> JoinHandle<()> {
    info!("Starting event bridge");
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            log_event(&event);
        }
        info!("Event bridge for '{}' stopped", subscription.observer());
    })
}

pub fn log_event(event: &BackupEvent) {
    match event {
        BackupEvent::Started {
            run_id,
            job_name,
            source_path,
            destination,
            dry_run,
            ..
        } => info!(
            "[{}] Backing up {} ({}) to {}{}",
            short_id(run_id),
            source_path,
            job_name.as_deref().unwrap_or("ad-hoc"),
            destination,
            if *dry_run { " (dry run)" } else { "" }
        ),
        BackupEvent::Progress { run_id, progress } => debug!(
            "[{}] {}% {} bytes/s eta {}",
            short_id(run_id),
            progress.percentage,
            progress.speed,
            progress
                .eta
                .map(|s| format!("{}s", s))
                .unwrap_or_else(|| "-".to_string())
        ),
        BackupEvent::FileTransferred { run_id, file } => {
            debug!("[{}] Copied {}", short_id(run_id), file)
        }
        BackupEvent::FileSkipped { run_id, file } => {
            debug!("[{}] Unchanged {}", short_id(run_id), file)
        }
        BackupEvent::UsingPath { run_id, path } => {
            info!("[{}] Writing to {}", short_id(run_id), path)
        }
        BackupEvent::NothingToTransfer { run_id } => {
            info!("[{}] Nothing to transfer", short_id(run_id))
        }
        BackupEvent::Log { run_id, line } => debug!("[{}] {}", short_id(run_id), line),
        BackupEvent::Error {
            run_id,
            message,
            fatal,
        } => {
            if *fatal {
                error!("[{}] {}", short_id(run_id), message)
            } else {
                warn!("[{}] {}", short_id(run_id), message)
            }
        }
        BackupEvent::Complete {
            run_id,
            files_transferred,
            files_skipped,
            total_bytes,
        } => info!(
            "[{}] Transfer complete: {} copied, {} unchanged, {} bytes",
            short_id(run_id),
            files_transferred,
            files_skipped,
            total_bytes
        ),
        BackupEvent::Stopped { run_id } => info!("[{}] Transfer stopped", short_id(run_id)),
        BackupEvent::BackupStarted {
            run_id,
            job_id,
            manual,
        } => info!(
            "Backup {} started for job {} ({})",
            run_id,
            job_id.as_deref().unwrap_or("-"),
            if *manual { "manual" } else { "scheduled" }
        ),
        BackupEvent::BackupCompleted {
            run_id,
            job_id,
            files_transferred,
            total_size,
        } => info!(
            "Backup {} of job {} completed: {} file(s), {} bytes",
            run_id,
            job_id.as_deref().unwrap_or("-"),
            files_transferred,
            total_size
        ),
        BackupEvent::BackupError {
            run_id,
            job_id,
            error,
        } => error!(
            "Backup {} of job {} failed: {}",
            run_id,
            job_id.as_deref().unwrap_or("-"),
            error
        ),
        BackupEvent::BackupSkipped { job_id, reason } => warn!(
            "Scheduled backup of job {} skipped: {}",
            job_id.as_deref().unwrap_or("-"),
            reason
        ),
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}
