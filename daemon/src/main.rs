mod cli;
mod error;
mod events;
mod logging;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use cloudstash::config::default_config_path;
use cloudstash::{
    load_config_or_default, BackupEvent, BackupService, BackupStore, Config, Database,
    SqliteStore, StartRequest,
};
use log::{error, info, warn};

use crate::cli::{Args, Commands};
use crate::error::{DaemonError, Result};
use crate::events::{start_event_bridge, BRIDGE_OBSERVER};

/// Extra time allowed past the stop grace period for a run to wind down on
/// shutdown.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let (config, found) = load_config_or_default(&config_path)?;

    logging::init_logging(&config.logging, args.verbose)?;
    info!("cloudstash-daemon v{}", env!("CARGO_PKG_VERSION"));
    if found {
        info!("Loaded config from {}", config_path.display());
    } else {
        info!("No config at {}, using defaults", config_path.display());
    }

    let service = open_service(&config)?;

    match args.command {
        Commands::Run => run_daemon(service, &config).await,
        Commands::Backup { job_id, dry_run } => run_backup(&service, &job_id, dry_run).await,
        Commands::Schedule => print_schedule(&service),
        Commands::Jobs => print_jobs(&service),
    }
}

fn open_service(config: &Config) -> Result<Arc<BackupService>> {
    let db = Database::open(&config.database.resolved_path())?;
    let store: Arc<dyn BackupStore> = Arc::new(SqliteStore::new(db));
    Ok(Arc::new(BackupService::new(store, config)))
}

async fn run_daemon(service: Arc<BackupService>, config: &Config) -> Result<()> {
    let bridge = start_event_bridge(service.subscribe(BRIDGE_OBSERVER));

    let recovered = service.start()?;
    for run in &recovered {
        warn!(
            "Run {} of job {} was interrupted by a restart",
            run.id,
            run.job_id.as_deref().unwrap_or("-")
        );
    }
    for entry in service.all_scheduled() {
        info!(
            "Job '{}' next runs at {}",
            entry.job_name,
            entry.next_trigger.with_timezone(&chrono::Local)
        );
    }

    tokio::signal::ctrl_c().await.map_err(DaemonError::Signal)?;
    info!("Shutdown requested");

    service.shutdown().await;
    let limit = Duration::from_secs(config.transfer.stop_grace_secs) + SHUTDOWN_SLACK;
    if tokio::time::timeout(limit, wait_until_idle(&service))
        .await
        .is_err()
    {
        warn!("Active backup did not finish within {:?}", limit);
    }

    service.unsubscribe_all(BRIDGE_OBSERVER);
    let _ = bridge.await;
    info!("Daemon stopped");
    Ok(())
}

async fn wait_until_idle(service: &BackupService) {
    while service.scheduler_status().is_running {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Runs one manual backup, printing its events as JSON lines.
///
/// A daemon may be running alongside; admission is refused while it has a
/// live run, and only runs of exited processes are recovered.
async fn run_backup(service: &BackupService, job_id: &str, dry_run: bool) -> Result<()> {
    for run in service.recover_interrupted()? {
        warn!(
            "Run {} of job {} was interrupted by a restart",
            run.id,
            run.job_id.as_deref().unwrap_or("-")
        );
    }

    let mut events = service.subscribe("daemon-cli");
    let accepted = service.start_backup(StartRequest {
        dry_run,
        ..StartRequest::for_job(job_id)
    })?;
    info!(
        "Backup {} started, writing to {}",
        accepted.run_id, accepted.resolved_path
    );

    let mut stopping = false;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !stopping => {
                signal.map_err(DaemonError::Signal)?;
                info!("Stopping backup {}", accepted.run_id);
                stopping = service.stop_backup();
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Err(DaemonError::EventsClosed);
                };
                if event.run_id() != Some(accepted.run_id.as_str()) {
                    continue;
                }
                println!("{}", serde_json::to_string(&event)?);
                match event {
                    BackupEvent::BackupCompleted { .. } => return Ok(()),
                    BackupEvent::BackupError { run_id, error, .. } => {
                        return Err(DaemonError::BackupFailed { run_id, message: error });
                    }
                    _ => {}
                }
            }
        }
    }
}

fn print_schedule(service: &BackupService) -> Result<()> {
    service.load_schedules()?;
    let entries = service.all_scheduled();
    if entries.is_empty() {
        println!("No scheduled jobs");
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {}  {}",
            entry
                .next_trigger
                .with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M %:z"),
            entry.job_id,
            entry.job_name
        );
    }
    Ok(())
}

fn print_jobs(service: &BackupService) -> Result<()> {
    let jobs = service.list_jobs()?;
    println!("{}", serde_json::to_string_pretty(&jobs)?);
    Ok(())
}
