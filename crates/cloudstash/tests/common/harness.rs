//! Isolated environment for end-to-end backup tests.
//!
//! The transfer tool is replaced by a shell script that logs its arguments
//! and prints canned rclone-style JSON log lines.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use cloudstash::config::TransferConfig;
use cloudstash::{
    BackupEvent, BackupService, BackupStore, Bucket, Config, MemoryStore, Subscription,
};

use super::builders::test_bucket;

/// How long a test waits for a backup to finish before failing.
pub const OUTCOME_TIMEOUT: Duration = Duration::from_secs(15);

/// Canned behavior of the fake transfer tool for `copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolBehavior {
    /// Copies two files, skips one, reports 2048 bytes.
    Succeed,
    /// Reports nothing to transfer.
    NothingToTransfer,
    /// Logs an access error and exits 1.
    Fail,
    /// Never exits on its own.
    Hang,
}

impl ToolBehavior {
    fn copy_script(self) -> &'static str {
        match self {
            ToolBehavior::Succeed => {
                r#"    echo '{"level":"info","msg":"Copied (new)","object":"a.txt"}' >&2
    echo '{"level":"info","msg":"Copied (new)","object":"sub/b.txt"}' >&2
    echo '{"level":"info","msg":"Unchanged skipping","object":"c.txt"}' >&2
    echo '{"level":"notice","msg":"stats","stats":{"bytes":2048,"totalBytes":2048,"speed":1024,"eta":0,"errors":0,"checks":1}}' >&2
    exit 0"#
            }
            ToolBehavior::NothingToTransfer => {
                r#"    echo '{"level":"notice","msg":"There was nothing to transfer"}' >&2
    exit 0"#
            }
            ToolBehavior::Fail => {
                r#"    echo '{"level":"info","msg":"Starting copy"}' >&2
    echo '{"level":"error","msg":"Failed to copy: AccessDenied","object":"a.txt"}' >&2
    exit 1"#
            }
            ToolBehavior::Hang => "    exec sleep 30",
        }
    }
}

/// The script standing in for the transfer tool, plus its call log.
pub struct FakeTool {
    pub path: PathBuf,
    pub calls_log: PathBuf,
}

impl FakeTool {
    pub fn install(dir: &Path, behavior: ToolBehavior) -> Self {
        let path = dir.join("fake-rclone");
        let calls_log = dir.join("calls.log");
        let script = format!(
            r#"#!/bin/sh
printf '%s\n' "$*" >> '{calls}'
case "$1" in
  copy)
{copy}
    ;;
  purge)
    exit 0
    ;;
  lsjson)
    echo '[{{"Path":"2026-01-01_02-00-00","Name":"2026-01-01_02-00-00","Size":-1,"IsDir":true}},{{"Path":"notes.txt","Name":"notes.txt","Size":42,"IsDir":false}}]'
    exit 0
    ;;
  *)
    echo "unknown command: $1" >&2
    exit 2
    ;;
esac
"#,
            calls = calls_log.display(),
            copy = behavior.copy_script(),
        );
        std::fs::write(&path, script).expect("Failed to write fake tool");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("Failed to make fake tool executable");
        }

        Self { path, calls_log }
    }

    /// Argument lines of every invocation so far.
    pub fn calls(&self) -> Vec<String> {
        std::fs::read_to_string(&self.calls_log)
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// A backup service wired to a fake tool and a temp source folder.
pub struct TestHarness {
    temp_dir: TempDir,
    pub source_dir: PathBuf,
    pub tool: FakeTool,
    pub store: Arc<dyn BackupStore>,
    pub service: BackupService,
    pub bucket: Bucket,
}

impl TestHarness {
    /// Harness backed by an in-memory store.
    pub fn new(behavior: ToolBehavior) -> Self {
        Self::with_store(behavior, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(behavior: ToolBehavior, store: Arc<dyn BackupStore>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let source_dir = temp_dir.path().join("docs");
        std::fs::create_dir_all(&source_dir).expect("Failed to create source dir");
        std::fs::write(source_dir.join("a.txt"), "hello").expect("Failed to write source file");

        let tool = FakeTool::install(temp_dir.path(), behavior);
        let config = Config {
            transfer: TransferConfig {
                binary: tool.path.clone(),
                stop_grace_secs: 2,
                ..Default::default()
            },
            ..Default::default()
        };

        let bucket = test_bucket();
        store.save_bucket(&bucket).expect("Failed to save bucket");
        let service = BackupService::new(Arc::clone(&store), &config);

        Self {
            temp_dir,
            source_dir,
            tool,
            store,
            service,
            bucket,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn subscribe(&self) -> Subscription {
        self.service.subscribe("test")
    }
}

/// Collects events of `run_id` until its job-level outcome arrives.
pub async fn collect_run(events: &mut Subscription, run_id: &str) -> Vec<BackupEvent> {
    let collect = async {
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            if event.run_id() != Some(run_id) {
                continue;
            }
            let done = event.is_job_outcome();
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    };
    tokio::time::timeout(OUTCOME_TIMEOUT, collect)
        .await
        .expect("Backup did not finish in time")
}

/// Waits until the service reports no active backup.
pub async fn wait_idle(service: &BackupService) {
    let wait = async {
        while service.scheduler_status().is_running {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    };
    tokio::time::timeout(OUTCOME_TIMEOUT, wait)
        .await
        .expect("Service did not become idle");
}
