//! Transfer tool invocations.
//!
//! Credentials never appear in argv. The remote is defined on the fly through
//! `RCLONE_CONFIG_<REMOTE>_*` environment variables, and every command
//! addresses it as `<remote>:<bucket>/<path>`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::process::Command as TokioCommand;

use crate::config::TransferConfig;
use crate::model::Bucket;

/// Format of the timestamp that starts every per-run folder.
const RUN_FOLDER_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Run id characters appended to the timestamp, so runs started within the
/// same second get distinct folders.
const RUN_FOLDER_ID_CHARS: usize = 8;

/// A fully built transfer tool command line.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    /// Builds the process command with both output streams piped.
    pub fn command(&self) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }

    /// Human-readable command line for logs. Environment values are omitted.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// `copy <source> <remote>:<bucket>/<path>` with JSON logging and stats.
pub fn build_copy(
    config: &TransferConfig,
    bucket: &Bucket,
    source: &Path,
    remote_path: &str,
    dry_run: bool,
) -> Invocation {
    let mut args = vec![
        "copy".to_string(),
        source.display().to_string(),
        remote_target(&config.remote_name, bucket, remote_path),
        "--use-json-log".to_string(),
        "-v".to_string(),
        "--stats".to_string(),
        format!("{}s", config.stats_interval_secs),
        "--stats-log-level".to_string(),
        "NOTICE".to_string(),
    ];
    if dry_run {
        args.push("--dry-run".to_string());
    }
    args.extend(config.extra_args.iter().cloned());

    Invocation {
        program: config.binary.clone(),
        args,
        env: credential_env(&config.remote_name, bucket),
    }
}

/// `purge <remote>:<bucket>/<path>`, removing a run's artifacts.
pub fn build_purge(config: &TransferConfig, bucket: &Bucket, path: &str) -> Invocation {
    Invocation {
        program: config.binary.clone(),
        args: vec![
            "purge".to_string(),
            remote_target(&config.remote_name, bucket, path),
        ],
        env: credential_env(&config.remote_name, bucket),
    }
}

/// `lsjson <remote>:<bucket>/<path>`, one directory level.
pub fn build_lsjson(config: &TransferConfig, bucket: &Bucket, path: &str) -> Invocation {
    Invocation {
        program: config.binary.clone(),
        args: vec![
            "lsjson".to_string(),
            remote_target(&config.remote_name, bucket, path),
        ],
        env: credential_env(&config.remote_name, bucket),
    }
}

/// Environment variables defining an S3 remote named `remote_name`.
pub fn credential_env(remote_name: &str, bucket: &Bucket) -> Vec<(String, String)> {
    let prefix = format!("RCLONE_CONFIG_{}", remote_name.to_ascii_uppercase());
    let mut env = vec![
        (format!("{}_TYPE", prefix), "s3".to_string()),
        (format!("{}_PROVIDER", prefix), bucket.provider.clone()),
        (
            format!("{}_ACCESS_KEY_ID", prefix),
            bucket.access_key_id.clone(),
        ),
        (
            format!("{}_SECRET_ACCESS_KEY", prefix),
            bucket.secret_access_key.clone(),
        ),
    ];

    if let Some(endpoint) = bucket.endpoint.as_deref().filter(|e| !e.is_empty()) {
        env.push((format!("{}_ENDPOINT", prefix), endpoint.to_string()));
    }
    if let Some(region) = bucket.region.as_deref().filter(|r| !r.is_empty()) {
        env.push((format!("{}_REGION", prefix), region.to_string()));
    }

    env
}

/// `<remote>:<bucket>[/<path>]`.
pub fn remote_target(remote_name: &str, bucket: &Bucket, path: &str) -> String {
    let path = path.trim_matches('/');
    if path.is_empty() {
        format!("{}:{}", remote_name, bucket.bucket)
    } else {
        format!("{}:{}/{}", remote_name, bucket.bucket, path)
    }
}

/// Path inside the bucket a run writes to: `<prefix>/<base>/<run folder>`,
/// where the run folder is `<timestamp>_<start of run id>`.
pub fn resolve_destination(
    bucket: &Bucket,
    base: &str,
    started_at: DateTime<Utc>,
    run_id: &str,
) -> String {
    let suffix: String = run_id.chars().take(RUN_FOLDER_ID_CHARS).collect();
    let folder = format!("{}_{}", started_at.format(RUN_FOLDER_FORMAT), suffix);
    join_remote_path(&[bucket.prefix.as_deref().unwrap_or(""), base, &folder])
}

/// Default destination base for a job or an ad-hoc source.
pub fn default_base(job_name: Option<&str>, source: &Path) -> String {
    let name = job_name
        .map(str::to_string)
        .or_else(|| {
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_default();
    sanitize_segment(&name)
}

/// Makes a name safe to use as a single path segment.
pub fn sanitize_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.trim().chars() {
        if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }

    let trimmed = out.trim_matches(|c| c == '_' || c == '.');
    if trimmed.is_empty() {
        "backup".to_string()
    } else {
        trimmed.to_string()
    }
}

fn join_remote_path(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim_matches('/'))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}
