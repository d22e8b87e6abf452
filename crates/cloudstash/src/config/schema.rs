use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub events: EventsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the external transfer tool is invoked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    #[serde(default = "default_binary")]
    pub binary: PathBuf,
    /// Appended verbatim to every copy invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
    /// Seconds to wait after SIGTERM before killing the process.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Name of the on-the-fly remote defined through environment variables.
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
}

fn default_binary() -> PathBuf {
    PathBuf::from("rclone")
}

fn default_stats_interval() -> u64 {
    1
}

fn default_stop_grace() -> u64 {
    10
}

fn default_remote_name() -> String {
    "cloudstash".to_string()
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            extra_args: Vec::new(),
            stats_interval_secs: default_stats_interval(),
            stop_grace_secs: default_stop_grace(),
            remote_name: default_remote_name(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `~/.cloudstash/data/cloudstash.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> PathBuf {
        self.path
            .clone()
            .or_else(crate::db::default_database_path)
            .unwrap_or_else(|| PathBuf::from("cloudstash.db"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before it starts lagging.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    256
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
