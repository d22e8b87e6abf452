use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

/// Default config location: `~/.cloudstash/config.json`.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cloudstash")
        .join("config.json")
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Like [`load_config`], but a missing file yields the defaults.
///
/// Returns the config and whether a file was actually read.
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<(Config, bool), ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok((Config::default(), false));
    }
    load_config(path).map(|config| (config, true))
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.transfer.binary.as_os_str().is_empty() {
        return Err(ConfigError::Validation {
            message: "transfer.binary must not be empty".to_string(),
        });
    }

    if config.transfer.stop_grace_secs == 0 {
        return Err(ConfigError::Validation {
            message: "transfer.stop_grace_secs must be greater than 0".to_string(),
        });
    }

    if config.transfer.stats_interval_secs == 0 {
        return Err(ConfigError::Validation {
            message: "transfer.stats_interval_secs must be greater than 0".to_string(),
        });
    }

    // The remote name becomes part of environment variable names.
    let remote = &config.transfer.remote_name;
    if remote.is_empty() || !remote.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ConfigError::Validation {
            message: format!(
                "transfer.remote_name '{}' may only contain letters, digits and '_'",
                remote
            ),
        });
    }

    if config.events.capacity == 0 {
        return Err(ConfigError::Validation {
            message: "events.capacity must be greater than 0".to_string(),
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_empty_object_uses_defaults() {
        let config = load_config_from_str("{}").unwrap();
        assert_eq!(config.transfer.binary, PathBuf::from("rclone"));
        assert_eq!(config.transfer.stats_interval_secs, 1);
        assert_eq!(config.transfer.stop_grace_secs, 10);
        assert_eq!(config.transfer.remote_name, "cloudstash");
        assert_eq!(config.events.capacity, 256);
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert!(config.database.path.is_none());
    }

    #[test]
    fn test_load_full_config() {
        let config_json = r#"
        {
            "transfer": {
                "binary": "/usr/local/bin/rclone",
                "extra_args": ["--transfers", "8"],
                "stats_interval_secs": 2,
                "stop_grace_secs": 5,
                "remote_name": "backup_remote"
            },
            "database": { "path": "/var/lib/cloudstash/db.sqlite" },
            "events": { "capacity": 64 },
            "logging": { "level": "debug", "json": true }
        }
        "#;

        let config = load_config_from_str(config_json).unwrap();
        assert_eq!(config.transfer.binary, PathBuf::from("/usr/local/bin/rclone"));
        assert_eq!(config.transfer.extra_args, vec!["--transfers", "8"]);
        assert_eq!(config.transfer.stop_grace_secs, 5);
        assert_eq!(config.transfer.remote_name, "backup_remote");
        assert_eq!(
            config.database.resolved_path(),
            PathBuf::from("/var/lib/cloudstash/db.sqlite")
        );
        assert_eq!(config.events.capacity, 64);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_remote_name() {
        let result = load_config_from_str(r#"{"transfer": {"remote_name": "my-remote"}}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = load_config_from_str(r#"{"events": {"capacity": 0}}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_zero_grace_rejected() {
        let result = load_config_from_str(r#"{"transfer": {"stop_grace_secs": 0}}"#);
        assert!(matches!(result, Err(ConfigError::Validation { .. })));
    }

    #[test]
    fn test_invalid_json() {
        let result = load_config_from_str("{ transfer: }");
        assert!(matches!(result, Err(ConfigError::ParseJson(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let (config, found) = load_config_or_default(dir.path().join("config.json")).unwrap();
        assert!(!found);
        assert_eq!(config.transfer.remote_name, "cloudstash");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"logging": {"level": "warn"}}"#).unwrap();

        let (config, found) = load_config_or_default(&path).unwrap();
        assert!(found);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_unreadable_path_reports_read_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_config(dir.path());
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }
}
