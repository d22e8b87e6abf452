//! Backup job definitions.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Validation failures for a job definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Job name must not be empty")]
    EmptyName,

    #[error("Source path must be absolute: {0}")]
    RelativeSource(PathBuf),

    #[error("Job must reference a bucket")]
    MissingBucket,

    #[error("{field} must be between 0 and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },
}

/// Recurrence policy of a job.
///
/// `weekday` counts from Sunday (0) to Saturday (6). Times are wall-clock
/// times in the scheduler's time zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Recurrence {
    Hourly,
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        weekday: u32,
        hour: u32,
        minute: u32,
    },
}

impl Recurrence {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let (weekday, hour, minute) = match *self {
            Recurrence::Hourly => return Ok(()),
            Recurrence::Daily { hour, minute } => (None, hour, minute),
            Recurrence::Weekly {
                weekday,
                hour,
                minute,
            } => (Some(weekday), hour, minute),
        };

        if let Some(weekday) = weekday {
            check_range("weekday", weekday, 6)?;
        }
        check_range("hour", hour, 23)?;
        check_range("minute", minute, 59)
    }
}

fn check_range(field: &'static str, value: u32, max: u32) -> Result<(), ValidationError> {
    if value > max {
        return Err(ValidationError::OutOfRange { field, value, max });
    }
    Ok(())
}

/// How many completed runs of a job are kept.
///
/// Stored as a signed count where `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Retention {
    #[default]
    Unlimited,
    Keep(u32),
}

impl Retention {
    pub fn as_count(self) -> i64 {
        match self {
            Retention::Unlimited => -1,
            Retention::Keep(n) => i64::from(n),
        }
    }
}

impl From<i64> for Retention {
    fn from(count: i64) -> Self {
        if count < 0 {
            Retention::Unlimited
        } else {
            Retention::Keep(u32::try_from(count).unwrap_or(u32::MAX))
        }
    }
}

impl From<Retention> for i64 {
    fn from(retention: Retention) -> Self {
        retention.as_count()
    }
}

/// A named backup configuration binding a local folder to a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub source_path: PathBuf,
    pub bucket_id: String,
    /// Folder inside the bucket. Defaults to a slug of the job name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Recurrence>,
    #[serde(default, rename = "retentionCount")]
    pub retention: Retention,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates an unscheduled job with unlimited retention and a fresh id.
    pub fn new(name: &str, source_path: impl Into<PathBuf>, bucket_id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            source_path: source_path.into(),
            bucket_id: bucket_id.to_string(),
            destination: None,
            schedule: None,
            retention: Retention::Unlimited,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_schedule(mut self, schedule: Recurrence) -> Self {
        self.schedule = Some(schedule);
        self
    }

    pub fn with_retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_destination(mut self, destination: &str) -> Self {
        self.destination = Some(destination.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if !self.source_path.is_absolute() {
            return Err(ValidationError::RelativeSource(self.source_path.clone()));
        }
        if self.bucket_id.trim().is_empty() {
            return Err(ValidationError::MissingBucket);
        }
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }
        Ok(())
    }
}
