pub mod broadcast;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod ledger;
pub mod model;
pub mod process;
pub mod retention;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod transfer;

pub use broadcast::{BackupEvent, EventBus, SkipReason, Subscription};
pub use clock::{Clock, SystemClock, TokioClock};
pub use config::{load_config, load_config_or_default, Config};
pub use coordinator::{CoordinatorStatus, RunCoordinator, StartAccepted, StartRequest};
pub use db::Database;
pub use error::{
    AdmissionError, CloudstashError, ConfigError, RemoteError, Result, StoreError,
    SupervisorError,
};
pub use ledger::{RunCounts, RunLedger, INTERRUPTED_MESSAGE};
pub use model::{Bucket, Job, Recurrence, Retention, Run, RunOwner, RunStatus};
pub use retention::{RetentionManager, RetentionReport};
pub use scheduler::{ScheduleEntry, ScheduleZone, Scheduler};
pub use service::{BackupService, SchedulerStatus};
pub use store::{BackupStore, MemoryStore, SqliteStore};
pub use transfer::{ArtifactStore, ProgressSample, RemoteClient, RemoteEntry, TransferLine};
