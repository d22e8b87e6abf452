//! Domain records shared by the store, the coordinator and the scheduler.

pub mod bucket;
pub mod job;
pub mod run;

pub use bucket::Bucket;
pub use job::{Job, Recurrence, Retention, ValidationError};
pub use run::{Run, RunOwner, RunStatus, RunUpdate};
