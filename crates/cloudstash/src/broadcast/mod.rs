//! Event streaming to observers.

pub mod bus;
pub mod events;

pub use bus::{EventBus, Subscription};
pub use events::{BackupEvent, SkipReason};
