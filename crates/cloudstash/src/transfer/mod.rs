//! Everything that touches the external transfer tool.

pub mod command;
pub mod parse;
pub mod remote;
pub mod supervisor;

pub use command::Invocation;
pub use parse::{parse_line, LineBuffer, ProgressSample, TransferLine};
pub use remote::{ArtifactStore, EntryKind, RemoteClient, RemoteEntry};
pub use supervisor::{TransferEvent, TransferHandle, TransferOutcome, TransferSupervisor};
