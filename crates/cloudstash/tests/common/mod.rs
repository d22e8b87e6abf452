//! Shared test utilities for cloudstash integration tests.
//!
//! - `TestHarness` wires a `BackupService` to a temp source folder, an
//!   in-memory store and a scripted stand-in for the transfer tool.
//! - Builders for seeding jobs and historical runs.

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::*;
