//! Background job execution around the job entity and the progress bus.
//!
//! ## Components
//!
//! - `JobRepository`: durable job store contract (in-memory implementation for tests/dev)
//! - `JobRunner`: runs jobs with registered handlers, persisting and publishing each change
//! - `wait_for_finish`: observer helper racing the live feed against a deadline

pub mod runner;
pub mod store;
pub mod watch;

pub use runner::{JobHandler, JobRunner, ProgressReporter, RunnerError, RunnerStats};
pub use store::{InMemoryJobRepository, JobFilter, JobRepository, StoreError};
pub use watch::{WatchError, wait_for_finish};
