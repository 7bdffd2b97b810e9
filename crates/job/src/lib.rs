//! Job domain module.
//!
//! A `Job` is one tracked asynchronous unit of work (e.g. a bulk import) with
//! a status lifecycle and progress metrics. This crate is deterministic domain
//! logic only: persistence and broadcasting live in other crates.

pub mod import;
pub mod job;
pub mod owner;
pub mod progress;
pub mod state;
pub mod status;

pub use import::{CodecError, ImportFormat, ImportPayload, ImportResult, ImportStrategy};
pub use job::{BuildError, Job, JobBuilder};
pub use owner::Owner;
pub use progress::Progress;
pub use state::State;
pub use status::{JobType, ParseStatusError, Status};

pub use cms_core::JobId;
