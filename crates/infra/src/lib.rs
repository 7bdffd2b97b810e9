//! Infrastructure layer: job storage, execution, and configuration.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, JobsConfig};
