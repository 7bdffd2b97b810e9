//! `cms-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the job subsystem
//! (no infrastructure concerns).

pub mod entity;
pub mod error;
pub mod id;
pub mod value_object;

pub use entity::Entity;
pub use error::DomainError;
pub use id::{IntegrationId, JobId, ProjectId, UserId};
pub use value_object::ValueObject;
