//! The `Job` entity, its builder and lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use cms_core::{DomainError, Entity, IntegrationId, JobId, ProjectId, UserId};

use crate::import::{CodecError, ImportPayload, ImportResult};
use crate::owner::Owner;
use crate::progress::Progress;
use crate::state::State;
use crate::status::{JobType, Status};

/// One tracked asynchronous unit of work.
///
/// `start`, `complete`, `fail` and `cancel` are the sanctioned lifecycle
/// transitions. The `set_*` mutators are plain field writes for runners that
/// manage the state machine themselves. Every mutating method refreshes
/// `updated_at`. No transition is refused here, including out of a terminal
/// status; callers that need a guard check `is_finished()` first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    id: JobId,
    job_type: JobType,
    status: Status,
    project_id: ProjectId,
    owner: Owner,
    progress: Option<Progress>,
    #[serde(default)]
    payload: Vec<u8>,
    result: Option<Vec<u8>>,
    error: Option<String>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Entity for Job {
    type Id = JobId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

impl Job {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.job_type
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn owner(&self) -> Owner {
        self.owner
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.owner.user_id()
    }

    pub fn integration_id(&self) -> Option<IntegrationId> {
        self.owner.integration_id()
    }

    pub fn progress(&self) -> Option<&Progress> {
        self.progress.as_ref()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Creation time, derived from the time-ordered id.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.id.created_at()
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_finished()
    }

    /// Snapshot for broadcasting. Progress is only carried while in progress.
    pub fn state(&self) -> State {
        State::new(self.status, self.progress, self.error.clone())
    }

    /// Decode the payload according to the job type.
    pub fn import_payload(&self) -> Result<ImportPayload, CodecError> {
        match self.job_type {
            JobType::Import => ImportPayload::decode(&self.payload),
        }
    }

    /// Decode the result blob, if one was stored.
    pub fn import_result(&self) -> Result<Option<ImportResult>, CodecError> {
        match (self.job_type, self.result.as_deref()) {
            (JobType::Import, Some(bytes)) => ImportResult::decode(bytes).map(Some),
            (JobType::Import, None) => Ok(None),
        }
    }

    /// Mark the job as running. The first start time is kept on repeated calls.
    pub fn start(&mut self) {
        let now = self.touch();
        self.status = Status::InProgress;
        self.started_at.get_or_insert(now);
    }

    /// Mark the job as completed with its result.
    pub fn complete(&mut self, result: Vec<u8>) {
        let now = self.touch();
        self.status = Status::Completed;
        self.result = Some(result);
        self.completed_at = Some(now);
    }

    /// Mark the job as failed with a human-readable reason.
    pub fn fail(&mut self, error: impl Into<String>) {
        let now = self.touch();
        self.status = Status::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
    }

    /// Mark the job as cancelled.
    pub fn cancel(&mut self) {
        let now = self.touch();
        self.status = Status::Cancelled;
        self.completed_at = Some(now);
    }

    pub fn set_progress(&mut self, progress: Progress) {
        self.progress = Some(progress);
        self.touch();
    }

    pub fn set_result(&mut self, result: Vec<u8>) {
        self.result = Some(result);
        self.touch();
    }

    pub fn set_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.touch();
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.touch();
    }

    pub fn set_owner(&mut self, owner: impl Into<Owner>) {
        self.owner = owner.into();
        self.touch();
    }

    fn touch(&mut self) -> DateTime<Utc> {
        // Never move backwards, even if the wall clock does.
        let now = Utc::now().max(self.updated_at);
        self.updated_at = now;
        now
    }
}

/// A required field was missing when building a [`Job`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error("job id is required")]
    MissingId,
    #[error("job project is required")]
    MissingProject,
    #[error("job type is required")]
    MissingType,
    #[error("job owner (user or integration) is required")]
    MissingOwner,
}

impl From<BuildError> for DomainError {
    fn from(err: BuildError) -> Self {
        DomainError::validation(err.to_string())
    }
}

/// Builder producing validated [`Job`] instances.
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    id: Option<JobId>,
    job_type: Option<JobType>,
    status: Status,
    project_id: Option<ProjectId>,
    owner: Option<Owner>,
    progress: Option<Progress>,
    payload: Vec<u8>,
    result: Option<Vec<u8>>,
    error: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobBuilder {
    pub fn id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn new_id(self) -> Self {
        self.id(JobId::new())
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }

    pub fn project(mut self, project_id: ProjectId) -> Self {
        self.project_id = Some(project_id);
        self
    }

    /// Owner is a user; replaces any integration set before.
    pub fn user(self, user_id: UserId) -> Self {
        self.owner(user_id)
    }

    /// Owner is an integration; replaces any user set before.
    pub fn integration(self, integration_id: IntegrationId) -> Self {
        self.owner(integration_id)
    }

    pub fn owner(mut self, owner: impl Into<Owner>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn result(mut self, result: Vec<u8>) -> Self {
        self.result = Some(result);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn completed_at(mut self, at: DateTime<Utc>) -> Self {
        self.completed_at = Some(at);
        self
    }

    /// Validate and build. Reports the first missing field in the order
    /// id, project, type, owner.
    pub fn build(self) -> Result<Job, BuildError> {
        let id = self.id.ok_or(BuildError::MissingId)?;
        let project_id = self.project_id.ok_or(BuildError::MissingProject)?;
        let job_type = self.job_type.ok_or(BuildError::MissingType)?;
        let owner = self.owner.ok_or(BuildError::MissingOwner)?;

        let updated_at = self
            .updated_at
            .or_else(|| id.created_at())
            .unwrap_or_else(Utc::now);

        Ok(Job {
            id,
            job_type,
            status: self.status,
            project_id,
            owner,
            progress: self.progress,
            payload: self.payload,
            result: self.result,
            error: self.error,
            updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
