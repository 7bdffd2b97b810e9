//! Job storage: the repository contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cms_core::{JobId, ProjectId};
use cms_job::{Job, JobType, Status};

/// Durable job store consumed by the runner and watchers.
pub trait JobRepository: Send + Sync {
    /// Get a job by ID.
    fn find_by_id(&self, job_id: &JobId) -> Result<Job, StoreError>;

    /// List a project's jobs in creation order.
    fn find_by_project(&self, project_id: &ProjectId, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Insert or replace a job.
    fn save(&self, job: &Job) -> Result<(), StoreError>;
}

impl<R> JobRepository for Arc<R>
where
    R: JobRepository + ?Sized,
{
    fn find_by_id(&self, job_id: &JobId) -> Result<Job, StoreError> {
        (**self).find_by_id(job_id)
    }

    fn find_by_project(&self, project_id: &ProjectId, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        (**self).find_by_project(project_id, filter)
    }

    fn save(&self, job: &Job) -> Result<(), StoreError> {
        (**self).save(job)
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Optional narrowing for [`JobRepository::find_by_project`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<Status>,
}

impl JobFilter {
    pub fn with_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.job_type.is_none_or(|t| job.job_type() == t)
            && self.status.is_none_or(|s| job.status() == s)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.jobs.read().map_or(0, |jobs| jobs.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Storage("job map lock poisoned".to_string())
}

impl JobRepository for InMemoryJobRepository {
    fn find_by_id(&self, job_id: &JobId) -> Result<Job, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        jobs.get(job_id).cloned().ok_or(StoreError::NotFound(*job_id))
    }

    fn find_by_project(&self, project_id: &ProjectId, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.project_id() == *project_id && filter.matches(j))
            .cloned()
            .collect();

        // Ids are time-ordered, so this is creation order.
        result.sort_by_key(|j| j.id());
        Ok(result)
    }

    fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        jobs.insert(job.id(), job.clone());
        Ok(())
    }
}
