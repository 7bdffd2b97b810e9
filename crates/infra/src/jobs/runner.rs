//! Job runner: drives a job through its lifecycle and broadcasts every change.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, info, warn};

use cms_core::JobId;
use cms_events::{KeyedBus, PubSubError};
use cms_job::{Job, JobType, Progress, State, Status};

use super::store::{JobRepository, StoreError};

/// Job handler function type.
///
/// Returns the opaque result blob on success. Errors become the job's
/// failure message (the whole `anyhow` context chain).
pub type JobHandler = Box<dyn Fn(&Job, &ProgressReporter<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error("job cancelled: {0}")]
    Cancelled(JobId),
}

/// Runner statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub executed: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Jobs whose handler is running, mapped to whether a cancel was requested.
///
/// The lock is held across every persist that touches a running job, so a
/// cancel and the run's own writes never interleave.
type Runs = Mutex<HashMap<JobId, bool>>;

fn lock_runs(runs: &Runs) -> MutexGuard<'_, HashMap<JobId, bool>> {
    runs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a job from the run registry if its handler unwinds.
struct RunGuard<'a> {
    runs: &'a Runs,
    job_id: JobId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        lock_runs(self.runs).remove(&self.job_id);
    }
}

/// Handed to a running handler so it can report progress.
///
/// Each report updates the in-flight job, persists it and publishes its state.
pub struct ProgressReporter<'a> {
    repo: &'a dyn JobRepository,
    bus: &'a dyn KeyedBus<JobId, State>,
    runs: &'a Runs,
    job: RefCell<Job>,
}

impl<'a> ProgressReporter<'a> {
    fn new(
        repo: &'a dyn JobRepository,
        bus: &'a dyn KeyedBus<JobId, State>,
        runs: &'a Runs,
        job: Job,
    ) -> Self {
        Self {
            repo,
            bus,
            runs,
            job: RefCell::new(job),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.borrow().id()
    }

    /// Record `processed` of `total` units done.
    ///
    /// Fails with [`RunnerError::Cancelled`] once the job was cancelled, so
    /// handlers can stop with `?`.
    pub fn report(&self, processed: u64, total: u64) -> Result<(), RunnerError> {
        let runs = lock_runs(self.runs);
        if self.cancelled(&runs) {
            return Err(RunnerError::Cancelled(self.job_id()));
        }

        let mut job = self.job.borrow_mut();
        job.set_progress(Progress::new(processed, total));
        self.repo.save(&job)?;
        self.bus.publish(&job.id(), job.state())?;
        Ok(())
    }

    /// Whether the job was cancelled through the runner or in the store.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled(&lock_runs(self.runs))
    }

    fn cancelled(&self, runs: &HashMap<JobId, bool>) -> bool {
        let job_id = self.job_id();
        runs.get(&job_id).copied().unwrap_or(false)
            || self
                .repo
                .find_by_id(&job_id)
                .is_ok_and(|stored| stored.status() == Status::Cancelled)
    }

    fn into_job(self) -> Job {
        self.job.into_inner()
    }
}

/// Executes jobs with registered handlers.
///
/// Every persisted change is followed by a publish of the job's state, so
/// observers see `in_progress`, each progress report, and the final state.
pub struct JobRunner<R, B> {
    name: String,
    repo: R,
    bus: B,
    handlers: HashMap<JobType, JobHandler>,
    release_on_finish: bool,
    runs: Runs,
    stats: Mutex<RunnerStats>,
}

impl<R, B> JobRunner<R, B>
where
    R: JobRepository,
    B: KeyedBus<JobId, State>,
{
    pub fn new(name: impl Into<String>, repo: R, bus: B) -> Self {
        Self {
            name: name.into(),
            repo,
            bus,
            handlers: HashMap::new(),
            release_on_finish: false,
            runs: Mutex::new(HashMap::new()),
            stats: Mutex::new(RunnerStats::default()),
        }
    }

    /// Unsubscribe a job's observers right after its final state is published.
    ///
    /// Observers drain what is buffered (normally including the final state)
    /// and then see their subscription close. Late subscribers get nothing.
    pub fn with_release_on_finish(mut self, release: bool) -> Self {
        self.release_on_finish = release;
        self
    }

    /// Register a handler for a job type.
    pub fn register_handler<F>(&mut self, job_type: JobType, handler: F)
    where
        F: Fn(&Job, &ProgressReporter<'_>) -> anyhow::Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.insert(job_type, Box::new(handler));
    }

    pub fn stats(&self) -> RunnerStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of jobs whose handler is currently running.
    pub fn running(&self) -> usize {
        lock_runs(&self.runs).len()
    }

    /// Run one job to completion on the calling thread.
    ///
    /// Finished jobs, and jobs already running elsewhere on this runner, are
    /// returned untouched. A job cancelled while its handler ran stays
    /// cancelled whatever the handler returned.
    pub fn execute(&self, job_id: &JobId) -> Result<State, RunnerError> {
        // Cheap check before taking the run lock.
        let job = self.repo.find_by_id(job_id)?;
        if job.is_finished() {
            debug!(runner = %self.name, job_id = %job_id, status = %job.status(), "job already finished");
            return Ok(job.state());
        }

        let (job, handler) = {
            let mut runs = lock_runs(&self.runs);
            let mut job = self.repo.find_by_id(job_id)?;
            if job.is_finished() || runs.contains_key(job_id) {
                debug!(runner = %self.name, job_id = %job_id, status = %job.status(), "job not startable");
                return Ok(job.state());
            }

            self.record(|s| s.executed += 1);

            let Some(handler) = self.handlers.get(&job.job_type()) else {
                let error = format!("no handler registered for job type {}", job.job_type());
                warn!(runner = %self.name, job_id = %job_id, error = %error, "no handler for job");
                job.fail(error);
                self.persist(&job)?;
                self.record(|s| s.failed += 1);
                drop(runs);
                self.release(job_id);
                return Ok(job.state());
            };

            job.start();
            self.persist(&job)?;
            runs.insert(*job_id, false);
            (job, handler)
        };
        let _guard = RunGuard { runs: &self.runs, job_id: *job_id };
        debug!(runner = %self.name, job_id = %job_id, job_type = %job.job_type(), "job started");

        let reporter = ProgressReporter::new(&self.repo, &self.bus, &self.runs, job.clone());
        let outcome = if reporter.is_cancelled() {
            None
        } else {
            Some(handler(&job, &reporter))
        };
        let mut job = reporter.into_job();

        let mut runs = lock_runs(&self.runs);
        let requested = runs.remove(job_id).unwrap_or(false);
        let stored = self.repo.find_by_id(job_id)?;
        let outcome = match outcome {
            Some(outcome) if !requested && stored.status() != Status::Cancelled => outcome,
            _ => {
                info!(runner = %self.name, job_id = %job_id, "job cancelled while running");
                let mut stored = stored;
                if stored.status() != Status::Cancelled {
                    stored.cancel();
                    self.persist(&stored)?;
                }
                drop(runs);
                self.release(job_id);
                return Ok(stored.state());
            }
        };

        match outcome {
            Ok(result) => {
                job.complete(result);
                self.record(|s| s.completed += 1);
                info!(runner = %self.name, job_id = %job_id, "job completed");
            }
            Err(err) => {
                job.fail(format!("{err:#}"));
                self.record(|s| s.failed += 1);
                warn!(runner = %self.name, job_id = %job_id, error = %format!("{err:#}"), "job failed");
            }
        }
        self.persist(&job)?;
        drop(runs);
        self.release(job_id);

        Ok(job.state())
    }

    /// Cancel an unfinished job. Finished jobs are returned untouched.
    pub fn cancel(&self, job_id: &JobId) -> Result<State, RunnerError> {
        let mut runs = lock_runs(&self.runs);
        let mut job = self.repo.find_by_id(job_id)?;
        if job.is_finished() {
            return Ok(job.state());
        }

        // Only a running job has an entry; its run settles it.
        if let Some(requested) = runs.get_mut(job_id) {
            *requested = true;
        }
        job.cancel();
        self.persist(&job)?;
        drop(runs);

        self.record(|s| s.cancelled += 1);
        info!(runner = %self.name, job_id = %job_id, "job cancelled");
        self.release(job_id);

        Ok(job.state())
    }

    fn persist(&self, job: &Job) -> Result<(), RunnerError> {
        self.repo.save(job)?;
        self.bus.publish(&job.id(), job.state())?;
        Ok(())
    }

    fn release(&self, job_id: &JobId) {
        if self.release_on_finish {
            self.bus.unsubscribe(job_id);
        }
    }

    fn record(&self, update: impl FnOnce(&mut RunnerStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl<R, B> JobRunner<R, B>
where
    R: JobRepository + 'static,
    B: KeyedBus<JobId, State> + 'static,
{
    /// Run a job on a background thread.
    pub fn spawn(self: &Arc<Self>, job_id: JobId) -> thread::JoinHandle<Result<State, RunnerError>> {
        let runner = Arc::clone(self);
        thread::spawn(move || runner.execute(&job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::{InMemoryJobRepository, JobFilter};
    use anyhow::Context;
    use cms_core::{ProjectId, UserId};
    use cms_events::JobPubSub;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    type TestRunner = JobRunner<Arc<InMemoryJobRepository>, Arc<JobPubSub>>;

    fn setup(cache: usize) -> (Arc<InMemoryJobRepository>, Arc<JobPubSub>, TestRunner) {
        let repo = InMemoryJobRepository::arc();
        let bus = Arc::new(JobPubSub::new(cache));
        let runner = JobRunner::new("test", repo.clone(), bus.clone());
        (repo, bus, runner)
    }

    fn pending_job(repo: &InMemoryJobRepository) -> Job {
        let job = Job::builder()
            .new_id()
            .job_type(JobType::Import)
            .project(ProjectId::new())
            .user(UserId::new())
            .build()
            .unwrap();
        repo.save(&job).unwrap();
        job
    }

    #[test]
    fn execute_successful_job() {
        let (repo, bus, mut runner) = setup(10);
        runner.register_handler(JobType::Import, |_job, progress| {
            progress.report(1, 2)?;
            progress.report(2, 2)?;
            Ok(b"ok".to_vec())
        });

        let job = pending_job(&repo);
        let state = runner.execute(&job.id()).unwrap();
        assert_eq!(state.status(), Status::Completed);

        let stored = repo.find_by_id(&job.id()).unwrap();
        assert_eq!(stored.result(), Some(&b"ok"[..]));
        assert!(stored.started_at().is_some());
        assert!(stored.completed_at().is_some());

        let seen: Vec<State> = bus.subscribe(&job.id()).unwrap().try_iter().collect();
        assert_eq!(
            seen,
            vec![
                State::from(Status::InProgress),
                State::in_progress(1, 2),
                State::in_progress(2, 2),
                State::from(Status::Completed),
            ]
        );
        assert_eq!(runner.stats(), RunnerStats { executed: 1, completed: 1, ..Default::default() });
    }

    #[test]
    fn handler_error_fails_the_job_with_its_context() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, _progress| {
            Err(anyhow::anyhow!("unexpected column")).context("row 7")
        });

        let job = pending_job(&repo);
        let state = runner.execute(&job.id()).unwrap();

        assert_eq!(state.status(), Status::Failed);
        assert_eq!(state.error(), Some("row 7: unexpected column"));
        assert_eq!(runner.stats().failed, 1);
    }

    #[test]
    fn missing_handler_fails_the_job() {
        let (repo, _bus, runner) = setup(0);
        let job = pending_job(&repo);

        let state = runner.execute(&job.id()).unwrap();
        assert_eq!(state.status(), Status::Failed);
        assert!(state.error().unwrap().contains("no handler"));
    }

    #[test]
    fn finished_jobs_are_not_rerun() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, _progress| panic!("must not run"));

        let mut job = pending_job(&repo);
        job.complete(Vec::new());
        repo.save(&job).unwrap();

        assert_eq!(runner.execute(&job.id()).unwrap().status(), Status::Completed);
        assert_eq!(runner.cancel(&job.id()).unwrap().status(), Status::Completed);
        assert_eq!(runner.stats().executed, 0);
    }

    #[test]
    fn unknown_job_is_a_store_error() {
        let (_repo, _bus, runner) = setup(0);
        let id = JobId::new();
        assert_eq!(
            runner.execute(&id),
            Err(RunnerError::Store(StoreError::NotFound(id)))
        );
    }

    #[test]
    fn cancel_while_running_wins() {
        let (repo, _bus, mut runner) = setup(0);
        let repo_in_handler = repo.clone();
        runner.register_handler(JobType::Import, move |job, progress| {
            let mut cancelled = repo_in_handler.find_by_id(&job.id())?;
            cancelled.cancel();
            repo_in_handler.save(&cancelled)?;
            assert!(progress.is_cancelled());
            assert!(matches!(progress.report(1, 1), Err(RunnerError::Cancelled(_))));
            Ok(Vec::new())
        });

        let job = pending_job(&repo);
        let state = runner.execute(&job.id()).unwrap();
        assert_eq!(state.status(), Status::Cancelled);
        assert_eq!(repo.find_by_id(&job.id()).unwrap().status(), Status::Cancelled);
    }

    #[test]
    fn cancel_publishes_and_releases() {
        let (repo, bus, runner) = setup(5);
        let runner = runner.with_release_on_finish(true);
        let job = pending_job(&repo);
        let sub = bus.subscribe(&job.id()).unwrap();

        let state = runner.cancel(&job.id()).unwrap();
        assert_eq!(state.status(), Status::Cancelled);

        assert_eq!(sub.recv().unwrap().status(), Status::Cancelled);
        assert!(sub.recv().is_err());
        assert!(!bus.has_publisher(&job.id()));
    }

    #[test]
    fn spawned_jobs_run_in_parallel() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, progress| {
            progress.report(1, 1)?;
            Ok(Vec::new())
        });
        let runner = Arc::new(runner);

        let jobs: Vec<Job> = (0..8).map(|_| pending_job(&repo)).collect();
        let handles: Vec<_> = jobs.iter().map(|j| runner.spawn(j.id())).collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap().status(), Status::Completed);
        }
        assert_eq!(runner.stats().completed, 8);
    }

    /// Cancels the job in the store right after the first lookup returns.
    struct CancelAfterFirstRead {
        inner: InMemoryJobRepository,
        armed: AtomicBool,
    }

    impl JobRepository for CancelAfterFirstRead {
        fn find_by_id(&self, job_id: &JobId) -> Result<Job, StoreError> {
            let job = self.inner.find_by_id(job_id)?;
            if self.armed.swap(false, Ordering::SeqCst) {
                let mut cancelled = job.clone();
                cancelled.cancel();
                self.inner.save(&cancelled)?;
            }
            Ok(job)
        }

        fn find_by_project(&self, project_id: &ProjectId, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
            self.inner.find_by_project(project_id, filter)
        }

        fn save(&self, job: &Job) -> Result<(), StoreError> {
            self.inner.save(job)
        }
    }

    #[test]
    fn cancel_of_a_pending_job_racing_execute_is_kept() {
        let repo = Arc::new(CancelAfterFirstRead {
            inner: InMemoryJobRepository::new(),
            armed: AtomicBool::new(false),
        });
        let bus = Arc::new(JobPubSub::new(0));
        let mut runner = JobRunner::new("test", repo.clone(), bus);
        runner.register_handler(JobType::Import, |_job, _progress| panic!("must not run"));

        let job = pending_job(&repo.inner);
        repo.armed.store(true, Ordering::SeqCst);

        let state = runner.execute(&job.id()).unwrap();
        assert_eq!(state.status(), Status::Cancelled);
        assert_eq!(repo.find_by_id(&job.id()).unwrap().status(), Status::Cancelled);
        assert_eq!(runner.stats().executed, 0);
        assert_eq!(runner.running(), 0);
    }

    #[test]
    fn cancel_after_the_run_settled_leaves_nothing_behind() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, _progress| Ok(Vec::new()));

        let job = pending_job(&repo);
        runner.execute(&job.id()).unwrap();

        assert_eq!(runner.cancel(&job.id()).unwrap().status(), Status::Completed);
        assert_eq!(runner.running(), 0);
        assert_eq!(runner.stats().cancelled, 0);
    }

    #[test]
    fn cancel_during_the_run_is_settled_and_cleared() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, progress| {
            let started = Instant::now();
            while !progress.is_cancelled() {
                if started.elapsed() > Duration::from_secs(5) {
                    anyhow::bail!("never cancelled");
                }
                thread::sleep(Duration::from_millis(1));
            }
            Ok(Vec::new())
        });
        let runner = Arc::new(runner);

        let job = pending_job(&repo);
        let handle = runner.spawn(job.id());
        while runner.running() == 0 {
            thread::yield_now();
        }
        assert_eq!(runner.cancel(&job.id()).unwrap().status(), Status::Cancelled);

        assert_eq!(handle.join().unwrap().unwrap().status(), Status::Cancelled);
        assert_eq!(repo.find_by_id(&job.id()).unwrap().status(), Status::Cancelled);
        assert_eq!(runner.running(), 0);
    }

    #[test]
    fn panicking_handler_is_unregistered() {
        let (repo, _bus, mut runner) = setup(0);
        runner.register_handler(JobType::Import, |_job, _progress| panic!("handler bug"));
        let runner = Arc::new(runner);

        let job = pending_job(&repo);
        assert!(runner.spawn(job.id()).join().is_err());
        assert_eq!(runner.running(), 0);
    }
}
