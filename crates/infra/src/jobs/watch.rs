//! Waiting for a job to finish over the bus, reconciled with the store.

use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use tracing::debug;

use cms_core::JobId;
use cms_events::{KeyedBus, PubSubError, Subscription};
use cms_job::State;

use super::store::{JobRepository, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error("job {job_id} still {last} after {timeout:?}")]
    Timeout {
        job_id: JobId,
        last: cms_job::Status,
        timeout: Duration,
    },
}

/// Block until `job_id` reaches a finished state or `timeout` elapses.
///
/// Live states come from the bus. Because delivery is lossy, a timeout or a
/// closed subscription is settled against the repository, which is
/// authoritative. The watcher's own subscription is released on return;
/// other observers of the job are untouched.
pub fn wait_for_finish<B, R>(
    bus: &B,
    repo: &R,
    job_id: &JobId,
    timeout: Duration,
) -> Result<State, WatchError>
where
    B: KeyedBus<JobId, State> + ?Sized,
    R: JobRepository + ?Sized,
{
    let subscription = bus.subscribe(job_id)?;
    let outcome = watch(&subscription, repo, job_id, timeout);
    bus.release(job_id, subscription);
    outcome
}

fn watch<R>(
    subscription: &Subscription<State>,
    repo: &R,
    job_id: &JobId,
    timeout: Duration,
) -> Result<State, WatchError>
where
    R: JobRepository + ?Sized,
{
    // The job may have finished before we subscribed.
    let stored = repo.find_by_id(job_id)?;
    if stored.is_finished() {
        return Ok(stored.state());
    }

    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match subscription.recv_timeout(remaining) {
            Ok(state) if state.is_finished() => return Ok(state),
            Ok(state) => {
                debug!(job_id = %job_id, status = %state.status(), "job update");
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stored = repo.find_by_id(job_id)?;
    if stored.is_finished() {
        return Ok(stored.state());
    }
    Err(WatchError::Timeout {
        job_id: *job_id,
        last: stored.status(),
        timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobRepository;
    use cms_core::ProjectId;
    use cms_events::JobPubSub;
    use cms_job::{Job, JobType, Status};
    use std::sync::Arc;
    use std::thread;

    fn saved_job(repo: &InMemoryJobRepository) -> Job {
        let job = Job::builder()
            .new_id()
            .job_type(JobType::Import)
            .project(ProjectId::new())
            .integration(cms_core::IntegrationId::new())
            .build()
            .unwrap();
        repo.save(&job).unwrap();
        job
    }

    #[test]
    fn returns_the_published_final_state() {
        let repo = InMemoryJobRepository::arc();
        let bus = Arc::new(JobPubSub::new(0));
        let mut job = saved_job(&repo);
        let id = job.id();

        let producer = {
            let (repo, bus) = (repo.clone(), bus.clone());
            thread::spawn(move || {
                // Wait for the watcher before publishing.
                while bus.subscriber_count(&id) == 0 {
                    thread::yield_now();
                }
                job.start();
                bus.publish_job(&job).unwrap();
                job.fail("quota exceeded");
                repo.save(&job).unwrap();
                bus.publish_job(&job).unwrap();
            })
        };

        let state = wait_for_finish(&bus, &repo, &id, Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(state.status(), Status::Failed);
        assert_eq!(state.error(), Some("quota exceeded"));
    }

    #[test]
    fn already_finished_job_returns_immediately() {
        let repo = InMemoryJobRepository::new();
        let bus = JobPubSub::new(0);
        let mut job = saved_job(&repo);
        job.complete(Vec::new());
        repo.save(&job).unwrap();

        let state = wait_for_finish(&bus, &repo, &job.id(), Duration::ZERO).unwrap();
        assert_eq!(state.status(), Status::Completed);
    }

    #[test]
    fn missed_broadcast_is_recovered_from_the_store() {
        let repo = InMemoryJobRepository::arc();
        let bus = Arc::new(JobPubSub::new(0));
        let mut job = saved_job(&repo);
        let id = job.id();

        let producer = {
            let (repo, bus) = (repo.clone(), bus.clone());
            thread::spawn(move || {
                while bus.subscriber_count(&id) == 0 {
                    thread::yield_now();
                }
                // Persisted, then the observers are released without a publish.
                job.complete(b"{}".to_vec());
                repo.save(&job).unwrap();
                bus.unsubscribe(&id);
            })
        };

        let state = wait_for_finish(&bus, &repo, &id, Duration::from_secs(5)).unwrap();
        producer.join().unwrap();
        assert_eq!(state.status(), Status::Completed);
    }

    #[test]
    fn unfinished_job_times_out() {
        let repo = InMemoryJobRepository::new();
        let bus = JobPubSub::new(0);
        let job = saved_job(&repo);

        let err = wait_for_finish(&bus, &repo, &job.id(), Duration::from_millis(20)).unwrap_err();
        assert_eq!(
            err,
            WatchError::Timeout {
                job_id: job.id(),
                last: Status::Pending,
                timeout: Duration::from_millis(20),
            }
        );
    }

    #[test]
    fn watching_finished_jobs_leaves_no_topics_behind() {
        let repo = InMemoryJobRepository::new();
        let bus = JobPubSub::new(0);
        for _ in 0..100 {
            let mut job = saved_job(&repo);
            job.complete(Vec::new());
            repo.save(&job).unwrap();
            wait_for_finish(&bus, &repo, &job.id(), Duration::ZERO).unwrap();
        }
        assert_eq!(bus.topic_count(), 0);
    }

    #[test]
    fn watcher_releases_only_its_own_subscription() {
        let repo = InMemoryJobRepository::new();
        let bus = JobPubSub::new(3);
        let job = saved_job(&repo);
        let observer = bus.subscribe(&job.id()).unwrap();

        wait_for_finish(&bus, &repo, &job.id(), Duration::from_millis(10)).unwrap_err();
        assert_eq!(bus.subscriber_count(&job.id()), 1);

        bus.publish_job(&job).unwrap();
        assert_eq!(observer.try_recv().unwrap().status(), Status::Pending);
    }
}
