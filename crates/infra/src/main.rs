//! Runs a simulated import job and streams its progress to a watcher thread.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use cms_core::{ProjectId, UserId};
use cms_infra::JobsConfig;
use cms_infra::jobs::{InMemoryJobRepository, JobRepository, JobRunner};
use cms_job::{ImportFormat, ImportPayload, ImportResult, Job, JobType};

const ROWS: u64 = 20;

fn main() -> anyhow::Result<()> {
    cms_observability::init();

    let config = JobsConfig::from_env().context("loading job configuration")?;
    let repo = InMemoryJobRepository::arc();
    let bus = Arc::new(config.build_pubsub());

    let mut runner = JobRunner::new(config.runner_name.clone(), repo.clone(), bus.clone())
        .with_release_on_finish(true);
    runner.register_handler(JobType::Import, |job, progress| {
        let payload = job.import_payload().context("decoding import payload")?;
        info!(model = %payload.model_id, asset = %payload.asset_id, "importing");

        let mut result = ImportResult { total: ROWS, ..Default::default() };
        for row in 1..=ROWS {
            thread::sleep(Duration::from_millis(25));
            if row % 7 == 0 {
                result.ignored += 1;
            } else {
                result.inserted += 1;
            }
            progress.report(row, ROWS)?;
        }
        Ok(result.encode()?)
    });
    let runner = Arc::new(runner);

    let payload = ImportPayload::new("demo-model", "demo-asset", ImportFormat::Csv);
    let job = Job::builder()
        .new_id()
        .job_type(JobType::Import)
        .project(ProjectId::new())
        .user(UserId::new())
        .payload(payload.encode()?)
        .build()?;
    repo.save(&job)?;

    let subscription = bus.subscribe(&job.id())?;
    let watcher = thread::spawn(move || {
        // Ends when the runner releases the job's observers.
        for state in subscription {
            match state.progress() {
                Some(p) => info!(status = %state.status(), percent = p.percentage(), "progress"),
                None => info!(status = %state.status(), error = ?state.error(), "state"),
            }
        }
    });

    let state = runner
        .spawn(job.id())
        .join()
        .map_err(|_| anyhow::anyhow!("runner thread panicked"))??;
    watcher
        .join()
        .map_err(|_| anyhow::anyhow!("watcher thread panicked"))?;

    let stored = repo.find_by_id(&job.id())?;
    let result = stored.import_result()?.unwrap_or_default();
    info!(
        job_id = %job.id(),
        status = %state.status(),
        inserted = result.inserted,
        ignored = result.ignored,
        stats = ?runner.stats(),
        "done"
    );

    Ok(())
}
