//! Job submission and retry.

use crate::error::{PipelineError, Result};
use crate::item::Item;
use crate::queue::WorkQueue;
use crate::state_machine::{Job, JobConfig, JobId, JobStatus};
use crate::store::JobStore;

/// Persists a new pending job, then enqueues it.
pub async fn submit_job(
    store: &dyn JobStore,
    queue: &dyn WorkQueue,
    input: Vec<Item>,
    config: JobConfig,
) -> Result<Job> {
    let job = Job::new(input, config);
    store.insert_job(job.clone()).await?;
    queue.enqueue(job.id).await?;
    tracing::info!(job = %job.id, items = job.input.len(), "job submitted");
    Ok(job)
}

/// Starts a fresh job from a failed or cancelled one. The original is left as is.
pub async fn retry_job(store: &dyn JobStore, queue: &dyn WorkQueue, job_id: JobId) -> Result<Job> {
    let original = store.load_job(job_id).await?;
    if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
        return Err(PipelineError::NotRetryable {
            job_id,
            status: original.status,
        });
    }

    let job = original.retry();
    store.insert_job(job.clone()).await?;
    queue.enqueue(job.id).await?;
    tracing::info!(job = %job.id, retry_of = %job_id, "job resubmitted");
    Ok(job)
}
