//! Persistent job store seam.
//!
//! The orchestrator only writes [`JobFields`]; the cancellation flag is owned
//! by whoever requests the cancel, so field writes never clobber it.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{PipelineError, Result};
use crate::state_machine::{Job, JobFields, JobId};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: Job) -> Result<()>;

    async fn load_job(&self, id: JobId) -> Result<Job>;

    async fn save_job_fields(&self, id: JobId, fields: &JobFields) -> Result<()>;

    async fn request_cancel(&self, id: JobId) -> Result<()>;

    async fn cancel_requested(&self, id: JobId) -> Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: Job) -> Result<()> {
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(PipelineError::JobNotFound(id))
    }

    async fn save_job_fields(&self, id: JobId, fields: &JobFields) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(PipelineError::JobNotFound(id))?;
        fields.apply_to(job);
        Ok(())
    }

    async fn request_cancel(&self, id: JobId) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or(PipelineError::JobNotFound(id))?;
        job.cancel_requested = true;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn cancel_requested(&self, id: JobId) -> Result<bool> {
        Ok(self.load_job(id).await?.cancel_requested)
    }
}
