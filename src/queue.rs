//! Work queue and lease seams consumed by the dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::state_machine::JobId;

/// FIFO of job ids. No acknowledgement protocol: a job claimed by a worker
/// that dies comes back through lease expiry.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, job_id: JobId) -> Result<()>;

    /// Blocking pop; `None` once `timeout` passes with nothing to claim.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>>;

    async fn depth(&self) -> Result<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<JobId>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pop(&self) -> Option<JobId> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn enqueue(&self, job_id: JobId) -> Result<()> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job_id);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobId>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job_id) = self.pop() {
                return Ok(Some(job_id));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.pop());
            }
        }
    }

    async fn depth(&self) -> Result<usize> {
        Ok(self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub Uuid);

impl LeaseId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseId {
    fn default() -> Self {
        Self::new()
    }
}

/// Time-bounded claim of one worker on one job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobLease {
    pub lease_id: LeaseId,
    pub job_id: JobId,
    pub owner: String,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl JobLease {
    pub fn new(job_id: JobId, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            lease_id: LeaseId::new(),
            job_id,
            owner: owner.into(),
            expires_at: Utc::now() + chrono_ttl(ttl),
            renewals: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn chrono_ttl(ttl: Duration) -> chrono::Duration {
    chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(365))
}

#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claims the job unless another live lease exists.
    async fn acquire(&self, job_id: JobId, owner: &str, ttl: Duration)
    -> Result<Option<JobLease>>;

    /// Extends a lease still held by its owner; `LeaseLost` otherwise.
    async fn renew(&self, lease: &JobLease, ttl: Duration) -> Result<JobLease>;

    /// Gives the claim up. Releasing a lease that was already taken over is a no-op.
    async fn release(&self, lease: &JobLease) -> Result<()>;

    /// Removes and returns every expired lease.
    async fn take_expired(&self) -> Result<Vec<JobLease>>;
}

#[derive(Debug, Default)]
pub struct MemoryLeases {
    leases: Mutex<HashMap<JobId, JobLease>>,
}

impl MemoryLeases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn holder(&self, job_id: JobId) -> Option<JobLease> {
        self.leases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeases {
    async fn acquire(
        &self,
        job_id: JobId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<JobLease>> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = leases.get(&job_id)
            && !current.is_expired(Utc::now())
        {
            return Ok(None);
        }
        let lease = JobLease::new(job_id, owner, ttl);
        leases.insert(job_id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &JobLease, ttl: Duration) -> Result<JobLease> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        match leases.get_mut(&lease.job_id) {
            Some(current) if current.lease_id == lease.lease_id => {
                current.expires_at = Utc::now() + chrono_ttl(ttl);
                current.renewals += 1;
                Ok(current.clone())
            }
            _ => Err(PipelineError::LeaseLost(lease.job_id)),
        }
    }

    async fn release(&self, lease: &JobLease) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases
            .get(&lease.job_id)
            .is_some_and(|current| current.lease_id == lease.lease_id)
        {
            leases.remove(&lease.job_id);
        }
        Ok(())
    }

    async fn take_expired(&self) -> Result<Vec<JobLease>> {
        let now = Utc::now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<JobId> = leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .map(|lease| lease.job_id)
            .collect();
        Ok(expired
            .into_iter()
            .filter_map(|job_id| leases.remove(&job_id))
            .collect())
    }
}
