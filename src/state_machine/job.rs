use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{FactoryConfig, StageSettings};
use crate::item::Item;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(JobId)
    }
}

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Legal edges of the job state machine. `Running -> Running` is a stage
    /// advance (or a resumed job re-entering its run).
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-job stage configuration, seeded from [`FactoryConfig`] at admission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default)]
    pub defaults: StageSettings,
    #[serde(default)]
    pub stages: HashMap<String, StageSettings>,
    /// Opaque, stage-owned parameters keyed by stage name.
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

impl JobConfig {
    pub fn from_factory(config: &FactoryConfig) -> Self {
        Self {
            defaults: config.stages.clone(),
            stages: config.resolved_overrides(),
            params: HashMap::new(),
        }
    }

    pub fn settings_for(&self, stage: &str) -> StageSettings {
        self.stages
            .get(stage)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    pub fn params_for(&self, stage: &str) -> Value {
        self.params.get(stage).cloned().unwrap_or(Value::Null)
    }

    pub fn with_params(mut self, stage: impl Into<String>, params: Value) -> Self {
        self.params.insert(stage.into(), params);
        self
    }

    pub fn with_stage(mut self, stage: impl Into<String>, settings: StageSettings) -> Self {
        self.stages.insert(stage.into(), settings);
        self
    }
}

/// One run of the pipeline over a fixed input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
    pub cost_total: f64,
    pub input: Vec<Item>,
    pub config: JobConfig,
    /// Set when this job retries an earlier failed or cancelled one.
    pub retry_of: Option<JobId>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(input: Vec<Item>, config: JobConfig) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            status: JobStatus::Pending,
            stage: None,
            progress: 0,
            error: None,
            cost_total: 0.0,
            input,
            config,
            retry_of: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    /// A fresh pending job re-seeded with this job's input and config.
    pub fn retry(&self) -> Self {
        let mut job = Job::new(self.input.clone(), self.config.clone());
        job.retry_of = Some(self.id);
        job
    }

    pub fn fields(&self) -> JobFields {
        JobFields {
            status: self.status,
            stage: self.stage.clone(),
            progress: self.progress,
            error: self.error.clone(),
            cost_total: self.cost_total,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// The subset of a job the owning orchestrator writes back to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobFields {
    pub status: JobStatus,
    pub stage: Option<String>,
    pub progress: u8,
    pub error: Option<String>,
    pub cost_total: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobFields {
    pub fn apply_to(&self, job: &mut Job) {
        job.status = self.status;
        job.stage = self.stage.clone();
        job.progress = self.progress;
        job.error = self.error.clone();
        job.cost_total = self.cost_total;
        job.started_at = self.started_at;
        job.completed_at = self.completed_at;
        job.updated_at = Utc::now();
    }
}

/// Structured record produced when a job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    pub last_stage: Option<String>,
    pub progress: u8,
    pub cost_total: f64,
    pub error: Option<String>,
    pub retry_of: Option<JobId>,
    pub input_items: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl AuditRecord {
    pub fn from_job(job: &Job) -> Self {
        let duration_ms = match (job.started_at, job.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        Self {
            job_id: job.id,
            status: job.status,
            last_stage: job.stage.clone(),
            progress: job.progress,
            cost_total: job.cost_total,
            error: job.error.clone(),
            retry_of: job.retry_of,
            input_items: job.input.len(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            duration_ms,
        }
    }
}
