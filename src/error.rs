use thiserror::Error;

use crate::state_machine::{JobId, JobStatus};

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Illegal job transition {from} -> {to} for job {job_id}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Stage registered twice: {0}")]
    DuplicateStage(String),

    #[error("Stage registry is empty")]
    EmptyRegistry,

    #[error("Concurrency governor for stage '{0}' is closed")]
    GovernorClosed(String),

    #[error("Lease on job {0} is held by another worker")]
    LeaseLost(JobId),

    #[error("Job {job_id} is {status} and cannot be retried")]
    NotRetryable { job_id: JobId, status: JobStatus },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Classifies an item failure for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, rate-limit rejection, dropped connection. Worth another attempt.
    Transient,
    /// Malformed input, schema violation. Retrying cannot help.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Permanent => write!(f, "Permanent"),
        }
    }
}

/// Error produced while processing a single item inside a stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("transient: {0}")]
    Transient(String),

    #[error("permanent: {0}")]
    Permanent(String),
}

impl ItemError {
    pub fn transient(msg: impl Into<String>) -> Self {
        ItemError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        ItemError::Permanent(msg.into())
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            ItemError::Transient(_) => FailureKind::Transient,
            ItemError::Permanent(_) => FailureKind::Permanent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            ItemError::Transient(msg) | ItemError::Permanent(msg) => msg,
        }
    }
}

/// Error that stops a stage from producing any output at all.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("stage '{stage}' failed: {message}")]
    Fatal { stage: String, message: String },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl StageError {
    pub fn fatal(stage: impl Into<String>, message: impl Into<String>) -> Self {
        StageError::Fatal {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_display() {
        assert_eq!(FailureKind::Transient.to_string(), "Transient");
        assert_eq!(FailureKind::Permanent.to_string(), "Permanent");
    }

    #[test]
    fn item_error_classification() {
        let err = ItemError::transient("upstream timed out");
        assert_eq!(err.kind(), FailureKind::Transient);
        assert_eq!(err.message(), "upstream timed out");
        assert_eq!(err.to_string(), "transient: upstream timed out");

        let err = ItemError::permanent("schema violation");
        assert_eq!(err.kind(), FailureKind::Permanent);
    }

    #[test]
    fn fatal_stage_error_display() {
        let err = StageError::fatal("generate", "missing model name");
        assert_eq!(err.to_string(), "stage 'generate' failed: missing model name");
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<PipelineError>();
        assert_send_sync::<StageError>();
    }
}
