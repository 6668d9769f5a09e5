mod job;
mod state;

pub use job::{AuditRecord, Job, JobConfig, JobFields, JobId, JobStatus};
pub use state::{StateMachine, Transition};
