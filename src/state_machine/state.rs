use chrono::Utc;

use super::job::{Job, JobStatus};
use crate::error::{PipelineError, Result};

/// A requested change to a job's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Claimed by a worker: `Pending -> Running`, or a reclaimed job resuming.
    Start { stage: String },
    /// A stage finished; record where the job stands.
    Advance {
        stage: String,
        progress: u8,
        cost: f64,
    },
    Complete { cost: f64 },
    Fail { error: String },
    Cancel,
}

impl Transition {
    fn target(&self) -> JobStatus {
        match self {
            Transition::Start { .. } | Transition::Advance { .. } => JobStatus::Running,
            Transition::Complete { .. } => JobStatus::Completed,
            Transition::Fail { .. } => JobStatus::Failed,
            Transition::Cancel => JobStatus::Cancelled,
        }
    }
}

/// Applies transitions to a `Job`, refusing illegal edges.
///
/// Progress is clamped so it never decreases and cost only accumulates.
pub struct StateMachine;

impl StateMachine {
    pub fn apply(job: &mut Job, transition: Transition) -> Result<()> {
        let to = transition.target();
        if !job.status.can_transition_to(to) {
            return Err(PipelineError::InvalidTransition {
                job_id: job.id,
                from: job.status,
                to,
            });
        }

        let now = Utc::now();
        match transition {
            Transition::Start { stage } => {
                if job.started_at.is_none() {
                    job.started_at = Some(now);
                }
                // A resumed job keeps the stage it had reached.
                if job.stage.is_none() {
                    job.stage = Some(stage);
                }
            }
            Transition::Advance {
                stage,
                progress,
                cost,
            } => {
                job.stage = Some(stage);
                job.progress = job.progress.max(progress.min(100));
                job.cost_total += cost.max(0.0);
            }
            Transition::Complete { cost } => {
                job.progress = 100;
                job.cost_total += cost.max(0.0);
                job.completed_at = Some(now);
            }
            Transition::Fail { error } => {
                job.error = Some(error);
                job.completed_at = Some(now);
            }
            Transition::Cancel => {
                job.completed_at = Some(now);
            }
        }

        job.status = to;
        job.updated_at = now;
        Ok(())
    }
}
