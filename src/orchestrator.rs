use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result, StageError};
use crate::item::Item;
use crate::ledger::{ItemOutcome, Ledger, LedgerEntry};
use crate::progress::{ProgressEvent, ProgressPublisher};
use crate::stage::{ItemFailure, StageContext, StageOutcome, StageRegistry};
use crate::state_machine::{AuditRecord, Job, JobId, JobStatus, StateMachine, Transition};
use crate::store::JobStore;

/// How a single run of a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Failed(String),
    Cancelled,
    /// Stopped at a stage boundary because the worker is shutting down.
    /// The job is still `Running` and must be handed to another worker.
    Suspended,
}

/// Drives one job through the registered stages.
pub struct Orchestrator {
    registry: StageRegistry,
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn Ledger>,
    publisher: Arc<dyn ProgressPublisher>,
}

impl Orchestrator {
    pub fn new(
        registry: StageRegistry,
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn Ledger>,
        publisher: Arc<dyn ProgressPublisher>,
    ) -> Self {
        Self {
            registry,
            store,
            ledger,
            publisher,
        }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Run a claimed job to a terminal state, or until `shutdown` fires.
    ///
    /// A job that is already `Running` was reclaimed from a dead worker; stages
    /// whose items are all settled in the ledger are replayed instead of re-run.
    pub async fn run(&self, job_id: JobId, shutdown: &CancellationToken) -> Result<RunOutcome> {
        let mut job = self.store.load_job(job_id).await?;
        let resumed = job.started_at.is_some();

        StateMachine::apply(
            &mut job,
            Transition::Start {
                stage: self.registry.first_name().to_string(),
            },
        )?;
        self.persist(&job).await?;
        tracing::info!(job = %job_id, resumed, items = job.input.len(), "job started");

        let total = self.registry.len();
        let mut items = job.input.clone();
        let mut stage_cost = 0.0;

        for (index, stage) in self.registry.iter().enumerate() {
            if self.store.cancel_requested(job_id).await? {
                return self.finish(&mut job, Transition::Cancel).await;
            }
            if shutdown.is_cancelled() {
                tracing::info!(job = %job_id, stage = stage.name(), "worker shutting down, suspending job");
                return Ok(RunOutcome::Suspended);
            }

            let name = stage.name();
            let settings = job.config.settings_for(name);
            let latest = self.ledger.load(job_id, name).await?;
            let replayed = is_settled(&items, &latest);

            let outcome = if replayed {
                tracing::info!(job = %job_id, stage = name, "stage already settled, replaying ledger");
                replay(&items, latest)
            } else {
                if !stage.validate(&items) {
                    let error = format!("stage {name} rejected its input");
                    return self.finish(&mut job, Transition::Fail { error }).await;
                }

                let ctx = StageContext::new(
                    job_id,
                    name,
                    settings.clone(),
                    job.config.params_for(name),
                    Arc::clone(&self.ledger),
                    Arc::clone(&self.store),
                    latest,
                );
                tracing::info!(job = %job_id, stage = name, items = items.len(), "stage started");

                let outcome = match stage.process(items.clone(), &ctx).await {
                    Ok(outcome) => outcome,
                    Err(StageError::Fatal { stage, message }) => {
                        let error = format!("stage {stage}: {message}");
                        return self.finish(&mut job, Transition::Fail { error }).await;
                    }
                    Err(StageError::Pipeline(err)) => return Err(err),
                };

                if ctx.is_cancelled() {
                    return self.finish(&mut job, Transition::Cancel).await;
                }
                ctx.settle(&items, &outcome).await?;
                outcome
            };

            let input_ids: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();
            let ratio = outcome.failure_ratio(&input_ids);
            tracing::info!(
                job = %job_id,
                stage = name,
                survivors = outcome.items.len(),
                failed = outcome.failures.len(),
                retries = outcome.stats.retries,
                cost = outcome.stats.cost,
                elapsed_ms = outcome.stats.elapsed_ms,
                "stage finished"
            );

            if ratio > settings.abort_threshold {
                let error = format!(
                    "stage {name} failed {:.0}% of {} items, above the {:.0}% abort threshold",
                    ratio * 100.0,
                    input_ids.len(),
                    settings.abort_threshold * 100.0
                );
                return self.finish(&mut job, Transition::Fail { error }).await;
            }

            items = outcome.items;
            stage_cost = outcome.stats.cost;

            if let Some(next) = self.registry.iter().nth(index + 1) {
                let progress = (100 * (index + 1) / total) as u8;
                // Replayed stages only move the job forward, never back.
                if replayed && progress <= job.progress {
                    continue;
                }
                StateMachine::apply(
                    &mut job,
                    Transition::Advance {
                        stage: next.name().to_string(),
                        progress,
                        cost: stage_cost,
                    },
                )?;
                stage_cost = 0.0;
                self.persist(&job).await?;
            }
        }

        self.finish(&mut job, Transition::Complete { cost: stage_cost })
            .await
    }

    /// Fails a job whose run broke off on an infrastructure error.
    ///
    /// Subscribers always get a terminal event, even when the store cannot
    /// record the failure.
    pub async fn abandon(&self, job_id: JobId, reason: &PipelineError) -> Result<()> {
        let error = format!("run aborted: {reason}");
        let recorded = async {
            let mut job = self.store.load_job(job_id).await?;
            StateMachine::apply(
                &mut job,
                Transition::Fail {
                    error: error.clone(),
                },
            )?;
            self.store.save_job_fields(job_id, &job.fields()).await?;
            Ok::<_, PipelineError>(job)
        }
        .await;

        let (event, result) = match recorded {
            Ok(job) => (ProgressEvent::from_job(&job, None), Ok(())),
            Err(err) => (
                ProgressEvent {
                    job_id,
                    stage: None,
                    progress: 0,
                    status: JobStatus::Failed,
                    message: Some(error.clone()),
                    timestamp: Utc::now(),
                },
                Err(err),
            ),
        };
        tracing::error!(job = %job_id, %error, "job abandoned");
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(job = %job_id, error = %err, "progress publish failed");
        }
        result
    }

    async fn finish(&self, job: &mut Job, transition: Transition) -> Result<RunOutcome> {
        StateMachine::apply(job, transition)?;
        self.persist(job).await?;

        let audit = AuditRecord::from_job(job);
        let outcome = match job.status {
            JobStatus::Completed => RunOutcome::Completed,
            JobStatus::Cancelled => RunOutcome::Cancelled,
            _ => RunOutcome::Failed(job.error.clone().unwrap_or_default()),
        };
        match &outcome {
            RunOutcome::Failed(error) => {
                tracing::warn!(job = %job.id, stage = ?job.stage, %error, "job failed")
            }
            _ => tracing::info!(
                job = %job.id,
                status = %audit.status,
                cost = audit.cost_total,
                duration_ms = ?audit.duration_ms,
                "job finished"
            ),
        }
        Ok(outcome)
    }

    /// Writes the job's fields, then publishes. Publication is best-effort.
    async fn persist(&self, job: &Job) -> Result<()> {
        self.store.save_job_fields(job.id, &job.fields()).await?;
        if let Err(err) = self.publisher.publish(ProgressEvent::from_job(job, None)).await {
            tracing::warn!(job = %job.id, error = %err, "progress publish failed");
        }
        Ok(())
    }
}

fn is_settled(items: &[Item], latest: &HashMap<String, LedgerEntry>) -> bool {
    !latest.is_empty()
        && items.iter().all(|item| {
            latest
                .get(&item.id)
                .is_some_and(|entry| entry.outcome.is_terminal())
        })
}

/// Rebuilds a stage outcome from the ledger alone.
fn replay(items: &[Item], mut latest: HashMap<String, LedgerEntry>) -> StageOutcome {
    let mut outcome = StageOutcome::default();
    outcome.stats.input = items.len();

    for item in items {
        let Some(entry) = latest.remove(&item.id) else {
            continue;
        };
        outcome.stats.resumed += 1;
        match entry.outcome {
            ItemOutcome::Success => {
                outcome.stats.succeeded += 1;
                outcome.stats.cost += entry.cost;
                outcome.items.extend(entry.outputs);
            }
            ItemOutcome::Failed => {
                outcome.stats.failed += 1;
                outcome.failures.push(ItemFailure::from_entry(&entry));
            }
            ItemOutcome::Retried => {}
        }
    }

    // Outputs recorded under their own id by batch stages.
    let mut orphans: Vec<LedgerEntry> = latest
        .into_values()
        .filter(|entry| entry.outcome == ItemOutcome::Success)
        .collect();
    orphans.sort_by_key(|entry| entry.recorded_at);
    for entry in orphans {
        outcome.stats.cost += entry.cost;
        outcome.items.extend(entry.outputs);
    }
    outcome
}
