//! Claims queued jobs under a lease and hands them to the orchestrator.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{PipelineError, Result};
use crate::orchestrator::{Orchestrator, RunOutcome};
use crate::queue::{JobLease, LeaseStore, WorkQueue};
use crate::state_machine::JobId;
use crate::store::JobStore;

pub struct Dispatcher {
    worker_id: String,
    queue: Arc<dyn WorkQueue>,
    leases: Arc<dyn LeaseStore>,
    store: Arc<dyn JobStore>,
    orchestrator: Arc<Orchestrator>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn WorkQueue>,
        leases: Arc<dyn LeaseStore>,
        store: Arc<dyn JobStore>,
        orchestrator: Arc<Orchestrator>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_id: config.worker_id.clone(),
            queue,
            leases,
            store,
            orchestrator,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Cancelling this token stops claiming new jobs. A job already running
    /// finishes its current stage and goes back on the queue.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Claim loop. Returns once shutdown is requested.
    pub async fn run(&self) {
        tracing::info!(worker = %self.worker_id, "dispatcher started");
        let mut last_sweep: Option<Instant> = None;

        while !self.shutdown.is_cancelled() {
            if last_sweep.is_none_or(|at| at.elapsed() >= self.config.housekeeping_interval()) {
                if let Err(err) = self.reclaim_expired().await {
                    tracing::warn!(worker = %self.worker_id, error = %err, "lease sweep failed");
                }
                last_sweep = Some(Instant::now());
            }

            let claimed = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                claimed = self.queue.dequeue(self.config.dequeue_timeout()) => claimed,
            };

            match claimed {
                Ok(Some(job_id)) => {
                    if let Err(err) = self.dispatch(job_id).await {
                        tracing::error!(worker = %self.worker_id, job = %job_id, error = %err, "job run aborted");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(worker = %self.worker_id, error = %err, "dequeue failed");
                    tokio::time::sleep(self.config.dequeue_timeout()).await;
                }
            }
        }
        tracing::info!(worker = %self.worker_id, "dispatcher stopped");
    }

    /// One sweep, one claim attempt. `None` when nothing was run.
    pub async fn run_once(&self) -> Result<Option<RunOutcome>> {
        self.reclaim_expired().await?;
        match self.queue.dequeue(self.config.dequeue_timeout()).await? {
            Some(job_id) => self.dispatch(job_id).await,
            None => Ok(None),
        }
    }

    /// Re-enqueues non-terminal jobs whose owner stopped renewing its lease.
    pub async fn reclaim_expired(&self) -> Result<usize> {
        let mut requeued = 0;
        for lease in self.leases.take_expired().await? {
            match self.store.load_job(lease.job_id).await {
                Ok(job) if !job.status.is_terminal() => {
                    tracing::warn!(
                        worker = %self.worker_id,
                        job = %lease.job_id,
                        previous_owner = %lease.owner,
                        "lease expired, re-enqueueing job"
                    );
                    self.queue.enqueue(lease.job_id).await?;
                    requeued += 1;
                }
                Ok(_) | Err(PipelineError::JobNotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(requeued)
    }

    /// Runs one claimed job under a lease.
    pub async fn dispatch(&self, job_id: JobId) -> Result<Option<RunOutcome>> {
        let Some(lease) = self
            .leases
            .acquire(job_id, &self.worker_id, self.config.lease_ttl())
            .await?
        else {
            tracing::debug!(worker = %self.worker_id, job = %job_id, "job leased by another worker, skipping");
            return Ok(None);
        };

        let job = match self.store.load_job(job_id).await {
            Ok(job) => job,
            Err(err) => {
                self.leases.release(&lease).await?;
                return Err(err);
            }
        };
        if job.status.is_terminal() {
            tracing::debug!(worker = %self.worker_id, job = %job_id, status = %job.status, "skipping finished job");
            self.leases.release(&lease).await?;
            return Ok(None);
        }

        tracing::info!(worker = %self.worker_id, job = %job_id, "job claimed");
        match self.run_leased(job_id, lease.clone()).await {
            Ok(outcome) => {
                self.leases.release(&lease).await?;
                if outcome == RunOutcome::Suspended {
                    self.queue.enqueue(job_id).await?;
                    tracing::info!(worker = %self.worker_id, job = %job_id, "job handed back to the queue");
                }
                Ok(Some(outcome))
            }
            Err(PipelineError::LeaseLost(id)) => {
                tracing::warn!(worker = %self.worker_id, job = %id, "lease lost, dropping run");
                Err(PipelineError::LeaseLost(id))
            }
            Err(err) => {
                self.leases.release(&lease).await?;
                if let Err(fail_err) = self.orchestrator.abandon(job_id, &err).await {
                    tracing::error!(worker = %self.worker_id, job = %job_id, error = %fail_err, "could not record aborted run");
                }
                Err(err)
            }
        }
    }

    /// Drives the orchestrator and renews the lease from the same task, so a
    /// worker that dies stops renewing.
    async fn run_leased(&self, job_id: JobId, mut lease: JobLease) -> Result<RunOutcome> {
        let run = self.orchestrator.run(job_id, &self.shutdown);
        tokio::pin!(run);

        let period = self.config.heartbeat_interval().max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = heartbeat.tick() => {
                    lease = self.leases.renew(&lease, self.config.lease_ttl()).await?;
                    tracing::debug!(
                        worker = %self.worker_id,
                        job = %job_id,
                        renewals = lease.renewals,
                        expires_at = %lease.expires_at,
                        "lease renewed"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ItemError, StageError};
    use crate::item::Item;
    use crate::ledger::{ItemOutcome, Ledger, LedgerEntry, MemoryLedger};
    use crate::progress::{ProgressBus, ProgressPublisher, StreamMessage};
    use futures::StreamExt;
    use crate::queue::{MemoryLeases, MemoryQueue};
    use crate::stage::{ItemOutput, Stage, StageContext, StageOutcome, StageRegistry};
    use crate::state_machine::{Job, JobConfig, JobStatus};
    use crate::store::MemoryJobStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Passes items through after a delay, logging `stage:item` per attempt.
    struct Sleepy {
        name: &'static str,
        delay: Duration,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Stage for Sleepy {
        fn name(&self) -> &str {
            self.name
        }

        fn validate(&self, _input: &[Item]) -> bool {
            true
        }

        async fn process(
            &self,
            input: Vec<Item>,
            ctx: &StageContext,
        ) -> std::result::Result<StageOutcome, StageError> {
            ctx.run_items(input, |item| {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", self.name, item.id));
                let delay = self.delay;
                async move {
                    tokio::time::sleep(delay).await;
                    Ok::<_, ItemError>(ItemOutput::from(item))
                }
            })
            .await
        }
    }

    /// Ledger whose backing disk is gone.
    struct UnwritableLedger;

    #[async_trait]
    impl Ledger for UnwritableLedger {
        async fn record(&self, _entry: LedgerEntry) -> Result<()> {
            Err(PipelineError::Io(std::io::Error::other("disk full")))
        }

        async fn entries(&self, _job_id: JobId, _stage: &str) -> Result<Vec<LedgerEntry>> {
            Ok(Vec::new())
        }

        async fn stages(&self, _job_id: JobId) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    struct World {
        queue: Arc<MemoryQueue>,
        leases: Arc<MemoryLeases>,
        store: Arc<MemoryJobStore>,
        ledger: Arc<MemoryLedger>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl World {
        fn new() -> Self {
            Self {
                queue: Arc::new(MemoryQueue::new()),
                leases: Arc::new(MemoryLeases::new()),
                store: Arc::new(MemoryJobStore::new()),
                ledger: Arc::new(MemoryLedger::new()),
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn dispatcher(&self, worker: &str, delay: Duration) -> Dispatcher {
            let registry = StageRegistry::builder()
                .stage(Sleepy {
                    name: "ingest",
                    delay,
                    log: self.log.clone(),
                })
                .stage(Sleepy {
                    name: "chunk",
                    delay: Duration::ZERO,
                    log: self.log.clone(),
                })
                .build()
                .unwrap();
            let orchestrator = Orchestrator::new(
                registry,
                self.store.clone(),
                self.ledger.clone(),
                Arc::new(ProgressBus::new(16, Duration::from_secs(5))),
            );
            let config = WorkerConfig {
                worker_id: worker.to_string(),
                lease_ttl_secs: 1,
                heartbeat_interval_ms: 50,
                dequeue_timeout_ms: 50,
                housekeeping_interval_ms: 0,
                ..Default::default()
            };
            Dispatcher::new(
                self.queue.clone(),
                self.leases.clone(),
                self.store.clone(),
                Arc::new(orchestrator),
                config,
            )
        }

        async fn submit(&self, items: usize) -> JobId {
            let input = (0..items)
                .map(|i| Item::new(format!("i{i}"), json!({"n": i})))
                .collect();
            let config = JobConfig {
                defaults: crate::config::StageSettings {
                    max_concurrent: 2,
                    retry_attempts: 0,
                    base_delay_ms: 1,
                    ..Default::default()
                },
                ..Default::default()
            };
            let job = Job::new(input, config);
            let id = job.id;
            self.store.insert_job(job).await.unwrap();
            self.queue.enqueue(id).await.unwrap();
            id
        }

        fn logged(&self, stage: &str) -> Vec<String> {
            let prefix = format!("{stage}:");
            self.log
                .lock()
                .unwrap()
                .iter()
                .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
                .collect()
        }

        async fn settled(&self, job_id: JobId, stage: &str) -> HashSet<String> {
            self.ledger
                .load(job_id, stage)
                .await
                .unwrap()
                .into_values()
                .filter(|entry| entry.outcome == ItemOutcome::Success)
                .map(|entry| entry.item_id)
                .collect()
        }
    }

    #[tokio::test]
    async fn runs_queued_job_and_releases_lease() {
        let world = World::new();
        let dispatcher = world.dispatcher("w1", Duration::ZERO);
        let job_id = world.submit(4).await;

        let outcome = dispatcher.run_once().await.unwrap();

        assert_eq!(outcome, Some(RunOutcome::Completed));
        assert!(world.leases.holder(job_id).is_none());
        assert_eq!(world.logged("chunk").len(), 4);
        assert_eq!(world.queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn skips_job_leased_elsewhere() {
        let world = World::new();
        let dispatcher = world.dispatcher("w1", Duration::ZERO);
        let job_id = world.submit(1).await;
        world
            .leases
            .acquire(job_id, "w2", Duration::from_secs(30))
            .await
            .unwrap();

        assert_eq!(dispatcher.run_once().await.unwrap(), None);
        assert!(world.logged("ingest").is_empty());
        assert_eq!(world.leases.holder(job_id).unwrap().owner, "w2");
    }

    #[tokio::test]
    async fn skips_finished_job() {
        let world = World::new();
        let dispatcher = world.dispatcher("w1", Duration::ZERO);
        let job_id = world.submit(1).await;
        assert_eq!(
            dispatcher.run_once().await.unwrap(),
            Some(RunOutcome::Completed)
        );

        // Duplicate delivery of a finished job.
        world.queue.enqueue(job_id).await.unwrap();
        assert_eq!(dispatcher.run_once().await.unwrap(), None);
        assert_eq!(world.logged("ingest").len(), 1);
    }

    #[tokio::test]
    async fn crashed_worker_is_reclaimed_without_redoing_settled_items() {
        let world = World::new();
        let first = Arc::new(world.dispatcher("w1", Duration::from_millis(20)));
        let job_id = world.submit(10).await;

        let handle = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.run_once().await })
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        while world.settled(job_id, "ingest").await.len() < 4 {
            assert!(Instant::now() < deadline, "first worker made no progress");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Crash: the task dies mid-stage and stops renewing its lease.
        handle.abort();
        let _ = handle.await;
        let settled_before = world.settled(job_id, "ingest").await;
        let attempted_before = world.logged("ingest").len();
        assert!(settled_before.len() < 10);

        let second = world.dispatcher("w2", Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(1300)).await;
        let outcome = second.run_once().await.unwrap();
        assert_eq!(outcome, Some(RunOutcome::Completed));

        let redone = &world.logged("ingest")[attempted_before..];
        assert!(
            redone.iter().all(|id| !settled_before.contains(id)),
            "settled items were re-processed: {redone:?}"
        );
        assert_eq!(world.settled(job_id, "ingest").await.len(), 10);
        assert_eq!(world.logged("chunk").len(), 10);

        let job = world.store.load_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(world.leases.holder(job_id).is_none());
    }

    #[tokio::test]
    async fn graceful_shutdown_hands_job_back() {
        let world = World::new();
        let dispatcher = Arc::new(world.dispatcher("w1", Duration::from_millis(10)));
        let job_id = world.submit(6).await;
        let token = dispatcher.shutdown_token();

        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run().await })
        };
        while world.logged("ingest").is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        token.cancel();
        handle.await.unwrap();

        // The running stage finished; the next one never started.
        assert_eq!(world.settled(job_id, "ingest").await.len(), 6);
        assert!(world.logged("chunk").is_empty());
        assert_eq!(world.queue.depth().await.unwrap(), 1);
        assert!(world.leases.holder(job_id).is_none());
        let job = world.store.load_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);

        let successor = world.dispatcher("w2", Duration::ZERO);
        assert_eq!(
            successor.run_once().await.unwrap(),
            Some(RunOutcome::Completed)
        );
        assert_eq!(world.logged("ingest").len(), 6);
    }

    #[tokio::test]
    async fn infrastructure_error_fails_job_and_ends_progress_stream() {
        let world = World::new();
        let bus = Arc::new(ProgressBus::new(16, Duration::from_secs(5)));
        let registry = StageRegistry::builder()
            .stage(Sleepy {
                name: "ingest",
                delay: Duration::ZERO,
                log: world.log.clone(),
            })
            .build()
            .unwrap();
        let orchestrator = Orchestrator::new(
            registry,
            world.store.clone(),
            Arc::new(UnwritableLedger),
            bus.clone(),
        );
        let dispatcher = Dispatcher::new(
            world.queue.clone(),
            world.leases.clone(),
            world.store.clone(),
            Arc::new(orchestrator),
            WorkerConfig {
                worker_id: "w1".into(),
                dequeue_timeout_ms: 50,
                ..Default::default()
            },
        );
        let job_id = world.submit(2).await;
        let stream = bus.subscribe(job_id);

        let result = dispatcher.run_once().await;
        assert!(matches!(result, Err(PipelineError::Io(_))), "{result:?}");
        assert!(world.leases.holder(job_id).is_none());

        let job = world.store.load_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.as_deref().unwrap().contains("disk full"));

        // A follower does not hang on a job nobody will finish.
        let events: Vec<_> = tokio::time::timeout(Duration::from_secs(2), stream.collect::<Vec<_>>())
            .await
            .expect("progress stream never ended");
        match events.last() {
            Some(StreamMessage::Event(event)) => assert_eq!(event.status, JobStatus::Failed),
            other => panic!("expected a terminal event, got {other:?}"),
        }
        assert_eq!(bus.live_jobs(), 0);
    }

    #[tokio::test]
    async fn abandoning_an_unknown_job_still_publishes() {
        let world = World::new();
        let bus = Arc::new(ProgressBus::new(16, Duration::from_secs(5)));
        let orchestrator = Orchestrator::new(
            StageRegistry::builder()
                .stage(Sleepy {
                    name: "ingest",
                    delay: Duration::ZERO,
                    log: world.log.clone(),
                })
                .build()
                .unwrap(),
            world.store.clone(),
            world.ledger.clone(),
            bus.clone(),
        );
        let job_id = JobId::new();
        let mut stream = bus.subscribe(job_id);

        let reason = PipelineError::Io(std::io::Error::other("store offline"));
        assert!(orchestrator.abandon(job_id, &reason).await.is_err());
        match stream.next().await {
            Some(StreamMessage::Event(event)) => {
                assert_eq!(event.status, JobStatus::Failed);
                assert!(event.message.unwrap().contains("store offline"));
            }
            other => panic!("expected a terminal event, got {other:?}"),
        }
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn lost_lease_drops_the_run() {
        let world = World::new();
        let dispatcher = Arc::new(world.dispatcher("w1", Duration::from_millis(30)));
        let job_id = world.submit(10).await;

        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move { dispatcher.run_once().await })
        };
        let held = loop {
            if let Some(lease) = world.leases.holder(job_id) {
                break lease;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        };

        // Another worker takes the job over.
        world.leases.release(&held).await.unwrap();
        world
            .leases
            .acquire(job_id, "thief", Duration::from_secs(30))
            .await
            .unwrap();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(PipelineError::LeaseLost(id)) if id == job_id));
        assert_eq!(world.leases.holder(job_id).unwrap().owner, "thief");
        assert!(world.logged("chunk").is_empty());
    }
}
