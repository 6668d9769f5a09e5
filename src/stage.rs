//! The uniform stage contract and the per-invocation execution context.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::StageSettings;
use crate::error::{FailureKind, ItemError, PipelineError, Result, StageError};
use crate::governor::ConcurrencyGovernor;
use crate::item::Item;
use crate::ledger::{ItemOutcome, Ledger, LedgerEntry};
use crate::state_machine::JobId;
use crate::store::JobStore;

/// One processing step of the pipeline.
///
/// Stages hold no state between invocations; everything durable lives in the
/// ledger and the job record.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Cheap precondition on the input. `false` fails the job without retry.
    fn validate(&self, input: &[Item]) -> bool;

    async fn process(
        &self,
        input: Vec<Item>,
        ctx: &StageContext,
    ) -> std::result::Result<StageOutcome, StageError>;
}

/// A permanently failed item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub item_id: String,
    pub kind: FailureKind,
    pub error: String,
    pub attempts: u32,
}

impl ItemFailure {
    pub fn new(item_id: impl Into<String>, error: &ItemError, attempts: u32) -> Self {
        Self {
            item_id: item_id.into(),
            kind: error.kind(),
            error: error.message().to_string(),
            attempts,
        }
    }

    pub(crate) fn from_entry(entry: &LedgerEntry) -> Self {
        Self {
            item_id: entry.item_id.clone(),
            kind: entry.error_kind.unwrap_or(FailureKind::Permanent),
            error: entry.error.clone().unwrap_or_default(),
            attempts: entry.attempts,
        }
    }

    fn as_item_error(&self) -> ItemError {
        match self.kind {
            FailureKind::Transient => ItemError::Transient(self.error.clone()),
            FailureKind::Permanent => ItemError::Permanent(self.error.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub input: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Retry attempts made, not items.
    pub retries: usize,
    /// Items settled by an earlier run of this job.
    pub resumed: usize,
    pub cost: f64,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// What a stage hands back: survivors, failures and statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub items: Vec<Item>,
    pub failures: Vec<ItemFailure>,
    pub stats: StageStats,
}

impl StageOutcome {
    /// Share of `input_ids` that failed. Empty input never fails.
    pub fn failure_ratio(&self, input_ids: &HashSet<&str>) -> f64 {
        if input_ids.is_empty() {
            return 0.0;
        }
        let failed: HashSet<&str> = self
            .failures
            .iter()
            .map(|f| f.item_id.as_str())
            .filter(|id| input_ids.contains(id))
            .collect();
        failed.len() as f64 / input_ids.len() as f64
    }

    pub fn with_stat(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.stats.extra.insert(key.to_string(), value.into());
        self
    }
}

/// Result of processing one item successfully.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemOutput {
    pub items: Vec<Item>,
    pub cost: f64,
}

impl ItemOutput {
    pub fn with_cost(items: Vec<Item>, cost: f64) -> Self {
        Self { items, cost }
    }
}

impl From<Vec<Item>> for ItemOutput {
    fn from(items: Vec<Item>) -> Self {
        Self { items, cost: 0.0 }
    }
}

impl From<Item> for ItemOutput {
    fn from(item: Item) -> Self {
        Self {
            items: vec![item],
            cost: 0.0,
        }
    }
}

enum ItemResult {
    Success {
        outputs: Vec<Item>,
        cost: f64,
        retries: u32,
    },
    /// Failure plus the retries this run made for it.
    Failed(ItemFailure, u32),
}

/// Everything a stage invocation may use besides its input.
///
/// Built by the orchestrator for one stage of one job and dropped when the
/// stage completes, taking its governor with it.
pub struct StageContext {
    job_id: JobId,
    stage: String,
    settings: StageSettings,
    params: Value,
    governor: ConcurrencyGovernor,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn JobStore>,
    resume: HashMap<String, LedgerEntry>,
    recorded: Mutex<Recorded>,
    cancelled: AtomicBool,
}

#[derive(Default)]
struct Recorded {
    items: HashSet<String>,
    outputs: HashSet<String>,
    cost: f64,
}

impl fmt::Debug for StageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageContext")
            .field("job_id", &self.job_id)
            .field("stage", &self.stage)
            .field("settings", &self.settings)
            .field("governor", &self.governor)
            .field("resumable", &self.resume.len())
            .finish()
    }
}

impl StageContext {
    pub fn new(
        job_id: JobId,
        stage: impl Into<String>,
        settings: StageSettings,
        params: Value,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn JobStore>,
        resume: HashMap<String, LedgerEntry>,
    ) -> Self {
        let stage = stage.into();
        Self {
            governor: ConcurrencyGovernor::from_settings(stage.clone(), &settings),
            job_id,
            stage,
            settings,
            params,
            ledger,
            store,
            resume,
            recorded: Mutex::new(Recorded::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Stage-owned parameters from the job config (`Value::Null` when unset).
    pub fn params(&self) -> &Value {
        &self.params
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    /// True once a cancellation request has been observed.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Polls the job store for a cancellation request.
    pub async fn check_cancelled(&self) -> Result<bool> {
        if self.is_cancelled() {
            return Ok(true);
        }
        let requested = self.store.cancel_requested(self.job_id).await?;
        if requested {
            tracing::info!(job = %self.job_id, stage = %self.stage, "cancellation observed, draining");
            self.cancelled.store(true, Ordering::Release);
        }
        Ok(requested)
    }

    pub async fn run_items<F, Fut>(
        &self,
        items: Vec<Item>,
        handler: F,
    ) -> std::result::Result<StageOutcome, StageError>
    where
        F: Fn(Item) -> Fut,
        Fut: Future<Output = std::result::Result<ItemOutput, ItemError>>,
    {
        self.run_items_keyed(items, |_| None, handler).await
    }

    /// Fans `handler` out over `items` under the stage's governor.
    ///
    /// Items already settled in the ledger are not re-run. Transient failures
    /// are retried with backoff. Every outcome is recorded as it resolves. A
    /// cancellation request stops further dispatch at the next batch boundary;
    /// items already in flight finish and are recorded.
    pub async fn run_items_keyed<K, F, Fut>(
        &self,
        items: Vec<Item>,
        partition: K,
        handler: F,
    ) -> std::result::Result<StageOutcome, StageError>
    where
        K: Fn(&Item) -> Option<String>,
        F: Fn(Item) -> Fut,
        Fut: Future<Output = std::result::Result<ItemOutput, ItemError>>,
    {
        let started = Instant::now();
        let mut outcome = StageOutcome::default();
        outcome.stats.input = items.len();

        let mut pending = Vec::with_capacity(items.len());
        for item in items {
            match self.resume.get(&item.id) {
                Some(entry) if entry.outcome == ItemOutcome::Success => {
                    self.mark_recorded(&item.id, &entry.outputs, entry.cost);
                    outcome.items.extend(entry.outputs.iter().cloned());
                    outcome.stats.succeeded += 1;
                    outcome.stats.resumed += 1;
                    outcome.stats.cost += entry.cost;
                }
                Some(entry) if entry.outcome == ItemOutcome::Failed => {
                    self.mark_recorded(&item.id, &[], 0.0);
                    outcome.failures.push(ItemFailure::from_entry(entry));
                    outcome.stats.failed += 1;
                    outcome.stats.resumed += 1;
                }
                // Interrupted between retries: keep counting from the last attempt.
                Some(entry) => pending.push((item, entry.attempts)),
                None => pending.push((item, 0)),
            }
        }

        let batch = self.governor.max_concurrent();
        let mut queue = pending.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut dispatched = 0usize;
        let mut stopped = false;

        loop {
            while !stopped && in_flight.len() < batch {
                if dispatched % batch == 0 && self.check_cancelled().await? {
                    stopped = true;
                    break;
                }
                match queue.next() {
                    Some((item, attempts)) => {
                        in_flight.push(self.drive_item(item, attempts, &partition, &handler));
                        dispatched += 1;
                    }
                    None => {
                        stopped = true;
                        break;
                    }
                }
            }

            let Some(result) = in_flight.next().await else {
                break;
            };
            match result? {
                ItemResult::Success {
                    outputs,
                    cost,
                    retries,
                } => {
                    outcome.items.extend(outputs);
                    outcome.stats.succeeded += 1;
                    outcome.stats.cost += cost;
                    outcome.stats.retries += retries as usize;
                }
                ItemResult::Failed(failure, retries) => {
                    outcome.failures.push(failure);
                    outcome.stats.failed += 1;
                    outcome.stats.retries += retries as usize;
                }
            }
        }

        outcome.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        Ok(outcome)
    }

    async fn drive_item<K, F, Fut>(
        &self,
        item: Item,
        prior_attempts: u32,
        partition: &K,
        handler: &F,
    ) -> Result<ItemResult>
    where
        K: Fn(&Item) -> Option<String>,
        F: Fn(Item) -> Fut,
        Fut: Future<Output = std::result::Result<ItemOutput, ItemError>>,
    {
        let key = partition(&item);
        let mut attempt = prior_attempts;

        loop {
            attempt += 1;
            let result = {
                let _permit = self.governor.acquire(key.as_deref()).await?;
                handler(item.clone()).await
            };

            match result {
                Ok(output) => {
                    self.record(
                        LedgerEntry::success(
                            self.job_id,
                            &self.stage,
                            &item.id,
                            attempt,
                            output.items.clone(),
                        )
                        .with_cost(output.cost),
                    )
                    .await?;
                    return Ok(ItemResult::Success {
                        outputs: output.items,
                        cost: output.cost,
                        retries: attempt - prior_attempts.max(1),
                    });
                }
                Err(err)
                    if err.kind() == FailureKind::Transient
                        && attempt <= self.settings.retry_attempts =>
                {
                    let delay = self.settings.delay_for_attempt(attempt);
                    tracing::warn!(
                        job = %self.job_id,
                        stage = %self.stage,
                        item = %item.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "item failed, retrying"
                    );
                    self.record(LedgerEntry::retried(
                        self.job_id,
                        &self.stage,
                        &item.id,
                        attempt,
                        &err,
                    ))
                    .await?;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    tracing::warn!(
                        job = %self.job_id,
                        stage = %self.stage,
                        item = %item.id,
                        attempts = attempt,
                        error = %err,
                        "item failed permanently"
                    );
                    self.record(LedgerEntry::failed(
                        self.job_id,
                        &self.stage,
                        &item.id,
                        attempt,
                        &err,
                    ))
                    .await?;
                    return Ok(ItemResult::Failed(
                        ItemFailure::new(&item.id, &err, attempt),
                        attempt - prior_attempts.max(1),
                    ));
                }
            }
        }
    }

    async fn record(&self, entry: LedgerEntry) -> Result<()> {
        if entry.outcome.is_terminal() {
            self.mark_recorded(&entry.item_id, &entry.outputs, entry.cost);
        }
        self.ledger.record(entry).await
    }

    fn mark_recorded(&self, item_id: &str, outputs: &[Item], cost: f64) {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.items.insert(item_id.to_string());
        recorded.cost += cost;
        recorded
            .outputs
            .extend(outputs.iter().map(|o| o.id.clone()));
    }

    /// Records ledger entries for whatever a batch-style stage settled
    /// without going through [`run_items`](Self::run_items).
    ///
    /// Outputs are attached to the input named by their `parent_id`; outputs
    /// with no such parent are recorded under their own id. Stage cost not
    /// yet carried by a ledger entry goes on the first success recorded here.
    pub(crate) async fn settle(&self, input: &[Item], outcome: &StageOutcome) -> Result<()> {
        let (recorded_items, recorded_outputs, recorded_cost) = {
            let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            (
                recorded.items.clone(),
                recorded.outputs.clone(),
                recorded.cost,
            )
        };
        let mut unattributed = (outcome.stats.cost - recorded_cost).max(0.0);

        let mut failed: HashSet<&str> = HashSet::new();
        for failure in &outcome.failures {
            failed.insert(failure.item_id.as_str());
            if !recorded_items.contains(&failure.item_id) {
                self.record(LedgerEntry::failed(
                    self.job_id,
                    &self.stage,
                    &failure.item_id,
                    failure.attempts.max(1),
                    &failure.as_item_error(),
                ))
                .await?;
            }
        }

        let input_ids: HashSet<&str> = input.iter().map(|i| i.id.as_str()).collect();
        let mut by_parent: HashMap<&str, Vec<Item>> = HashMap::new();
        let mut orphans = Vec::new();
        for output in &outcome.items {
            if recorded_outputs.contains(&output.id) {
                continue;
            }
            match output.parent_id.as_deref().filter(|p| input_ids.contains(p)) {
                Some(parent) => by_parent.entry(parent).or_default().push(output.clone()),
                None => orphans.push(output.clone()),
            }
        }

        for item in input {
            if recorded_items.contains(&item.id) || failed.contains(item.id.as_str()) {
                continue;
            }
            let outputs = by_parent.remove(item.id.as_str()).unwrap_or_default();
            self.record(
                LedgerEntry::success(self.job_id, &self.stage, &item.id, 1, outputs)
                    .with_cost(std::mem::take(&mut unattributed)),
            )
            .await?;
        }

        for orphan in orphans {
            self.record(
                LedgerEntry::success(self.job_id, &self.stage, orphan.id.clone(), 1, vec![orphan])
                    .with_cost(std::mem::take(&mut unattributed)),
            )
            .await?;
        }
        Ok(())
    }
}

/// Ordered, fixed list of stages, built once per worker.
#[derive(Clone)]
pub struct StageRegistry {
    stages: Vec<Arc<dyn Stage>>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl StageRegistry {
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder { stages: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn first_name(&self) -> &str {
        self.stages.first().map(|s| s.name()).unwrap_or_default()
    }
}

#[derive(Default)]
pub struct StageRegistryBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageRegistryBuilder {
    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Result<StageRegistry> {
        if self.stages.is_empty() {
            return Err(PipelineError::EmptyRegistry);
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name().to_string()) {
                return Err(PipelineError::DuplicateStage(stage.name().to_string()));
            }
        }
        Ok(StageRegistry {
            stages: self.stages,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::state_machine::{Job, JobConfig};
    use crate::store::MemoryJobStore;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Named(&'static str);

    #[async_trait]
    impl Stage for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn validate(&self, _input: &[Item]) -> bool {
            true
        }

        async fn process(
            &self,
            input: Vec<Item>,
            _ctx: &StageContext,
        ) -> std::result::Result<StageOutcome, StageError> {
            Ok(StageOutcome {
                items: input,
                ..Default::default()
            })
        }
    }

    fn items(n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| Item::new(format!("i{i}"), json!({"n": i})))
            .collect()
    }

    async fn context(
        settings: StageSettings,
        resume: HashMap<String, LedgerEntry>,
    ) -> (StageContext, Arc<MemoryLedger>, Arc<MemoryJobStore>) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryJobStore::new());
        let job = Job::new(Vec::new(), JobConfig::default());
        let job_id = job.id;
        store.insert_job(job).await.unwrap();
        let ctx = StageContext::new(
            job_id,
            "ingest",
            settings,
            Value::Null,
            ledger.clone(),
            store.clone(),
            resume,
        );
        (ctx, ledger, store)
    }

    fn fast_retries(retry_attempts: u32) -> StageSettings {
        StageSettings {
            max_concurrent: 4,
            retry_attempts,
            base_delay_ms: 1,
            ..Default::default()
        }
    }

    #[test]
    fn registry_keeps_order_and_rejects_duplicates() {
        let registry = StageRegistry::builder()
            .stage(Named("ingest"))
            .stage(Named("chunk"))
            .build()
            .unwrap();
        assert_eq!(registry.names(), vec!["ingest", "chunk"]);
        assert_eq!(registry.first_name(), "ingest");

        let err = StageRegistry::builder()
            .stage(Named("ingest"))
            .stage(Named("ingest"))
            .build()
            .unwrap_err();
        assert!(matches!(err, PipelineError::DuplicateStage(name) if name == "ingest"));
        assert!(matches!(
            StageRegistry::builder().build(),
            Err(PipelineError::EmptyRegistry)
        ));
    }

    #[tokio::test]
    async fn transient_errors_retry_then_fail() {
        let (ctx, ledger, _) = context(fast_retries(2), HashMap::new()).await;
        let calls = AtomicU32::new(0);

        let outcome = ctx
            .run_items(items(1), |_item| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<ItemOutput, _>(ItemError::transient("timeout")) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].attempts, 3);
        assert_eq!(outcome.stats.retries, 2);

        let history = ledger.entries(ctx.job_id(), "ingest").await.unwrap();
        let outcomes: Vec<ItemOutcome> = history.iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![ItemOutcome::Retried, ItemOutcome::Retried, ItemOutcome::Failed]
        );
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let (ctx, ledger, _) = context(fast_retries(5), HashMap::new()).await;
        let calls = AtomicU32::new(0);

        let outcome = ctx
            .run_items(items(1), |_item| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<ItemOutput, _>(ItemError::permanent("malformed")) }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failures[0].kind, FailureKind::Permanent);
        assert_eq!(ledger.summary(ctx.job_id(), "ingest").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn transient_then_success() {
        let (ctx, ledger, _) = context(fast_retries(3), HashMap::new()).await;
        let calls = AtomicU32::new(0);

        let outcome = ctx
            .run_items(items(1), |item| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(ItemError::transient("rate limited"))
                    } else {
                        Ok(ItemOutput::with_cost(vec![item.child(0, json!({}))], 0.5))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.items.len(), 1);
        assert_eq!(outcome.stats.cost, 0.5);
        let latest = ledger.load(ctx.job_id(), "ingest").await.unwrap();
        assert_eq!(latest["i0"].outcome, ItemOutcome::Success);
        assert_eq!(latest["i0"].attempts, 2);
        assert_eq!(latest["i0"].outputs.len(), 1);
        assert_eq!(latest["i0"].cost, 0.5);
    }

    #[tokio::test]
    async fn resumed_items_are_not_rerun() {
        let job_probe = JobId::new();
        let mut resume = HashMap::new();
        resume.insert(
            "i0".to_string(),
            LedgerEntry::success(
                job_probe,
                "ingest",
                "i0",
                1,
                vec![Item::new("i0/0", json!({}))],
            )
            .with_cost(0.4),
        );
        resume.insert(
            "i1".to_string(),
            LedgerEntry::failed(job_probe, "ingest", "i1", 1, &ItemError::permanent("bad")),
        );
        let (ctx, _, _) = context(fast_retries(0), resume).await;
        let seen = Mutex::new(Vec::new());

        let outcome = ctx
            .run_items(items(3), |item| {
                seen.lock().unwrap().push(item.id.clone());
                async move { Ok(ItemOutput::from(item)) }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["i2".to_string()]);
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.stats.resumed, 2);
        // Spend from the earlier run still counts toward the stage.
        assert_eq!(outcome.stats.cost, 0.4);
    }

    #[tokio::test]
    async fn resumed_retries_keep_their_attempt_count() {
        let mut resume = HashMap::new();
        resume.insert(
            "i0".to_string(),
            LedgerEntry::retried(JobId::new(), "ingest", "i0", 2, &ItemError::transient("timeout")),
        );
        let (ctx, ledger, _) = context(fast_retries(2), resume).await;
        let calls = AtomicU32::new(0);

        let outcome = ctx
            .run_items(items(1), |_item| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<ItemOutput, _>(ItemError::transient("timeout")) }
            })
            .await
            .unwrap();

        // Two attempts happened before the crash; only the last one is left.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failures[0].attempts, 3);
        assert_eq!(outcome.stats.retries, 1);
        let latest = ledger.load(ctx.job_id(), "ingest").await.unwrap();
        assert_eq!(latest["i0"].outcome, ItemOutcome::Failed);
        assert_eq!(latest["i0"].attempts, 3);
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch_but_drains_in_flight() {
        let settings = StageSettings {
            max_concurrent: 2,
            ..fast_retries(0)
        };
        let (ctx, ledger, store) = context(settings, HashMap::new()).await;
        let job_id = ctx.job_id();
        let started = AtomicU32::new(0);

        let outcome = ctx
            .run_items(items(10), |item| {
                let n = started.fetch_add(1, Ordering::SeqCst);
                let store = store.clone();
                async move {
                    if n == 0 {
                        store.request_cancel(job_id).await.unwrap();
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Ok(ItemOutput::from(item))
                }
            })
            .await
            .unwrap();

        assert!(ctx.is_cancelled());
        // First batch of two was already dispatched; nothing after it.
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.items.len(), 2);
        assert_eq!(ledger.summary(job_id, "ingest").await.unwrap().success, 2);
    }

    #[tokio::test]
    async fn settle_records_batch_stage_results() {
        let (ctx, ledger, _) = context(fast_retries(0), HashMap::new()).await;
        let input = items(3);
        let outcome = StageOutcome {
            items: vec![
                input[0].child("a", json!({})),
                Item::new("export.jsonl", json!({"path": "out/export.jsonl"})),
            ],
            failures: vec![ItemFailure::new("i2", &ItemError::permanent("empty"), 1)],
            stats: StageStats {
                cost: 1.5,
                ..Default::default()
            },
        };

        ctx.settle(&input, &outcome).await.unwrap();

        let latest = ledger.load(ctx.job_id(), "ingest").await.unwrap();
        assert_eq!(latest["i0"].outputs.len(), 1);
        assert_eq!(latest["i0"].cost, 1.5);
        assert_eq!(latest["i1"].cost, 0.0);
        assert_eq!(latest["i1"].outcome, ItemOutcome::Success);
        assert!(latest["i1"].outputs.is_empty());
        assert_eq!(latest["i2"].outcome, ItemOutcome::Failed);
        assert_eq!(latest["export.jsonl"].outputs[0].id, "export.jsonl");
    }

    #[test]
    fn failure_ratio_counts_distinct_inputs() {
        let outcome = StageOutcome {
            failures: vec![
                ItemFailure::new("a", &ItemError::permanent("x"), 1),
                ItemFailure::new("a", &ItemError::permanent("x"), 1),
                ItemFailure::new("zzz", &ItemError::permanent("x"), 1),
            ],
            ..Default::default()
        };
        let ids: HashSet<&str> = ["a", "b", "c", "d"].into_iter().collect();
        assert_eq!(outcome.failure_ratio(&ids), 0.25);
        assert_eq!(outcome.failure_ratio(&HashSet::new()), 0.0);
    }
}
