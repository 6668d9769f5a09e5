//! Partial-result ledger: an append-only log of per-item outcomes.
//!
//! Entries are keyed by (job, stage, item) and never rewritten; the latest
//! entry for an item is its current truth. A reclaimed job consults the
//! ledger to skip items that already succeeded.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::{FailureKind, ItemError, Result};
use crate::item::Item;
use crate::state_machine::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    Success,
    Failed,
    Retried,
}

impl ItemOutcome {
    /// Success and failure settle an item; a retry does not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ItemOutcome::Retried)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub stage: String,
    pub item_id: String,
    pub outcome: ItemOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    pub attempts: u32,
    /// Items produced by a successful item, replayed on resume.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Item>,
    /// Spend of a successful item, carried into the job total on resume.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub cost: f64,
    pub recorded_at: DateTime<Utc>,
}

fn is_zero(cost: &f64) -> bool {
    *cost == 0.0
}

impl LedgerEntry {
    pub fn success(
        job_id: JobId,
        stage: impl Into<String>,
        item_id: impl Into<String>,
        attempts: u32,
        outputs: Vec<Item>,
    ) -> Self {
        Self {
            job_id,
            stage: stage.into(),
            item_id: item_id.into(),
            outcome: ItemOutcome::Success,
            error: None,
            error_kind: None,
            attempts,
            outputs,
            cost: 0.0,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn failed(
        job_id: JobId,
        stage: impl Into<String>,
        item_id: impl Into<String>,
        attempts: u32,
        error: &ItemError,
    ) -> Self {
        Self::with_error(job_id, stage, item_id, ItemOutcome::Failed, attempts, error)
    }

    pub fn retried(
        job_id: JobId,
        stage: impl Into<String>,
        item_id: impl Into<String>,
        attempts: u32,
        error: &ItemError,
    ) -> Self {
        Self::with_error(job_id, stage, item_id, ItemOutcome::Retried, attempts, error)
    }

    fn with_error(
        job_id: JobId,
        stage: impl Into<String>,
        item_id: impl Into<String>,
        outcome: ItemOutcome,
        attempts: u32,
        error: &ItemError,
    ) -> Self {
        Self {
            job_id,
            stage: stage.into(),
            item_id: item_id.into(),
            outcome,
            error: Some(error.message().to_string()),
            error_kind: Some(error.kind()),
            attempts,
            outputs: Vec::new(),
            cost: 0.0,
            recorded_at: Utc::now(),
        }
    }
}

/// Aggregate counts over the latest outcome of every item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub success: usize,
    pub failed: usize,
    pub retried: usize,
}

impl LedgerSummary {
    pub fn total(&self) -> usize {
        self.success + self.failed + self.retried
    }

    fn from_latest<'a>(entries: impl IntoIterator<Item = &'a LedgerEntry>) -> Self {
        let mut summary = LedgerSummary::default();
        for entry in entries {
            match entry.outcome {
                ItemOutcome::Success => summary.success += 1,
                ItemOutcome::Failed => summary.failed += 1,
                ItemOutcome::Retried => summary.retried += 1,
            }
        }
        summary
    }
}

impl fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "success={} failed={} retried={}",
            self.success, self.failed, self.retried
        )
    }
}

/// Durable per-item outcome store. Appends must be safe from many concurrent
/// item tasks of one stage.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record(&self, entry: LedgerEntry) -> Result<()>;

    /// Full history for one stage of one job, in append order.
    async fn entries(&self, job_id: JobId, stage: &str) -> Result<Vec<LedgerEntry>>;

    /// Stage names that hold entries for the job, in first-seen order.
    async fn stages(&self, job_id: JobId) -> Result<Vec<String>>;

    /// Latest entry per item.
    async fn load(&self, job_id: JobId, stage: &str) -> Result<HashMap<String, LedgerEntry>> {
        let mut latest = HashMap::new();
        for entry in self.entries(job_id, stage).await? {
            latest.insert(entry.item_id.clone(), entry);
        }
        Ok(latest)
    }

    async fn summary(&self, job_id: JobId, stage: &str) -> Result<LedgerSummary> {
        let latest = self.load(job_id, stage).await?;
        Ok(LedgerSummary::from_latest(latest.values()))
    }
}

/// Ledger held in process memory.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record(&self, entry: LedgerEntry) -> Result<()> {
        self.entries.write().await.push(entry);
        Ok(())
    }

    async fn entries(&self, job_id: JobId, stage: &str) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .entries
            .read()
            .await
            .iter()
            .filter(|e| e.job_id == job_id && e.stage == stage)
            .cloned()
            .collect())
    }

    async fn stages(&self, job_id: JobId) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let mut stages: Vec<String> = Vec::new();
        for entry in entries.iter().filter(|e| e.job_id == job_id) {
            if !stages.contains(&entry.stage) {
                stages.push(entry.stage.clone());
            }
        }
        Ok(stages)
    }
}

/// Ledger persisted as one JSON object per line.
///
/// The file is replayed into memory on open; appends go to the file first.
pub struct JsonlLedger {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    mirror: MemoryLedger,
}

impl fmt::Debug for JsonlLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonlLedger")
            .field("path", &self.path)
            .finish()
    }
}

impl JsonlLedger {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (entries, torn) = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_lines(&path, &contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (Vec::new(), false),
            Err(err) => return Err(err.into()),
        };
        if torn {
            // Rewrite without the fragment so the next append starts on a clean line.
            let mut clean = Vec::new();
            for entry in &entries {
                serde_json::to_writer(&mut clean, entry)?;
                clean.push(b'\n');
            }
            tokio::fs::write(&path, clean).await?;
        }
        tracing::debug!(path = %path.display(), entries = entries.len(), "ledger opened");

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            mirror: MemoryLedger::with_entries(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_lines(path: &Path, contents: &str) -> Result<(Vec<LedgerEntry>, bool)> {
    let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut entries = Vec::with_capacity(lines.len());
    let mut torn = false;
    for (idx, line) in lines.iter().enumerate() {
        match serde_json::from_str::<LedgerEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A crash mid-append can leave a torn final line.
            Err(err) if idx + 1 == lines.len() => {
                tracing::warn!(path = %path.display(), error = %err, "dropping torn ledger tail");
                torn = true;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok((entries, torn))
}

#[async_trait]
impl Ledger for JsonlLedger {
    async fn record(&self, entry: LedgerEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        self.mirror.record(entry).await
    }

    async fn entries(&self, job_id: JobId, stage: &str) -> Result<Vec<LedgerEntry>> {
        self.mirror.entries(job_id, stage).await
    }

    async fn stages(&self, job_id: JobId) -> Result<Vec<String>> {
        self.mirror.stages(job_id).await
    }
}
