//! Configuration loaded from `datafactory.toml`.
//!
//! [`FactoryConfig`] holds every tunable of the worker. Keys missing from the
//! file fall back to defaults; `DATAFACTORY_*` environment variables take
//! precedence over the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "datafactory.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// JSON-lines ledger file. In-memory ledger when absent.
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,

    #[serde(default)]
    pub worker: WorkerConfig,

    /// Defaults applied to every stage.
    #[serde(default)]
    pub stages: StageSettings,

    /// Per-stage overrides keyed by stage name, layered over `stages`.
    #[serde(default, rename = "stage")]
    pub stage_overrides: HashMap<String, StageOverride>,
}

/// Dispatcher and lease timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

/// Limits and retry policy for one stage invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Maximum items in flight at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Minimum spacing between operations on the same partition key.
    #[serde(default)]
    pub rate_interval_ms: Option<u64>,
    /// Extra attempts granted to transient item failures.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Failure ratio above which the whole job fails.
    #[serde(default = "default_abort_threshold")]
    pub abort_threshold: f64,
    /// Base delay for exponential backoff between item attempts.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_worker_id() -> String {
    format!("worker-{}", std::process::id())
}

fn default_lease_ttl_secs() -> u64 {
    30
}

fn default_heartbeat_interval_ms() -> u64 {
    10_000
}

fn default_dequeue_timeout_ms() -> u64 {
    5_000
}

fn default_keepalive_interval_secs() -> u64 {
    15
}

fn default_housekeeping_interval_ms() -> u64 {
    5_000
}

fn default_max_concurrent() -> usize {
    3
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_abort_threshold() -> f64 {
    0.5
}

fn default_base_delay_ms() -> u64 {
    500
}

/// A `[stage.<name>]` section. Unset keys inherit from `[stages]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_interval_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_delay_ms: Option<u64>,
}

impl StageOverride {
    pub fn apply_to(&self, base: &StageSettings) -> StageSettings {
        StageSettings {
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            rate_interval_ms: self.rate_interval_ms.or(base.rate_interval_ms),
            retry_attempts: self.retry_attempts.unwrap_or(base.retry_attempts),
            abort_threshold: self.abort_threshold.unwrap_or(base.abort_threshold),
            base_delay_ms: self.base_delay_ms.unwrap_or(base.base_delay_ms),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            lease_ttl_secs: default_lease_ttl_secs(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_interval_ms: None,
            retry_attempts: default_retry_attempts(),
            abort_threshold: default_abort_threshold(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl StageSettings {
    /// Backoff before the given retry: `base_delay_ms * 2^(attempt - 1)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }

    pub fn rate_interval(&self) -> Option<Duration> {
        self.rate_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    fn validate(&self, scope: &str) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(PipelineError::Config(format!(
                "{scope}: max_concurrent must be at least 1"
            )));
        }
        if !(0.0..=1.0).contains(&self.abort_threshold) {
            return Err(PipelineError::Config(format!(
                "{scope}: abort_threshold must be within [0, 1], got {}",
                self.abort_threshold
            )));
        }
        Ok(())
    }
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ledger_path: None,
            worker: WorkerConfig::default(),
            stages: StageSettings::default(),
            stage_overrides: HashMap::new(),
        }
    }
}

impl FactoryConfig {
    /// Loads `datafactory.toml` from the working directory, or defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Loads the given file when it exists, then applies the environment.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<FactoryConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment beats the file. `lookup` is injectable for tests.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(level) = get("DATAFACTORY_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(path) = get("DATAFACTORY_LEDGER_PATH") {
            self.ledger_path = Some(PathBuf::from(path));
        }
        if let Some(v) = get("DATAFACTORY_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.stages.max_concurrent = v;
        }
        if let Some(v) = get("DATAFACTORY_RETRY_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.stages.retry_attempts = v;
        }
        if let Some(v) = get("DATAFACTORY_ABORT_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.stages.abort_threshold = v;
        }
        if let Some(v) = get("DATAFACTORY_LEASE_TTL_SECS").and_then(|v| v.parse().ok()) {
            self.worker.lease_ttl_secs = v;
        }
        if let Some(v) = get("DATAFACTORY_HEARTBEAT_MS").and_then(|v| v.parse().ok()) {
            self.worker.heartbeat_interval_ms = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.stages.validate("stages")?;
        for name in self.stage_overrides.keys() {
            self.stage_settings(name)
                .validate(&format!("stage.{name}"))?;
        }
        if self.worker.heartbeat_interval() >= self.worker.lease_ttl() {
            return Err(PipelineError::Config(format!(
                "worker: heartbeat_interval_ms ({}) must be shorter than lease_ttl_secs ({}s)",
                self.worker.heartbeat_interval_ms, self.worker.lease_ttl_secs
            )));
        }
        Ok(())
    }

    /// Settings for the named stage: its override layered over the defaults,
    /// environment included.
    pub fn stage_settings(&self, stage: &str) -> StageSettings {
        match self.stage_overrides.get(stage) {
            Some(overrides) => overrides.apply_to(&self.stages),
            None => self.stages.clone(),
        }
    }

    /// Every overridden stage, fully resolved.
    pub fn resolved_overrides(&self) -> HashMap<String, StageSettings> {
        self.stage_overrides
            .keys()
            .map(|name| (name.clone(), self.stage_settings(name)))
            .collect()
    }
}
