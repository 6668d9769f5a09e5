//! Bounded fan-out for one stage invocation.
//!
//! Two independent limits: a counting semaphore caps how many operations are
//! in flight, and an optional per-partition gate spaces operations on the same
//! key (source domain, downstream provider) by a minimum interval.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::time::Instant;

use crate::config::StageSettings;
use crate::error::{PipelineError, Result};

pub struct ConcurrencyGovernor {
    stage: String,
    max_concurrent: usize,
    semaphore: Semaphore,
    rate_interval: Option<Duration>,
    // Next instant each partition key may start an operation.
    gates: Mutex<HashMap<String, Instant>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl fmt::Debug for ConcurrencyGovernor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyGovernor")
            .field("stage", &self.stage)
            .field("max_concurrent", &self.max_concurrent)
            .field("rate_interval", &self.rate_interval)
            .field("in_flight", &self.in_flight())
            .field("peak", &self.peak())
            .finish()
    }
}

impl ConcurrencyGovernor {
    pub fn new(
        stage: impl Into<String>,
        max_concurrent: usize,
        rate_interval: Option<Duration>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            stage: stage.into(),
            max_concurrent,
            semaphore: Semaphore::new(max_concurrent),
            rate_interval,
            gates: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn from_settings(stage: impl Into<String>, settings: &StageSettings) -> Self {
        Self::new(stage, settings.max_concurrent, settings.rate_interval())
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously held permits observed so far.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    /// Waits for a parallelism slot, then for the partition's rate gate.
    ///
    /// Capacity returns to the pool when the permit drops, so an early `?` in
    /// the caller cannot leak it.
    pub async fn acquire(&self, partition_key: Option<&str>) -> Result<GovernorPermit<'_>> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| PipelineError::GovernorClosed(self.stage.clone()))?;

        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        let guard = GovernorPermit {
            governor: self,
            _permit: permit,
        };

        if let (Some(interval), Some(key)) = (self.rate_interval, partition_key) {
            let slot = self.reserve_slot(key, interval);
            if slot > Instant::now() {
                tracing::debug!(stage = %self.stage, partition = key, "waiting on rate gate");
                tokio::time::sleep_until(slot).await;
            }
        }

        Ok(guard)
    }

    // Reserves the next start slot for `key` without holding the lock across
    // the sleep.
    fn reserve_slot(&self, key: &str, interval: Duration) -> Instant {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let next = gates.entry(key.to_string()).or_insert(now);
        let slot = (*next).max(now);
        *next = slot + interval;
        slot
    }
}

/// Held while an operation is in flight.
pub struct GovernorPermit<'a> {
    governor: &'a ConcurrencyGovernor,
    _permit: SemaphorePermit<'a>,
}

impl GovernorPermit<'_> {
    /// Returns the slot explicitly. Dropping the permit does the same.
    pub fn release(self) {}
}

impl Drop for GovernorPermit<'_> {
    fn drop(&mut self) {
        self.governor.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;

    #[tokio::test]
    async fn never_exceeds_max_concurrent() {
        let governor = ConcurrencyGovernor::new("generate", 5, None);

        let tasks = (0..100).map(|i| {
            let governor = &governor;
            async move {
                let permit = governor.acquire(None).await.unwrap();
                assert!(governor.in_flight() <= 5);
                tokio::time::sleep(Duration::from_millis(1 + (i % 3))).await;
                permit.release();
            }
        });
        join_all(tasks).await;

        assert_eq!(governor.in_flight(), 0);
        assert!(governor.peak() <= 5);
        assert!(governor.peak() >= 2);
    }

    #[tokio::test]
    async fn release_on_error_path() {
        let governor = ConcurrencyGovernor::new("ingest", 1, None);

        async fn failing(governor: &ConcurrencyGovernor) -> std::result::Result<(), &'static str> {
            let _permit = governor.acquire(None).await.map_err(|_| "closed")?;
            Err("upstream exploded")
        }

        assert!(failing(&governor).await.is_err());
        assert_eq!(governor.in_flight(), 0);
        // The single slot is available again.
        let permit = tokio::time::timeout(Duration::from_millis(100), governor.acquire(None))
            .await
            .expect("slot leaked")
            .unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn rate_gate_spaces_same_partition() {
        let governor = ConcurrencyGovernor::new("ingest", 4, Some(Duration::from_millis(30)));
        let start = Instant::now();

        let tasks = (0..3).map(|_| {
            let governor = &governor;
            async move {
                let _permit = governor.acquire(Some("a.example")).await.unwrap();
            }
        });
        join_all(tasks).await;

        // Three starts on one key need at least two full intervals.
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn rate_gate_is_per_partition() {
        let governor = ConcurrencyGovernor::new("ingest", 4, Some(Duration::from_millis(200)));
        let start = Instant::now();

        let tasks = ["a.example", "b.example", "c.example"].map(|key| {
            let governor = &governor;
            async move {
                let _permit = governor.acquire(Some(key)).await.unwrap();
            }
        });
        join_all(tasks).await;

        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn zero_limit_is_clamped() {
        let governor = ConcurrencyGovernor::new("score", 0, None);
        assert_eq!(governor.max_concurrent(), 1);
    }
}
