//! Per-job progress fan-out.
//!
//! Delivery is at-least-once and best-effort: publishing never waits on
//! subscribers, a lagging subscriber skips ahead, and a late subscriber first
//! receives the most recent event. The job record stays the source of truth.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::error::Result;
use crate::state_machine::{Job, JobId, JobStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub stage: Option<String>,
    pub progress: u8,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Snapshot of the job as it stands.
    pub fn from_job(job: &Job, message: Option<String>) -> Self {
        Self {
            job_id: job.id,
            stage: job.stage.clone(),
            progress: job.progress,
            status: job.status,
            message: message.or_else(|| job.error.clone()),
            timestamp: Utc::now(),
        }
    }
}

/// What a subscriber sees: real events, or a keepalive when the job has been
/// quiet for a full keepalive interval.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Event(ProgressEvent),
    Keepalive,
}

pub type ProgressStream = BoxStream<'static, StreamMessage>;

#[async_trait]
pub trait ProgressPublisher: Send + Sync {
    async fn publish(&self, event: ProgressEvent) -> Result<()>;

    /// Stream of events for one job. Ends after the terminal event.
    fn subscribe(&self, job_id: JobId) -> ProgressStream;
}

/// Terminal events kept for late subscribers after a job's channel is gone.
const FINISHED_RETAINED: usize = 256;

struct Channel {
    sender: broadcast::Sender<ProgressEvent>,
    last: Option<ProgressEvent>,
}

#[derive(Default)]
struct Channels {
    live: HashMap<JobId, Channel>,
    finished: HashMap<JobId, ProgressEvent>,
    finished_order: VecDeque<JobId>,
}

impl Channels {
    fn live(&mut self, job_id: JobId, capacity: usize) -> &mut Channel {
        self.live.entry(job_id).or_insert_with(|| Channel {
            sender: broadcast::channel(capacity).0,
            last: None,
        })
    }

    /// Closes the job's channel and keeps only its terminal event.
    fn retire(&mut self, event: ProgressEvent) {
        self.live.remove(&event.job_id);
        if self.finished.insert(event.job_id, event.clone()).is_none() {
            self.finished_order.push_back(event.job_id);
        }
        while self.finished_order.len() > FINISHED_RETAINED {
            if let Some(oldest) = self.finished_order.pop_front() {
                self.finished.remove(&oldest);
            }
        }
    }
}

/// In-process bus with one broadcast channel per running job.
///
/// A channel lives until its job publishes a terminal event; after that only
/// the terminal event is retained, for a bounded number of jobs.
pub struct ProgressBus {
    capacity: usize,
    keepalive: Duration,
    channels: Mutex<Channels>,
}

impl fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressBus")
            .field("capacity", &self.capacity)
            .field("keepalive", &self.keepalive)
            .field("live_jobs", &self.live_jobs())
            .finish()
    }
}

impl ProgressBus {
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            keepalive,
            channels: Mutex::new(Channels::default()),
        }
    }

    /// Jobs that still hold an open channel.
    pub fn live_jobs(&self) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .len()
    }
}

#[async_trait]
impl ProgressPublisher for ProgressBus {
    async fn publish(&self, mut event: ProgressEvent) -> Result<()> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if channels.finished.contains_key(&event.job_id) {
            tracing::debug!(job = %event.job_id, "dropping event published after terminal status");
            return Ok(());
        }

        let channel = channels.live(event.job_id, self.capacity);
        if let Some(last) = &channel.last {
            event.progress = event.progress.max(last.progress);
        }
        channel.last = Some(event.clone());
        // No receivers is fine; the last event is retained for late joiners.
        let _ = channel.sender.send(event.clone());

        // Receivers still drain the buffered events once the sender is gone.
        if event.status.is_terminal() {
            channels.retire(event);
        }
        Ok(())
    }

    fn subscribe(&self, job_id: JobId) -> ProgressStream {
        let (rx, replay) = {
            let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
            let finished = channels.finished.get(&job_id).cloned();
            match finished {
                Some(terminal) => (None, Some(terminal)),
                None => {
                    let channel = channels.live(job_id, self.capacity);
                    (Some(channel.sender.subscribe()), channel.last.clone())
                }
            }
        };

        let state = Subscription {
            job_id,
            rx,
            replay,
            keepalive: self.keepalive,
            done: false,
        };

        futures::stream::unfold(state, |mut sub| async move {
            let message = sub.next_message().await?;
            Some((message, sub))
        })
        .boxed()
    }
}

struct Subscription {
    job_id: JobId,
    /// `None` once the job had already finished when subscribing.
    rx: Option<broadcast::Receiver<ProgressEvent>>,
    replay: Option<ProgressEvent>,
    keepalive: Duration,
    done: bool,
}

impl Subscription {
    async fn next_message(&mut self) -> Option<StreamMessage> {
        if self.done {
            return None;
        }
        if let Some(event) = self.replay.take() {
            self.done = event.status.is_terminal();
            return Some(StreamMessage::Event(event));
        }

        let rx = self.rx.as_mut()?;
        loop {
            match tokio::time::timeout(self.keepalive, rx.recv()).await {
                Err(_) => return Some(StreamMessage::Keepalive),
                Ok(Ok(event)) => {
                    self.done = event.status.is_terminal();
                    return Some(StreamMessage::Event(event));
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::debug!(job = %self.job_id, skipped, "progress subscriber lagged");
                }
                Ok(Err(RecvError::Closed)) => return None,
            }
        }
    }
}
