//! Orchestration core of a staged dataset pipeline.
//!
//! A [`Job`](state_machine::Job) is admitted onto a work queue, claimed by a
//! [`Dispatcher`](dispatcher::Dispatcher) under a lease, and driven through an
//! ordered [`StageRegistry`](stage::StageRegistry) by the
//! [`Orchestrator`](orchestrator::Orchestrator). Per-item outcomes go to the
//! [`Ledger`](ledger::Ledger) so a reclaimed job only redoes unfinished work;
//! progress fans out to subscribers through a
//! [`ProgressPublisher`](progress::ProgressPublisher).

pub mod admission;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod governor;
pub mod item;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod stage;
pub mod stages;
pub mod state_machine;
pub mod store;
pub mod telemetry;
pub mod ui;

pub use error::{PipelineError, Result};
