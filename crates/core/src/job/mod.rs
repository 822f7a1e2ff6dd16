//! Asynchronous job engine
//!
//! - `model`: job records, status and progress
//! - `checkpoint`: append-only resume checkpoints
//! - `state`: `jobs.json` persistence and restart rules
//! - `engine`: the actor that schedules and tracks jobs

pub mod checkpoint;
pub mod engine;
pub mod model;
pub mod state;

pub use checkpoint::{CheckpointLog, CheckpointWriter, ResumeCheckpoint};
pub use engine::{
    EventCallback, JobContext, JobEngine, JobEvent, JobRunner, RunOutcome, Subscription,
};
pub use model::{Job, JobDefinition, JobError, JobId, JobKind, JobOptions, JobStatus, Progress};
pub use state::{PersistedJob, StateDocument, StateStore};
