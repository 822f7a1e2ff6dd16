//! Persisted engine state
//!
//! `jobs.json` holds every non-terminal job together with its latest
//! checkpoint. Writes go to a temporary file that is synced and renamed
//! over the previous document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::job::checkpoint::{CheckpointLog, ResumeCheckpoint};
use crate::job::model::{Job, JobStatus};

/// Version of the `jobs.json` layout
pub const STATE_VERSION: u32 = 1;

const STATE_FILE: &str = "jobs.json";
const CHECKPOINT_DIR: &str = "checkpoints";

/// A job and the checkpoint it would resume from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub job: Job,
    pub checkpoint: Option<ResumeCheckpoint>,
}

/// Contents of `jobs.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub version: u32,
    /// Monotonic counter; older snapshots never overwrite newer ones
    pub revision: u64,
    pub saved_at: Timestamp,
    pub jobs: Vec<PersistedJob>,
}

impl StateDocument {
    pub fn new(revision: u64, jobs: Vec<PersistedJob>) -> Self {
        Self {
            version: STATE_VERSION,
            revision,
            saved_at: Timestamp::now(),
            jobs,
        }
    }
}

/// Location of the state document and checkpoint logs
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
    /// Serializes writers and remembers the last revision written
    written: Arc<Mutex<u64>>,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn checkpoint_log(&self) -> CheckpointLog {
        CheckpointLog::new(self.dir.join(CHECKPOINT_DIR))
    }

    /// Write the document atomically
    pub async fn save(&self, document: &StateDocument) -> Result<()> {
        let mut written = self.written.lock().await;
        if document.revision < *written {
            tracing::trace!(revision = document.revision, "Skipping stale state snapshot");
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        let target = self.path();
        let temp = self.dir.join(format!("{STATE_FILE}.tmp"));

        let content = serde_json::to_vec_pretty(document)?;
        let mut file = tokio::fs::File::create(&temp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&temp, &target).await?;

        *written = document.revision;
        tracing::debug!(
            path = %target.display(),
            jobs = document.jobs.len(),
            revision = document.revision,
            "Persisted job state"
        );
        Ok(())
    }

    /// Read the document; `None` when nothing was saved yet
    pub async fn load(&self) -> Result<Option<StateDocument>> {
        let content = match tokio::fs::read(self.path()).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let document: StateDocument = serde_json::from_slice(&content)?;
        if document.version != STATE_VERSION {
            return Err(Error::Config(format!(
                "Unsupported job state version {} (expected {STATE_VERSION})",
                document.version
            )));
        }
        Ok(Some(document))
    }
}

/// Apply the restart rules to a job read back from disk
///
/// Pending and paused jobs come back paused. A job that was running comes
/// back paused when it can resume, and failed otherwise.
pub fn restore_job(mut job: Job) -> Job {
    match job.status {
        JobStatus::Pending | JobStatus::Paused => {
            job.status = JobStatus::Paused;
        }
        JobStatus::Running if job.resumable => {
            job.status = JobStatus::Paused;
        }
        JobStatus::Running => {
            job.finish(
                JobStatus::Failed,
                Some(&Error::General(
                    "interrupted by shutdown and cannot be resumed".to_string(),
                )),
            );
        }
        JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled => {}
    }
    job
}
