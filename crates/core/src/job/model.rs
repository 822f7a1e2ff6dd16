//! Job records
//!
//! A `Job` is the engine's record of one user-requested operation. It is
//! owned by the engine actor; callers only ever see clones.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, ErrorKind};
use crate::planner::TransferPlan;
use crate::uri::ResourceUri;

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|_| Error::JobNotFound(format!("not a job id: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Copy,
    Move,
    Upload,
    Download,
    Delete,
    Mkdir,
}

impl JobKind {
    /// Whether the job moves bytes and therefore gets a transfer plan
    pub fn is_transfer(&self) -> bool {
        matches!(
            self,
            JobKind::Copy | JobKind::Move | JobKind::Upload | JobKind::Download
        )
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Copy => "copy",
            JobKind::Move => "move",
            JobKind::Upload => "upload",
            JobKind::Download => "download",
            JobKind::Delete => "delete",
            JobKind::Mkdir => "mkdir",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Per-job options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Delete directories with their contents
    pub recursive: bool,
    /// Replace an existing destination
    pub overwrite: bool,
    /// Compare checksums after the transfer
    pub verify: bool,
    /// Content type for the destination object
    pub content_type: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            overwrite: true,
            verify: true,
            content_type: None,
        }
    }
}

/// What the caller asks the engine to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub kind: JobKind,
    pub source: ResourceUri,
    pub destination: Option<ResourceUri>,
    pub options: JobOptions,
    /// Enqueue immediately; otherwise the job waits for `start_job`
    pub start: bool,
}

impl JobDefinition {
    fn transfer(kind: JobKind, source: ResourceUri, destination: ResourceUri) -> Self {
        Self {
            kind,
            source,
            destination: Some(destination),
            options: JobOptions::default(),
            start: true,
        }
    }

    pub fn copy(source: ResourceUri, destination: ResourceUri) -> Self {
        Self::transfer(JobKind::Copy, source, destination)
    }

    pub fn move_to(source: ResourceUri, destination: ResourceUri) -> Self {
        Self::transfer(JobKind::Move, source, destination)
    }

    pub fn upload(source: ResourceUri, destination: ResourceUri) -> Self {
        Self::transfer(JobKind::Upload, source, destination)
    }

    pub fn download(source: ResourceUri, destination: ResourceUri) -> Self {
        Self::transfer(JobKind::Download, source, destination)
    }

    pub fn delete(target: ResourceUri, recursive: bool) -> Self {
        Self {
            kind: JobKind::Delete,
            source: target,
            destination: None,
            options: JobOptions {
                recursive,
                ..Default::default()
            },
            start: true,
        }
    }

    pub fn mkdir(target: ResourceUri) -> Self {
        Self {
            kind: JobKind::Mkdir,
            source: target,
            destination: None,
            options: JobOptions::default(),
            start: true,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Create the job without enqueueing it
    pub fn deferred(mut self) -> Self {
        self.start = false;
        self
    }
}

/// Error recorded on a failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for JobError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// Progress snapshot of a job
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
    pub message: Option<String>,
    pub speed_bytes_per_sec: Option<f64>,
    pub eta_seconds: Option<u64>,
}

impl Progress {
    /// Fraction completed in `0.0..=1.0`, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.bytes_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.bytes_transferred as f64 / total as f64).min(1.0)),
            None => None,
        }
    }

    /// Fill in speed and ETA from the bytes moved since `baseline`
    pub(crate) fn estimate(&mut self, baseline: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        let moved = self.bytes_transferred.saturating_sub(baseline);
        if secs < 0.5 || moved == 0 {
            return;
        }
        let speed = moved as f64 / secs;
        self.speed_bytes_per_sec = Some(speed);
        self.eta_seconds = self
            .bytes_total
            .map(|total| (total.saturating_sub(self.bytes_transferred) as f64 / speed).ceil() as u64);
    }
}

/// The engine's record of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    pub source: ResourceUri,
    pub destination: Option<ResourceUri>,
    pub options: JobOptions,
    pub progress: Progress,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub error: Option<JobError>,
    pub cancelable: bool,
    pub pausable: bool,
    pub resumable: bool,
    pub plan: Option<TransferPlan>,
}

impl Job {
    pub(crate) fn new(definition: JobDefinition) -> Self {
        Self {
            id: JobId::new(),
            kind: definition.kind,
            status: JobStatus::Pending,
            source: definition.source,
            destination: definition.destination,
            options: definition.options,
            progress: Progress::default(),
            created_at: Timestamp::now(),
            started_at: None,
            completed_at: None,
            error: None,
            cancelable: true,
            pausable: false,
            resumable: false,
            plan: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Destination, required for transfer jobs
    pub fn destination(&self) -> Result<&ResourceUri, Error> {
        self.destination
            .as_ref()
            .ok_or_else(|| Error::InvalidJobState(format!("{} job {} has no destination", self.kind, self.id)))
    }

    /// Attach the plan and derive the pause/resume flags from it
    pub(crate) fn set_plan(&mut self, plan: TransferPlan) {
        self.pausable = plan.is_resumable();
        self.resumable = plan.is_resumable();
        if self.progress.bytes_total.is_none() {
            self.progress.bytes_total = Some(plan.inputs.source_size);
        }
        self.plan = Some(plan);
    }

    pub(crate) fn finish(&mut self, status: JobStatus, error: Option<&Error>) {
        self.status = status;
        self.completed_at = Some(Timestamp::now());
        self.error = error.map(JobError::from);
        self.cancelable = false;
        self.pausable = false;
        if status == JobStatus::Completed
            && let Some(total) = self.progress.bytes_total
        {
            self.progress.bytes_transferred = self.progress.bytes_transferred.max(total);
            self.progress.eta_seconds = Some(0);
        }
    }
}
