//! Resume checkpoints
//!
//! Each resumable job appends records to `checkpoints/<job-id>.jsonl`. A
//! record carries a BLAKE3 digest of its other fields, so a torn or
//! corrupted line is detected and skipped; the newest valid record wins.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::CheckpointConfig;
use crate::error::Result;
use crate::job::model::JobId;

/// One durable progress record of a resumable transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCheckpoint {
    pub job_id: JobId,
    pub sequence: u64,
    pub bytes_committed: u64,
    pub provider_resume_token: Option<String>,
    pub written_at: Timestamp,
    pub digest: String,
}

impl ResumeCheckpoint {
    pub fn new(
        job_id: JobId,
        sequence: u64,
        bytes_committed: u64,
        provider_resume_token: Option<String>,
    ) -> Self {
        let mut checkpoint = Self {
            job_id,
            sequence,
            bytes_committed,
            provider_resume_token,
            written_at: Timestamp::now(),
            digest: String::new(),
        };
        checkpoint.digest = checkpoint.compute_digest();
        checkpoint
    }

    fn compute_digest(&self) -> String {
        let fields = (
            &self.job_id,
            self.sequence,
            self.bytes_committed,
            &self.provider_resume_token,
            &self.written_at,
        );
        // Serializing a tuple of plain values cannot fail
        let encoded = serde_json::to_vec(&fields).unwrap_or_default();
        blake3::hash(&encoded).to_hex().to_string()
    }

    /// Whether the digest matches the record's fields
    pub fn is_valid(&self) -> bool {
        self.digest == self.compute_digest()
    }

    /// The newer of two optional checkpoints
    pub fn newest(a: Option<Self>, b: Option<Self>) -> Option<Self> {
        match (a, b) {
            (Some(a), Some(b)) => Some(if b.sequence > a.sequence { b } else { a }),
            (a, b) => a.or(b),
        }
    }
}

/// Append-only checkpoint files, one per job
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    dir: PathBuf,
}

impl CheckpointLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, id: JobId) -> PathBuf {
        self.dir.join(format!("{id}.jsonl"))
    }

    /// Append one record and sync it to disk
    pub async fn append(&self, checkpoint: &ResumeCheckpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(checkpoint)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(checkpoint.job_id))
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Newest valid record for a job, skipping corrupt lines
    pub async fn latest(&self, id: JobId) -> Result<Option<ResumeCheckpoint>> {
        let content = match tokio::fs::read(self.path_for(id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut newest: Option<ResumeCheckpoint> = None;
        let mut skipped = 0usize;
        for line in content.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ResumeCheckpoint>(line) {
                Ok(record) if record.job_id == id && record.is_valid() => {
                    newest = ResumeCheckpoint::newest(newest, Some(record));
                }
                _ => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::warn!(job_id = %id, skipped, "Skipped invalid checkpoint records");
        }
        Ok(newest)
    }

    pub async fn remove(&self, id: JobId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decides when a running transfer appends its next checkpoint
#[derive(Debug)]
pub struct CheckpointWriter {
    log: Option<CheckpointLog>,
    job_id: JobId,
    config: CheckpointConfig,
    next_sequence: u64,
    last_bytes: u64,
    last_written: Instant,
}

impl CheckpointWriter {
    /// Start after `previous`, so sequence numbers keep increasing across resumes
    pub fn new(
        log: Option<CheckpointLog>,
        job_id: JobId,
        config: CheckpointConfig,
        previous: Option<&ResumeCheckpoint>,
    ) -> Self {
        Self {
            log,
            job_id,
            config,
            next_sequence: previous.map_or(0, |c| c.sequence + 1),
            last_bytes: previous.map_or(0, |c| c.bytes_committed),
            last_written: Instant::now(),
        }
    }

    /// Whether enough bytes or time have passed since the last record
    pub fn due(&self, committed: u64) -> bool {
        committed.saturating_sub(self.last_bytes) >= self.config.bytes_interval
            || (committed > self.last_bytes
                && self.last_written.elapsed()
                    >= Duration::from_millis(self.config.time_interval_ms))
    }

    /// Append a record unconditionally
    pub async fn record(
        &mut self,
        committed: u64,
        token: Option<String>,
    ) -> Result<ResumeCheckpoint> {
        let checkpoint = ResumeCheckpoint::new(self.job_id, self.next_sequence, committed, token);
        if let Some(log) = &self.log {
            log.append(&checkpoint).await?;
        }
        self.next_sequence += 1;
        self.last_bytes = committed;
        self.last_written = Instant::now();
        tracing::trace!(job_id = %self.job_id, committed, sequence = checkpoint.sequence, "Checkpoint");
        Ok(checkpoint)
    }

    /// Append a record if the cadence says so
    pub async fn maybe_record(
        &mut self,
        committed: u64,
        token: Option<String>,
    ) -> Result<Option<ResumeCheckpoint>> {
        if self.due(committed) {
            self.record(committed, token).await.map(Some)
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_detects_tampering() {
        let id = JobId::new();
        let mut checkpoint = ResumeCheckpoint::new(id, 3, 4096, Some("upload-1".into()));
        assert!(checkpoint.is_valid());

        checkpoint.bytes_committed = 8192;
        assert!(!checkpoint.is_valid());
    }

    #[tokio::test]
    async fn test_latest_skips_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path());
        let id = JobId::new();

        log.append(&ResumeCheckpoint::new(id, 0, 100, None)).await.unwrap();
        log.append(&ResumeCheckpoint::new(id, 1, 200, Some("t".into())))
            .await
            .unwrap();

        // A record with a bad digest, then a torn line
        let mut forged = ResumeCheckpoint::new(id, 5, 999, None);
        forged.bytes_committed = 1;
        let mut content = tokio::fs::read(log.path_for(id)).await.unwrap();
        content.extend(serde_json::to_vec(&forged).unwrap());
        content.extend(b"\n{\"job_id\":\"");
        tokio::fs::write(log.path_for(id), content).await.unwrap();

        let latest = log.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 1);
        assert_eq!(latest.bytes_committed, 200);
        assert_eq!(latest.provider_resume_token.as_deref(), Some("t"));
    }

    #[tokio::test]
    async fn test_missing_log_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path().join("checkpoints"));
        let id = JobId::new();
        assert!(log.latest(id).await.unwrap().is_none());
        log.remove(id).await.unwrap();

        log.append(&ResumeCheckpoint::new(id, 0, 1, None)).await.unwrap();
        log.remove(id).await.unwrap();
        assert!(log.latest(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_writer_cadence() {
        let config = CheckpointConfig {
            bytes_interval: 100,
            time_interval_ms: 60_000,
        };
        let previous = ResumeCheckpoint::new(JobId::new(), 4, 50, None);
        let mut writer = CheckpointWriter::new(None, previous.job_id, config, Some(&previous));

        assert!(!writer.due(120));
        assert!(writer.due(150));
        let cp = writer.maybe_record(150, None).await.unwrap().unwrap();
        assert_eq!(cp.sequence, 5);
        assert!(writer.maybe_record(200, None).await.unwrap().is_none());
    }
}
