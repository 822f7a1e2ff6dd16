//! Engine configuration
//!
//! All settings have defaults, so an empty TOML document is a valid config.
//! Connection parameters and credentials are not part of this file; they
//! are handed to provider constructors by the caller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::checksum::ChecksumAlgorithm;
use crate::error::{Error, Result};

const MIB: u64 = 1024 * 1024;

/// Top-level configuration for the job engine and transfer executor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of simultaneously running jobs
    pub concurrency: usize,

    /// Directory holding `jobs.json` and the checkpoint logs
    pub state_dir: Option<PathBuf>,

    /// Deadline applied to every individual provider call, in seconds
    pub call_timeout_secs: u64,

    /// Checksum algorithm computed for every transfer
    pub checksum: ChecksumAlgorithm,

    /// Always compute MD5 as well, even when no backend reports it
    pub legacy_checksum: bool,

    pub retry: RetryConfig,
    pub planner: PlannerConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            state_dir: None,
            call_timeout_secs: 300,
            checksum: ChecksumAlgorithm::Blake3,
            legacy_checksum: false,
            retry: RetryConfig::default(),
            planner: PlannerConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::Config(format!(
                "Failed to read {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.planner.chunk_size == 0 || self.planner.multipart_part_size == 0 {
            return Err(Error::Config("chunk and part sizes must be non-zero".into()));
        }
        if self.planner.part_concurrency == 0 {
            return Err(Error::Config("planner.part_concurrency must be at least 1".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// The configured state directory, or the per-user data directory
    pub fn resolved_state_dir(&self) -> Option<PathBuf> {
        self.state_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("nimbus")))
    }
}

/// Retry configuration for transient failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

/// Thresholds and sizes used by the transfer planner
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Largest object the S3-like backend copies in a single call
    pub s3_atomic_copy_limit: u64,
    /// Preferred part size for multipart copies
    pub multipart_part_size: u64,
    /// Parts copied in parallel within one job
    pub part_concurrency: usize,
    /// Chunk size for streamed transfers (GCS needs a 256 KiB multiple)
    pub chunk_size: u64,
    /// First poll delay for asynchronous copies, in milliseconds
    pub copy_poll_initial_ms: u64,
    /// Upper bound on the poll delay, in milliseconds
    pub copy_poll_max_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            s3_atomic_copy_limit: 5 * 1024 * MIB,
            multipart_part_size: 512 * MIB,
            part_concurrency: 4,
            chunk_size: 8 * MIB,
            copy_poll_initial_ms: 500,
            copy_poll_max_ms: 15_000,
        }
    }
}

/// How often resumable transfers append a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Write after at least this many newly committed bytes
    pub bytes_interval: u64,
    /// Or after this many milliseconds, whichever comes first
    pub time_interval_ms: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            bytes_interval: 32 * MIB,
            time_interval_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.planner.s3_atomic_copy_limit, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_partial_override() {
        let config = EngineConfig::from_toml_str(
            r#"
            concurrency = 8
            checksum = "md5"

            [retry]
            max_attempts = 2

            [planner]
            chunk_size = 16777216
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.checksum, ChecksumAlgorithm::Md5);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.initial_backoff_ms, 200);
        assert_eq!(config.planner.chunk_size, 16 * MIB);
        assert_eq!(config.planner.part_concurrency, 4);
    }

    #[test]
    fn test_validation_rejects_zero_concurrency() {
        let err = EngineConfig::from_toml_str("concurrency = 0").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(&dir.path().join("missing.toml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
