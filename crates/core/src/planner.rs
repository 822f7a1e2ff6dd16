//! Transfer planner
//!
//! Chooses how a copy is carried out from the two schemes, the source size
//! and the configured thresholds. The decision is a pure function so it can
//! be persisted with the job and reproduced after a restart.

use serde::{Deserialize, Serialize};

use crate::config::PlannerConfig;
use crate::uri::Scheme;

/// Upper bound on parts in one multipart upload
pub const MAX_PARTS: u64 = 10_000;

/// Facts the decision was based on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanInputs {
    pub source_scheme: Scheme,
    pub dest_scheme: Scheme,
    pub source_size: u64,
    /// Size exceeded the single-call copy limit
    pub threshold_crossed: bool,
    pub same_provider: bool,
}

/// How the bytes get from source to destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Strategy {
    /// One server-side copy call, or a rewrite loop when `iterative`
    AtomicCopy { iterative: bool },
    /// Server-side copy of byte ranges into parts
    MultipartCopy {
        part_size: u64,
        part_count: u64,
        part_concurrency: usize,
    },
    /// Backend copies in the background; poll until it settles
    AsyncCopyPoll {
        initial_poll_ms: u64,
        max_poll_ms: u64,
    },
    /// Read from the source and write to the destination through this client
    StreamThroughClient { chunk_size: u64, resumable: bool },
    NotSupported { reason: String },
}

impl Strategy {
    /// Short label, matching the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::AtomicCopy { .. } => "atomic-copy",
            Strategy::MultipartCopy { .. } => "multipart-copy",
            Strategy::AsyncCopyPoll { .. } => "async-copy-poll",
            Strategy::StreamThroughClient { .. } => "stream-through-client",
            Strategy::NotSupported { .. } => "not-supported",
        }
    }
}

/// The plan computed once when a transfer job starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPlan {
    pub inputs: PlanInputs,
    pub strategy: Strategy,
}

impl TransferPlan {
    /// Decide the strategy for copying `source_size` bytes
    ///
    /// `dest_resumable` tells whether the destination provider offers
    /// resumable upload sessions; it only matters for streamed transfers.
    pub fn compute(
        source_scheme: Scheme,
        dest_scheme: Scheme,
        source_size: u64,
        dest_resumable: bool,
        config: &PlannerConfig,
    ) -> Self {
        let same_provider = source_scheme == dest_scheme;
        let threshold_crossed =
            source_scheme == Scheme::S3 && source_size > config.s3_atomic_copy_limit;

        let strategy = if !same_provider {
            Strategy::StreamThroughClient {
                chunk_size: config.chunk_size,
                resumable: dest_resumable,
            }
        } else {
            match source_scheme {
                Scheme::Local => Strategy::AtomicCopy { iterative: false },
                Scheme::S3 if threshold_crossed => {
                    let part_size = multipart_part_size(source_size, config.multipart_part_size);
                    Strategy::MultipartCopy {
                        part_size,
                        part_count: source_size.div_ceil(part_size),
                        part_concurrency: config.part_concurrency,
                    }
                }
                Scheme::S3 => Strategy::AtomicCopy { iterative: false },
                Scheme::Gcs => Strategy::AtomicCopy { iterative: true },
                Scheme::Azure => Strategy::AsyncCopyPoll {
                    initial_poll_ms: config.copy_poll_initial_ms,
                    max_poll_ms: config.copy_poll_max_ms,
                },
                Scheme::Asset => Strategy::NotSupported {
                    reason: "the asset store has no server-side copy".to_string(),
                },
            }
        };

        tracing::debug!(
            %source_scheme,
            %dest_scheme,
            source_size,
            ?strategy,
            "Planned transfer"
        );

        Self {
            inputs: PlanInputs {
                source_scheme,
                dest_scheme,
                source_size,
                threshold_crossed,
                same_provider,
            },
            strategy,
        }
    }

    /// Whether a job using this plan can be paused and resumed
    pub fn is_resumable(&self) -> bool {
        match &self.strategy {
            Strategy::StreamThroughClient { resumable, .. } => *resumable,
            Strategy::MultipartCopy { .. } => true,
            Strategy::AtomicCopy { iterative } => *iterative,
            Strategy::AsyncCopyPoll { .. } | Strategy::NotSupported { .. } => false,
        }
    }

    /// Short name of the strategy for display
    pub fn label(&self) -> &'static str {
        match self.strategy {
            Strategy::AtomicCopy { iterative: false } => "atomic-copy",
            Strategy::AtomicCopy { iterative: true } => "rewrite-copy",
            Strategy::MultipartCopy { .. } => "multipart-copy",
            Strategy::AsyncCopyPoll { .. } => "async-copy-poll",
            Strategy::StreamThroughClient { .. } => "stream",
            Strategy::NotSupported { .. } => "not-supported",
        }
    }
}

/// Configured part size, raised so that the part count stays within limits
pub fn multipart_part_size(size: u64, configured: u64) -> u64 {
    configured.max(size.div_ceil(MAX_PARTS)).max(1)
}
