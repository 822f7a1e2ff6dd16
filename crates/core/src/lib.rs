//! nb-core: provider abstraction and transfer engine for nimbus
//!
//! This crate provides the backend-independent parts of the client:
//! - Resource URIs shared by every provider
//! - The `ObjectStore` trait and its optional copy capabilities
//! - Streaming checksums used for integrity verification
//! - The transfer planner, job engine and transfer executor
//! - A local filesystem provider
//!
//! Cloud providers live in their own crates (`nb-s3`, `nb-gcs`, `nb-azure`,
//! `nb-assets`) and only depend on the traits defined here.

pub mod checksum;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod local;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod traits;
pub mod transfer;
pub mod uri;

pub use checksum::{Checksum, ChecksumAlgorithm, Digests, HashCursor, MultiHasher, Verification};
pub use config::{CheckpointConfig, EngineConfig, PlannerConfig, RetryConfig};
pub use error::{Error, ErrorKind, Result};
pub use executor::TransferExecutor;
pub use job::{
    Job, JobContext, JobDefinition, JobEngine, JobEvent, JobId, JobKind, JobOptions, JobRunner,
    JobStatus, Progress, ResumeCheckpoint, RunOutcome, StateStore, Subscription,
};
pub use local::LocalStore;
pub use planner::{PlanInputs, Strategy, TransferPlan};
pub use registry::ProviderRegistry;
pub use retry::{PollBackoff, retry_with_backoff, with_deadline};
pub use traits::{
    AsyncCopy, ByteStream, CopyHandle, CopyProgress, CopyState, ListOptions, ListPage, MultipartCopy,
    ObjectDescriptor, ObjectStore, PartInfo, PutOptions, RewriteCopy, RewriteStatus, UploadSession,
};
pub use uri::{ResourceUri, Scheme};
