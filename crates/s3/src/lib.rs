//! nb-s3: Amazon S3 provider
//!
//! Implements `ObjectStore` and server-side multipart copy for S3 and
//! S3-compatible endpoints using the official AWS SDK.

mod client;
mod upload;

pub use client::{S3Config, S3Store};
pub use upload::{DEFAULT_PART_SIZE, MIN_PART_SIZE};
