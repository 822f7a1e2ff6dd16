//! nb-gcs: Google Cloud Storage provider
//!
//! Talks to the GCS JSON API directly with `reqwest`: listings and
//! metadata, ranged media downloads, resumable upload sessions and
//! server-side copies through `rewriteTo`.

mod client;
mod types;
mod upload;

pub use client::{GcsConfig, GcsStore};
pub use upload::UPLOAD_CHUNK_ALIGNMENT;
