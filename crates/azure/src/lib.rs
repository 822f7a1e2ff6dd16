//! nb-azure: Azure Blob Storage provider
//!
//! Uses the Blob REST API through `reqwest`. Listings are XML and parsed
//! with `quick-xml`; uploads stage blocks and commit a block list; copies
//! are asynchronous on the service side and polled by the caller.

mod client;
mod upload;
mod xml;

pub use client::{AzureConfig, AzureStore};
