//! nb-assets: content-addressed asset store provider
//!
//! Asset metadata lives behind a JSON-RPC 2.0 endpoint (`assets.list`,
//! `assets.stat`, `assets.register`, `assets.delete`). Blob data is stored
//! by BLAKE3 digest and moved over plain HTTP with chunked upload sessions
//! and ranged reads.

mod blobs;
mod rpc;
mod store;
mod types;

pub use rpc::{HttpRpc, RpcTransport};
pub use store::{AssetConfig, AssetStore};
pub use types::{AssetRecord, AssetPage};
