//! JSON-RPC 2.0 transport for asset metadata

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use nb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Asset or namespace does not exist
pub const CODE_NOT_FOUND: i64 = -32004;
/// Caller lacks access to the namespace
pub const CODE_FORBIDDEN: i64 = -32003;
/// Asset is referenced by a snapshot and cannot be removed
pub const CODE_SNAPSHOT_REFERENCED: i64 = -32010;
/// Listing cursor is unknown or expired
pub const CODE_INVALID_CURSOR: i64 = -32011;
/// Server is overloaded; the call may be repeated
pub const CODE_BUSY: i64 = -32000;

/// Request/response channel to the metadata service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RpcTransport: Send + Sync + std::fmt::Debug {
    /// Invoke `method` and return its `result`
    async fn call(&self, method: &str, params: Value) -> Result<Value>;
}

#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn into_error(self, method: &str) -> Error {
        let detail = format!("{method}: {}", self.message);
        match self.code {
            CODE_NOT_FOUND => Error::NotFound(self.message),
            CODE_FORBIDDEN => Error::PermissionDenied(detail),
            CODE_SNAPSHOT_REFERENCED => Error::NotSupported(detail),
            CODE_INVALID_CURSOR => Error::InvalidPageToken(detail),
            CODE_BUSY => Error::TransientNetwork(detail),
            _ => Error::General(format!("{detail} (code {})", self.code)),
        }
    }
}

/// JSON-RPC over HTTP POST
#[derive(Debug)]
pub struct HttpRpc {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(http: reqwest::Client, url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            http,
            url: url.into(),
            token,
            next_id: AtomicU64::new(1),
        }
    }
}

pub(crate) fn transport_error(error: &reqwest::Error, target: &str) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        Error::TransientNetwork(format!("{target}: {error}"))
    } else {
        Error::Network(format!("{target}: {error}"))
    }
}

pub(crate) fn status_error(status: u16, target: &str) -> Error {
    let detail = format!("{target}: HTTP {status}");
    match status {
        404 => Error::NotFound(target.to_string()),
        401 | 403 => Error::PermissionDenied(detail),
        408 | 429 | 500..=599 => Error::TransientNetwork(detail),
        _ => Error::Network(detail),
    }
}

#[async_trait]
impl RpcTransport for HttpRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let mut builder = self.http.post(&self.url).json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        tracing::trace!(method, id, "RPC call");
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&e, method))?;
        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), method));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, method))?;
        let response: Response = serde_json::from_slice(&body)?;

        if let Some(error) = response.error {
            return Err(error.into_error(method));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }
}
