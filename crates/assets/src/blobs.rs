//! Blob data plane: ranged reads and chunked upload sessions
//!
//! Uploads append chunks to a server-side session with a Content-Range,
//! then finalize it with the expected BLAKE3 digest. The server rejects a
//! finalize whose digest does not match what it stored. The asset is
//! registered in the metadata service once the blob exists.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use nb_core::{
    ByteStream, ChecksumAlgorithm, Digests, Error, ObjectDescriptor, PutOptions, ResourceUri,
    Result, UploadSession,
};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::rpc::{RpcTransport, status_error, transport_error};
use crate::types::AssetRecord;

const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct UploadCreated {
    upload_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadStatus {
    committed: u64,
}

#[derive(Debug, Deserialize)]
struct BlobInfo {
    digest: String,
    size: u64,
}

/// HTTP client for the blob endpoints
#[derive(Debug, Clone)]
pub(crate) struct BlobClient {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl BlobClient {
    pub(crate) fn new(http: reqwest::Client, endpoint: &str, token: Option<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/blobs/{path}", self.endpoint));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, target))?;
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(status_error(status.as_u16(), target))
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response, target: &str) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, target))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Stream a blob starting at `offset`
    pub(crate) async fn open(&self, digest: &str, offset: u64, target: &str) -> Result<ByteStream> {
        let mut request = self.request(Method::GET, &urlencoding::encode(digest));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, target))?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(futures::stream::empty()));
        }
        if !response.status().is_success() {
            return Err(status_error(response.status().as_u16(), target));
        }
        let target = target.to_string();
        Ok(response
            .bytes_stream()
            .map_err(move |e| transport_error(&e, &target))
            .boxed())
    }
}

/// Upload of one asset
#[derive(Debug)]
pub(crate) struct AssetUploadSession {
    blobs: BlobClient,
    rpc: Arc<dyn RpcTransport>,
    dest: ResourceUri,
    upload_id: String,
    chunk_size: u64,
    committed: u64,
    buffer: BytesMut,
    content_type: Option<String>,
}

impl AssetUploadSession {
    pub(crate) async fn begin(
        blobs: BlobClient,
        rpc: Arc<dyn RpcTransport>,
        dest: ResourceUri,
        options: &PutOptions,
    ) -> Result<Self> {
        let target = dest.to_string();
        let response = blobs
            .send(blobs.request(Method::POST, "uploads"), &target)
            .await?;
        let created: UploadCreated = BlobClient::json(response, &target).await?;
        tracing::debug!(%dest, upload_id = %created.upload_id, "Opened blob upload");
        Ok(Self {
            blobs,
            rpc,
            dest,
            upload_id: created.upload_id,
            chunk_size: options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE).max(1),
            committed: 0,
            buffer: BytesMut::new(),
            content_type: options.content_type.clone(),
        })
    }

    pub(crate) async fn resume(
        blobs: BlobClient,
        rpc: Arc<dyn RpcTransport>,
        dest: ResourceUri,
        upload_id: &str,
    ) -> Result<Self> {
        let mut session = Self {
            blobs,
            rpc,
            dest,
            upload_id: upload_id.to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            committed: 0,
            buffer: BytesMut::new(),
            content_type: None,
        };
        session.query_committed().await?;
        Ok(session)
    }

    fn session_path(&self) -> String {
        format!("uploads/{}", urlencoding::encode(&self.upload_id))
    }

    async fn append(&mut self, data: Bytes) -> Result<()> {
        let target = self.dest.to_string();
        let start = self.committed;
        let end = start + data.len() as u64 - 1;
        let request = self
            .blobs
            .request(Method::PATCH, &self.session_path())
            .header(CONTENT_RANGE, format!("bytes {start}-{end}/*"))
            .body(data);
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, &target))?;
        // Offset disagreement; the caller resynchronizes with query_committed
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(Error::TransientNetwork(format!(
                "{target}: server rejected chunk at offset {start}"
            )));
        }
        if !response.status().is_success() {
            return Err(status_error(response.status().as_u16(), &target));
        }
        let status: UploadStatus = BlobClient::json(response, &target).await?;
        self.committed = status.committed;
        Ok(())
    }
}

#[async_trait]
impl UploadSession for AssetUploadSession {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        Some(self.upload_id.clone())
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() as u64 >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size as usize).freeze();
            if let Err(e) = self.append(chunk.clone()).await {
                let mut restored = BytesMut::from(&chunk[..]);
                restored.extend_from_slice(&self.buffer);
                self.buffer = restored;
                return Err(e);
            }
        }
        Ok(self.committed)
    }

    async fn query_committed(&mut self) -> Result<u64> {
        self.buffer.clear();
        let target = self.dest.to_string();
        let response = self
            .blobs
            .send(self.blobs.request(Method::GET, &self.session_path()), &target)
            .await?;
        let status: UploadStatus = BlobClient::json(response, &target).await?;
        self.committed = status.committed;
        Ok(self.committed)
    }

    async fn finish(mut self: Box<Self>, digests: &Digests) -> Result<ObjectDescriptor> {
        let remaining = std::mem::take(&mut self.buffer).freeze();
        if !remaining.is_empty() {
            self.append(remaining).await?;
        }
        let digest = digests
            .get(ChecksumAlgorithm::Blake3)
            .map(|c| format!("blake3:{}", c.value))
            .ok_or_else(|| Error::General("asset uploads need a BLAKE3 digest".to_string()))?;

        let target = self.dest.to_string();
        let request = self
            .blobs
            .request(Method::PUT, &self.session_path())
            .query(&[("digest", digest.as_str())]);
        let response = request
            .send()
            .await
            .map_err(|e| transport_error(&e, &target))?;
        if matches!(response.status().as_u16(), 409 | 422) {
            return Err(Error::IntegrityMismatch(format!(
                "{target}: stored blob does not match {digest}"
            )));
        }
        if !response.status().is_success() {
            return Err(status_error(response.status().as_u16(), &target));
        }
        let blob: BlobInfo = BlobClient::json(response, &target).await?;

        let mut params = serde_json::json!({
            "namespace": self.dest.authority(),
            "path": self.dest.key(),
            "digest": blob.digest,
            "size": blob.size,
        });
        if let Some(ct) = &self.content_type {
            params["content_type"] = serde_json::Value::String(ct.clone());
        }
        let record: AssetRecord =
            serde_json::from_value(self.rpc.call("assets.register", params).await?)?;
        tracing::debug!(dest = %self.dest, digest = %record.digest, "Registered asset");
        record.into_descriptor(self.dest.authority())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let target = self.dest.to_string();
        match self
            .blobs
            .send(self.blobs.request(Method::DELETE, &self.session_path()), &target)
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MockRpcTransport;
    use nb_core::Checksum;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    const EMPTY_BLAKE3: &str = "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262";

    /// Serve canned JSON responses in order, reporting each request line
    async fn mock_server(responses: Vec<(u16, &'static str)>) -> (String, mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = Vec::new();
                let mut chunk = vec![0u8; 16 * 1024];
                let head_end = loop {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                while buf.len() < head_end + length {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (url, rx)
    }

    fn digests(hex: &str) -> Digests {
        Digests {
            values: vec![Checksum::new(ChecksumAlgorithm::Blake3, hex)],
        }
    }

    async fn session(url: &str, rpc: MockRpcTransport) -> AssetUploadSession {
        AssetUploadSession::begin(
            BlobClient::new(reqwest::Client::new(), url, None),
            Arc::new(rpc),
            ResourceUri::parse("asset://models/w.bin").unwrap(),
            &PutOptions {
                chunk_size: Some(4),
                ..Default::default()
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_registers_asset() {
        let (url, mut requests) = mock_server(vec![
            (201, r#"{"upload_id":"u-1"}"#),
            (202, r#"{"committed":4}"#),
            (202, r#"{"committed":5}"#),
            (201, r#"{"digest":"blake3:abc","size":5}"#),
        ])
        .await;
        let mut rpc = MockRpcTransport::new();
        rpc.expect_call()
            .withf(|method, params| {
                method == "assets.register"
                    && params["namespace"] == "models"
                    && params["path"] == "w.bin"
                    && params["digest"] == "blake3:abc"
            })
            .times(1)
            .returning(|_, _| {
                Ok(serde_json::json!({"path": "w.bin", "digest": "blake3:abc", "size": 5}))
            });

        let mut upload = Box::new(session(&url, rpc).await);
        assert_eq!(upload.resume_token().as_deref(), Some("u-1"));
        assert_eq!(upload.write_chunk(Bytes::from_static(b"hello")).await.unwrap(), 4);
        let descriptor = upload.finish(&digests("abc")).await.unwrap();
        assert_eq!(descriptor.size, Some(5));
        assert_eq!(descriptor.uri.to_string(), "asset://models/w.bin");

        assert!(requests.recv().await.unwrap().starts_with("POST /blobs/uploads "));
        let first = requests.recv().await.unwrap();
        assert!(first.starts_with("PATCH /blobs/uploads/u-1 "));
        assert!(first.to_lowercase().contains("content-range: bytes 0-3/*"));
        let second = requests.recv().await.unwrap();
        assert!(second.to_lowercase().contains("content-range: bytes 4-4/*"));
        assert!(
            requests
                .recv()
                .await
                .unwrap()
                .starts_with("PUT /blobs/uploads/u-1?digest=blake3%3Aabc ")
        );
    }

    #[tokio::test]
    async fn test_finalize_rejects_digest_mismatch() {
        let (url, _requests) = mock_server(vec![
            (201, r#"{"upload_id":"u-2"}"#),
            (409, r#"{"error":"digest mismatch"}"#),
        ])
        .await;
        // Registration must not happen
        let upload = Box::new(session(&url, MockRpcTransport::new()).await);
        let err = upload.finish(&digests(EMPTY_BLAKE3)).await.unwrap_err();
        assert!(matches!(err, Error::IntegrityMismatch(_)));
    }
}
