//! GCS resumable upload sessions
//!
//! A session URI is created once and chunks are PUT with a Content-Range.
//! Intermediate chunks must be multiples of 256 KiB. The server answers 308
//! with a `Range: bytes=0-N` header while the upload is incomplete and 200/201
//! with the object resource once the final chunk arrives.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use nb_core::{
    Digests, Error, ObjectDescriptor, PutOptions, ResourceUri, Result, UploadSession,
};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Method, Response, StatusCode};

use crate::client::{GcsApi, check};
use crate::types::GcsObject;

/// Granularity of intermediate chunks
pub const UPLOAD_CHUNK_ALIGNMENT: u64 = 256 * 1024;

const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Round up to the chunk alignment, never below one unit
fn align_chunk(size: u64) -> u64 {
    size.max(1).div_ceil(UPLOAD_CHUNK_ALIGNMENT) * UPLOAD_CHUNK_ALIGNMENT
}

/// Committed length from a 308 `Range` header (`bytes=0-N`)
fn parse_committed(range: Option<&str>) -> Result<u64> {
    let Some(range) = range else {
        return Ok(0);
    };
    let end = range
        .strip_prefix("bytes=0-")
        .and_then(|end| end.parse::<u64>().ok())
        .ok_or_else(|| Error::General(format!("unexpected Range header: {range}")))?;
    Ok(end + 1)
}

fn encode_token(chunk_size: u64, session_uri: &str) -> String {
    format!("{chunk_size}:{session_uri}")
}

fn decode_token(token: &str) -> Result<(u64, &str)> {
    let invalid = || Error::General(format!("invalid GCS resume token: {token}"));
    let (size, session_uri) = token.split_once(':').ok_or_else(invalid)?;
    let size = size.parse::<u64>().map_err(|_| invalid())?;
    if size == 0 || size % UPLOAD_CHUNK_ALIGNMENT != 0 || !session_uri.starts_with("http") {
        return Err(invalid());
    }
    Ok((size, session_uri))
}

/// Outcome of one PUT against the session URI
enum ChunkReply {
    Incomplete(u64),
    Complete(Box<GcsObject>),
}

#[derive(Debug)]
pub(crate) struct GcsUploadSession {
    api: GcsApi,
    dest: ResourceUri,
    session_uri: String,
    chunk_size: u64,
    committed: u64,
    buffer: BytesMut,
    /// Set once the server reported the object as complete
    completed: Option<GcsObject>,
}

impl GcsUploadSession {
    pub(crate) async fn begin(api: GcsApi, dest: ResourceUri, options: &PutOptions) -> Result<Self> {
        let target = dest.to_string();
        let mut resource = serde_json::json!({ "name": dest.key() });
        if let Some(ct) = &options.content_type {
            resource["contentType"] = serde_json::Value::String(ct.clone());
        }
        if !options.metadata.is_empty() {
            resource["metadata"] = serde_json::to_value(&options.metadata)?;
        }

        let mut request = api
            .request(Method::POST, &api.upload_url(dest.authority()))
            .query(&[("uploadType", "resumable")])
            .json(&resource);
        if let Some(size) = options.size_hint {
            request = request.header("X-Upload-Content-Length", size);
        }
        let response = api.execute(request, &target).await?;
        let session_uri = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::General(format!("{target}: no resumable session URI")))?
            .to_string();

        tracing::debug!(dest = %dest, "Opened GCS resumable session");
        Ok(Self {
            api,
            dest,
            session_uri,
            chunk_size: align_chunk(options.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE)),
            committed: 0,
            buffer: BytesMut::new(),
            completed: None,
        })
    }

    pub(crate) async fn resume(api: GcsApi, dest: ResourceUri, token: &str) -> Result<Self> {
        let (chunk_size, session_uri) = decode_token(token)?;
        let mut session = Self {
            api,
            dest,
            session_uri: session_uri.to_string(),
            chunk_size,
            committed: 0,
            buffer: BytesMut::new(),
            completed: None,
        };
        session.query_committed().await?;
        Ok(session)
    }

    async fn interpret(&mut self, response: Response) -> Result<ChunkReply> {
        let target = self.dest.to_string();
        if response.status() == StatusCode::PERMANENT_REDIRECT {
            let range = response
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Ok(ChunkReply::Incomplete(parse_committed(range.as_deref())?));
        }
        // An expired or deleted session
        if matches!(response.status().as_u16(), 404 | 410) {
            return Err(Error::NotFound(format!("{target}: upload session expired")));
        }
        let response = check(response, &target).await?;
        let object: GcsObject = GcsApi::json(response, &target).await?;
        Ok(ChunkReply::Complete(Box::new(object)))
    }

    /// PUT `data` at the committed offset; `total` marks the final chunk
    async fn put_chunk(&mut self, data: Bytes, total: Option<u64>) -> Result<ChunkReply> {
        let start = self.committed;
        let len = data.len() as u64;
        let total_text = total.map_or("*".to_string(), |t| t.to_string());
        let content_range = if len == 0 {
            format!("bytes */{total_text}")
        } else {
            format!("bytes {start}-{}/{total_text}", start + len - 1)
        };

        let request = self
            .api
            .request(Method::PUT, &self.session_uri)
            .header(CONTENT_RANGE, content_range)
            .header(CONTENT_LENGTH, len)
            .body(data);
        let response = self.api.send(request, &self.dest.to_string()).await?;
        self.interpret(response).await
    }

    async fn send_chunk(&mut self, data: Bytes) -> Result<()> {
        let start = self.committed;
        match self.put_chunk(data.clone(), None).await? {
            ChunkReply::Incomplete(committed) => {
                if committed < start || committed > start + data.len() as u64 {
                    return Err(Error::General(format!(
                        "{}: server committed {committed} after sending from {start}",
                        self.dest
                    )));
                }
                // Keep whatever the server did not persist
                let kept = (committed - start) as usize;
                if kept < data.len() {
                    let mut rest = BytesMut::from(&data[kept..]);
                    rest.extend_from_slice(&self.buffer);
                    self.buffer = rest;
                }
                self.committed = committed;
                Ok(())
            }
            ChunkReply::Complete(object) => {
                self.committed = object.size();
                self.completed = Some(*object);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl UploadSession for GcsUploadSession {
    fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        Some(encode_token(self.chunk_size, &self.session_uri))
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() as u64 >= self.chunk_size {
            let chunk = self.buffer.split_to(self.chunk_size as usize).freeze();
            if let Err(e) = self.send_chunk(chunk.clone()).await {
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
        if self.completed.is_some() {
            return Ok(self.committed);
        }
        match self.put_chunk(Bytes::new(), None).await? {
            ChunkReply::Incomplete(committed) => self.committed = committed,
            ChunkReply::Complete(object) => {
                self.committed = object.size();
                self.completed = Some(*object);
            }
        }
        tracing::debug!(dest = %self.dest, committed = self.committed, "Queried GCS session");
        Ok(self.committed)
    }

    async fn finish(mut self: Box<Self>, _digests: &Digests) -> Result<ObjectDescriptor> {
        if let Some(object) = self.completed.take() {
            return object.into_descriptor(self.dest.authority());
        }
        let remaining = std::mem::take(&mut self.buffer).freeze();
        let total = self.committed + remaining.len() as u64;
        match self.put_chunk(remaining, Some(total)).await? {
            ChunkReply::Complete(object) => {
                tracing::debug!(dest = %self.dest, total, "Completed GCS upload");
                object.into_descriptor(self.dest.authority())
            }
            ChunkReply::Incomplete(committed) => Err(Error::TransientNetwork(format!(
                "{}: final chunk not accepted ({committed} of {total} bytes committed)",
                self.dest
            ))),
        }
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let target = self.dest.to_string();
        let response = self
            .api
            .send(self.api.request(Method::DELETE, &self.session_uri), &target)
            .await?;
        // GCS answers a canceled session with 499
        match response.status().as_u16() {
            200..=299 | 404 | 410 | 499 => Ok(()),
            _ => check(response, &target).await.map(|_| ()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{http_response, mock_server, store};
    use nb_core::ObjectStore;

    fn uri(s: &str) -> ResourceUri {
        ResourceUri::parse(s).unwrap()
    }

    #[test]
    fn test_align_chunk() {
        assert_eq!(align_chunk(1), UPLOAD_CHUNK_ALIGNMENT);
        assert_eq!(align_chunk(UPLOAD_CHUNK_ALIGNMENT), UPLOAD_CHUNK_ALIGNMENT);
        assert_eq!(align_chunk(5 * 1024 * 1024 + 1), 5 * 1024 * 1024 + UPLOAD_CHUNK_ALIGNMENT);
        assert_eq!(align_chunk(0), UPLOAD_CHUNK_ALIGNMENT);
    }

    #[test]
    fn test_parse_committed() {
        assert_eq!(parse_committed(None).unwrap(), 0);
        assert_eq!(parse_committed(Some("bytes=0-262143")).unwrap(), 262_144);
        assert!(parse_committed(Some("bytes=5-10")).is_err());
    }

    #[test]
    fn test_token_round_trip() {
        let token = encode_token(DEFAULT_CHUNK_SIZE, "https://storage.example.com/upload?upload_id=x:y");
        let (size, session) = decode_token(&token).unwrap();
        assert_eq!(size, DEFAULT_CHUNK_SIZE);
        assert_eq!(session, "https://storage.example.com/upload?upload_id=x:y");
        assert!(decode_token("1000:https://x").is_err());
        assert!(decode_token("262144:ftp://x").is_err());
    }

    #[tokio::test]
    async fn test_resume_queries_committed_offset() {
        let (url, mut requests) = mock_server(vec![http_response(
            "308 Resume Incomplete",
            &[("Range", "bytes=0-4194303")],
            "",
        )])
        .await;

        let token = encode_token(UPLOAD_CHUNK_ALIGNMENT, &format!("{url}/upload/session-1"));
        let session = store(&url)
            .resume_upload(&uri("gs://bucket/video.bin"), &token)
            .await
            .unwrap();
        assert_eq!(session.committed(), 4 * 1024 * 1024);

        let request = requests.recv().await.unwrap().to_lowercase();
        assert!(request.starts_with("put /upload/session-1 "));
        assert!(request.contains("content-range: bytes */*"));
    }

    #[tokio::test]
    async fn test_upload_chunks_then_finalizes() {
        let chunk = UPLOAD_CHUNK_ALIGNMENT as usize;
        let (session_url, mut chunk_requests) = mock_server(vec![
            http_response(
                "308 Resume Incomplete",
                &[("Range", format!("bytes=0-{}", chunk - 1).as_str())],
                "",
            ),
            http_response(
                "200 OK",
                &[],
                &format!(r#"{{"name": "big.bin", "size": "{}"}}"#, chunk + 10),
            ),
        ])
        .await;

        let api = store(&session_url).api();
        let mut session = GcsUploadSession {
            api,
            dest: uri("gs://bucket/big.bin"),
            session_uri: format!("{session_url}/upload/s"),
            chunk_size: UPLOAD_CHUNK_ALIGNMENT,
            committed: 0,
            buffer: BytesMut::new(),
            completed: None,
        };
        let committed = session
            .write_chunk(Bytes::from(vec![7u8; chunk + 10]))
            .await
            .unwrap();
        assert_eq!(committed, chunk as u64);

        let descriptor = Box::new(session).finish(&Digests::default()).await.unwrap();
        assert_eq!(descriptor.size, Some(chunk as u64 + 10));

        let first = chunk_requests.recv().await.unwrap().to_lowercase();
        assert!(first.contains(&format!("content-range: bytes 0-{}/*", chunk - 1)));
        let last = chunk_requests.recv().await.unwrap().to_lowercase();
        assert!(last.contains(&format!(
            "content-range: bytes {chunk}-{}/{}",
            chunk + 9,
            chunk + 10
        )));
    }
}
