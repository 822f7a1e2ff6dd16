//! Block blob uploads
//!
//! Data is staged with Put Block and made visible with Put Block List.
//! Staged blocks are tracked locally, so sessions do not survive the
//! process and `resumable_uploads` stays off for this backend.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use nb_core::{
    ChecksumAlgorithm, Digests, Error, ObjectDescriptor, PutOptions, ResourceUri, Result,
    UploadSession,
};
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

use crate::client::AzureApi;

/// Block size when the caller has no preference
const DEFAULT_BLOCK_SIZE: u64 = 8 * 1024 * 1024;

/// Service limit for a single block
const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Block ids must have the same length within a blob
fn block_id(index: usize) -> String {
    BASE64.encode(format!("{index:08}"))
}

/// Append a query to a URL that may already carry a SAS
fn with_query(url: &str, query: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{query}")
}

#[derive(Debug)]
pub(crate) struct AzureUploadSession {
    api: AzureApi,
    dest: ResourceUri,
    block_size: u64,
    blocks: Vec<String>,
    committed: u64,
    buffer: BytesMut,
    content_type: Option<String>,
}

impl AzureUploadSession {
    pub(crate) fn new(api: AzureApi, dest: ResourceUri, options: &PutOptions) -> Self {
        Self {
            api,
            dest,
            block_size: options
                .chunk_size
                .unwrap_or(DEFAULT_BLOCK_SIZE)
                .clamp(1, MAX_BLOCK_SIZE),
            blocks: Vec::new(),
            committed: 0,
            buffer: BytesMut::new(),
            content_type: options.content_type.clone(),
        }
    }

    async fn put_block(&mut self, data: Bytes) -> Result<()> {
        let id = block_id(self.blocks.len());
        let url = with_query(
            &self.api.blob_url(&self.dest),
            &format!("comp=block&blockid={}", urlencoding::encode(&id)),
        );
        let size = data.len() as u64;
        let request = self
            .api
            .request(Method::PUT, &url)
            .header("Content-MD5", BASE64.encode(Md5::digest(&data)))
            .header(CONTENT_LENGTH, size)
            .body(data);
        self.api.execute(request, &self.dest.to_string()).await?;

        tracing::trace!(dest = %self.dest, block = self.blocks.len(), size, "Staged block");
        self.blocks.push(id);
        self.committed += size;
        Ok(())
    }
}

#[async_trait]
impl UploadSession for AzureUploadSession {
    fn chunk_size(&self) -> u64 {
        self.block_size
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        None
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() as u64 >= self.block_size {
            let block = self.buffer.split_to(self.block_size as usize).freeze();
            if let Err(e) = self.put_block(block.clone()).await {
                let mut restored = BytesMut::from(&block[..]);
                restored.extend_from_slice(&self.buffer);
                self.buffer = restored;
                return Err(e);
            }
        }
        Ok(self.committed)
    }

    async fn query_committed(&mut self) -> Result<u64> {
        self.buffer.clear();
        Ok(self.committed)
    }

    async fn finish(mut self: Box<Self>, digests: &Digests) -> Result<ObjectDescriptor> {
        let remaining = std::mem::take(&mut self.buffer).freeze();
        if !remaining.is_empty() {
            self.put_block(remaining).await?;
        }

        let body = crate::xml::block_list(&self.blocks);
        let url = with_query(&self.api.blob_url(&self.dest), "comp=blocklist");
        let mut request = self
            .api
            .request(Method::PUT, &url)
            .header(CONTENT_TYPE, "application/xml")
            .header(CONTENT_LENGTH, body.len())
            .body(body);
        if let Some(ct) = &self.content_type {
            request = request.header("x-ms-blob-content-type", ct);
        }
        // Stored as Content-MD5 so later reads can be verified
        let md5 = digests.get(ChecksumAlgorithm::Md5).cloned();
        if let Some(checksum) = &md5 {
            let raw = hex::decode(&checksum.value)
                .map_err(|e| Error::General(format!("invalid MD5 digest: {e}")))?;
            request = request.header("x-ms-blob-content-md5", BASE64.encode(raw));
        }
        let response = self.api.execute(request, &self.dest.to_string()).await?;

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|e| e.trim_matches('"').to_string());
        tracing::debug!(dest = %self.dest, blocks = self.blocks.len(), "Committed block list");
        Ok(ObjectDescriptor::object(self.dest.clone(), self.committed)
            .with_etag(etag)
            .with_checksum(md5))
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        // Uncommitted blocks are garbage collected by the service
        tracing::debug!(dest = %self.dest, blocks = self.blocks.len(), "Dropped staged blocks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{http_response, mock_server, store};
    use nb_core::{Checksum, ObjectStore};

    #[test]
    fn test_block_ids_have_equal_length() {
        assert_eq!(block_id(0).len(), block_id(99_999).len());
        assert_ne!(block_id(1), block_id(2));
    }

    #[test]
    fn test_with_query() {
        assert_eq!(with_query("https://a/c/b", "comp=block"), "https://a/c/b?comp=block");
        assert_eq!(
            with_query("https://a/c/b?sig=x", "comp=block"),
            "https://a/c/b?sig=x&comp=block"
        );
    }

    #[tokio::test]
    async fn test_blocks_then_block_list() {
        let (url, mut requests) = mock_server(vec![
            http_response("201 Created", &[], ""),
            http_response("201 Created", &[], ""),
            http_response("201 Created", &[("ETag", "\"0xABC\"")], ""),
        ])
        .await;

        let dest = ResourceUri::parse("az://reports/data.bin").unwrap();
        let mut session = store(&url)
            .begin_upload(
                &dest,
                &PutOptions {
                    chunk_size: Some(4),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(session.write_chunk(Bytes::from_static(b"hello")).await.unwrap(), 4);

        let digests = Digests {
            values: vec![Checksum::new(
                ChecksumAlgorithm::Md5,
                "5d41402abc4b2a76b9719d911017c592",
            )],
        };
        let descriptor = session.finish(&digests).await.unwrap();
        assert_eq!(descriptor.size, Some(5));
        assert_eq!(descriptor.etag.as_deref(), Some("0xABC"));

        let first = requests.recv().await.unwrap();
        assert!(first.starts_with("PUT /reports/data.bin?sv=2021&sig=abc&comp=block&blockid="));
        assert!(first.ends_with("hell"));
        let second = requests.recv().await.unwrap();
        assert!(second.ends_with("\r\n\r\no"));
        let list = requests.recv().await.unwrap();
        assert!(list.contains("comp=blocklist"));
        assert!(
            list.to_lowercase()
                .contains("x-ms-blob-content-md5: xufakrxlkna5cz2rebffkg==")
        );
        assert!(list.contains(&format!("<Latest>{}</Latest>", block_id(1))));
    }
}
