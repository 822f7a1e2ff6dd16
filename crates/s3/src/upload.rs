//! Resumable S3 uploads on top of the multipart API
//!
//! Data is buffered until a full part is available and each part is sent
//! with its Content-MD5. Objects that fit in one part skip multipart and are
//! written with a single PutObject on finish.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Bytes, BytesMut};
use md5::{Digest, Md5};
use nb_core::{
    Checksum, Digests, Error, ObjectDescriptor, PartInfo, PutOptions, ResourceUri, Result,
    UploadSession,
};

use crate::client::{map_sdk_error, normalize_etag};

/// S3 rejects non-final parts below 5 MiB
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Part size when the caller has no preference
pub const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Client and destination of one upload
#[derive(Debug, Clone)]
pub(crate) struct UploadTarget {
    client: aws_sdk_s3::Client,
    dest: ResourceUri,
}

impl UploadTarget {
    pub(crate) fn new(client: aws_sdk_s3::Client, dest: ResourceUri) -> Self {
        Self { client, dest }
    }
}

#[derive(Debug)]
pub(crate) struct S3UploadSession {
    target: UploadTarget,
    part_size: u64,
    /// None while the object is small enough for a single PutObject
    upload_id: Option<String>,
    parts: Vec<PartInfo>,
    committed: u64,
    buffer: BytesMut,
    content_type: Option<String>,
}

/// Encode the resume token for an upload
fn encode_token(part_size: u64, upload_id: &str) -> String {
    format!("{part_size}:{upload_id}")
}

fn decode_token(token: &str) -> Result<(u64, &str)> {
    let invalid = || Error::General(format!("invalid S3 resume token: {token}"));
    let (size, upload_id) = token.split_once(':').ok_or_else(invalid)?;
    let size = size.parse::<u64>().map_err(|_| invalid())?;
    if upload_id.is_empty() || size < MIN_PART_SIZE {
        return Err(invalid());
    }
    Ok((size, upload_id))
}

/// Committed prefix of an upload: consecutive full parts starting at 1
fn contiguous_prefix(mut parts: Vec<PartInfo>, part_size: u64) -> Vec<PartInfo> {
    parts.sort_by_key(|p| p.part_number);
    parts
        .into_iter()
        .enumerate()
        .take_while(|(i, p)| p.part_number as usize == i + 1 && p.size == part_size)
        .map(|(_, p)| p)
        .collect()
}

/// List every part of a multipart upload
pub(crate) async fn list_parts(
    client: &aws_sdk_s3::Client,
    dest: &ResourceUri,
    upload_id: &str,
) -> Result<Vec<PartInfo>> {
    let mut parts = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let response = client
            .list_parts()
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(upload_id)
            .set_part_number_marker(marker.take())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;

        for part in response.parts() {
            if let (Some(number), Some(etag)) = (part.part_number(), part.e_tag()) {
                parts.push(PartInfo {
                    part_number: number.max(0) as u32,
                    etag: normalize_etag(etag),
                    size: part.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
        if !response.is_truncated().unwrap_or(false) {
            break;
        }
        match response.next_part_number_marker() {
            Some(next) => marker = Some(next.to_string()),
            None => break,
        }
    }
    Ok(parts)
}

impl S3UploadSession {
    pub(crate) async fn begin(target: UploadTarget, options: &PutOptions) -> Result<Self> {
        let part_size = options
            .chunk_size
            .unwrap_or(DEFAULT_PART_SIZE)
            .max(MIN_PART_SIZE);
        let mut session = Self {
            target,
            part_size,
            upload_id: None,
            parts: Vec::new(),
            committed: 0,
            buffer: BytesMut::new(),
            content_type: options.content_type.clone(),
        };

        let single_put = options.size_hint.is_some_and(|size| size <= part_size);
        if !single_put {
            session.create().await?;
        }
        Ok(session)
    }

    pub(crate) async fn resume(target: UploadTarget, token: &str) -> Result<Self> {
        let (part_size, upload_id) = decode_token(token)?;
        let mut session = Self {
            target,
            part_size,
            upload_id: Some(upload_id.to_string()),
            parts: Vec::new(),
            committed: 0,
            buffer: BytesMut::new(),
            content_type: None,
        };
        session.sync_parts().await?;
        tracing::debug!(
            dest = %session.target.dest,
            committed = session.committed,
            "Resumed S3 multipart upload"
        );
        Ok(session)
    }

    async fn create(&mut self) -> Result<()> {
        let dest = &self.target.dest;
        let response = self
            .target
            .client
            .create_multipart_upload()
            .bucket(dest.authority())
            .key(dest.key())
            .set_content_type(self.content_type.clone())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;
        let upload_id = response
            .upload_id()
            .ok_or_else(|| Error::General(format!("{dest}: missing upload id")))?;
        self.upload_id = Some(upload_id.to_string());
        Ok(())
    }

    async fn sync_parts(&mut self) -> Result<()> {
        let Some(upload_id) = &self.upload_id else {
            self.committed = 0;
            return Ok(());
        };
        let listed = list_parts(&self.target.client, &self.target.dest, upload_id).await?;
        self.parts = contiguous_prefix(listed, self.part_size);
        self.committed = self.parts.iter().map(|p| p.size).sum();
        Ok(())
    }

    async fn upload_part(&mut self, data: Bytes) -> Result<()> {
        if self.upload_id.is_none() {
            self.create().await?;
        }
        let upload_id = self.upload_id.clone().unwrap_or_default();
        let dest = &self.target.dest;
        let part_number = self.parts.len() as u32 + 1;
        let digest = Md5::digest(&data);
        let size = data.len() as u64;

        let response = self
            .target
            .client
            .upload_part()
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(&upload_id)
            .part_number(part_number as i32)
            .content_md5(BASE64.encode(digest))
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;

        let etag = response.e_tag().map(normalize_etag).unwrap_or_default();
        // Encrypted buckets return ETags that are not MD5 digests
        if let Some(reported) = Checksum::from_etag(&etag) {
            let local = Checksum::md5_from_bytes(&digest);
            if reported != local {
                return Err(Error::IntegrityMismatch(format!(
                    "{dest}: part {part_number} stored as {reported}, sent {local}"
                )));
            }
        }

        tracing::trace!(%dest, part_number, size, "Uploaded part");
        self.parts.push(PartInfo {
            part_number,
            etag,
            size,
        });
        self.committed += size;
        Ok(())
    }

    async fn put_single(&mut self, data: Bytes) -> Result<()> {
        let dest = &self.target.dest;
        let digest = Md5::digest(&data);
        self.target
            .client
            .put_object()
            .bucket(dest.authority())
            .key(dest.key())
            .set_content_type(self.content_type.clone())
            .content_md5(BASE64.encode(digest))
            .body(SdkByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;
        Ok(())
    }

    async fn head(&self) -> Result<ObjectDescriptor> {
        let dest = &self.target.dest;
        let response = self
            .target
            .client
            .head_object()
            .bucket(dest.authority())
            .key(dest.key())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;
        let etag = response.e_tag().map(normalize_etag);
        Ok(
            ObjectDescriptor::object(dest.clone(), response.content_length().unwrap_or(0).max(0) as u64)
                .with_checksum(etag.as_deref().and_then(Checksum::from_etag))
                .with_etag(etag),
        )
    }
}

#[async_trait]
impl UploadSession for S3UploadSession {
    fn chunk_size(&self) -> u64 {
        self.part_size
    }

    fn committed(&self) -> u64 {
        self.committed
    }

    fn resume_token(&self) -> Option<String> {
        self.upload_id
            .as_deref()
            .map(|id| encode_token(self.part_size, id))
    }

    async fn write_chunk(&mut self, data: Bytes) -> Result<u64> {
        self.buffer.extend_from_slice(&data);
        while self.buffer.len() as u64 >= self.part_size {
            let part = self.buffer.split_to(self.part_size as usize).freeze();
            if let Err(e) = self.upload_part(part.clone()).await {
                // Put the part back so a retry without resync sees the same bytes
                let mut restored = BytesMut::from(&part[..]);
                restored.extend_from_slice(&self.buffer);
                self.buffer = restored;
                return Err(e);
            }
        }
        Ok(self.committed)
    }

    async fn query_committed(&mut self) -> Result<u64> {
        self.buffer.clear();
        self.sync_parts().await?;
        Ok(self.committed)
    }

    async fn finish(mut self: Box<Self>, digests: &Digests) -> Result<ObjectDescriptor> {
        let remaining = std::mem::take(&mut self.buffer).freeze();
        let dest = self.target.dest.clone();

        if self.upload_id.is_none() {
            self.put_single(remaining).await?;
        } else {
            if !remaining.is_empty() || self.parts.is_empty() {
                self.upload_part(remaining).await?;
            }
            let upload_id = self.upload_id.clone().unwrap_or_default();
            let completed = self
                .parts
                .iter()
                .map(|p| {
                    CompletedPart::builder()
                        .part_number(p.part_number as i32)
                        .e_tag(format!("\"{}\"", p.etag))
                        .build()
                })
                .collect();
            self.target
                .client
                .complete_multipart_upload()
                .bucket(dest.authority())
                .key(dest.key())
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(completed))
                        .build(),
                )
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &dest))?;
        }

        let mut descriptor = self.head().await?;
        // Multipart ETags carry no digest; keep the one computed while streaming
        if descriptor.content_checksum.is_none() {
            descriptor.content_checksum = digests.get(nb_core::ChecksumAlgorithm::Md5).cloned();
            if descriptor.content_checksum.is_some() {
                descriptor
                    .metadata
                    .insert("checksum-source".to_string(), "client".to_string());
            }
        }
        tracing::debug!(%dest, parts = self.parts.len(), "Completed S3 upload");
        Ok(descriptor)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let Some(upload_id) = &self.upload_id else {
            return Ok(());
        };
        let dest = &self.target.dest;
        let result = self
            .target
            .client
            .abort_multipart_upload()
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest));
        match result {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
