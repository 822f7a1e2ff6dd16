//! S3 client implementation
//!
//! Wraps aws-sdk-s3 and implements the ObjectStore trait from nb-core.

use std::ops::Range;

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream as SdkByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_smithy_types::DateTime;
use jiff::Timestamp;
use nb_core::{
    ByteStream, Checksum, ChecksumAlgorithm, Error, ListOptions, ListPage, MultipartCopy,
    ObjectDescriptor, ObjectStore, PartInfo, PutOptions, ResourceUri, Result, Scheme,
    UploadSession,
};
use serde::Deserialize;

use crate::upload::{S3UploadSession, UploadTarget};

/// Keys per DeleteObjects request
const DELETE_BATCH: usize = 1000;

/// Connection parameters for an S3-compatible endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Custom endpoint; AWS when unset
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub session_token: Option<String>,
    /// Path-style addressing (`endpoint/bucket/key`)
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key: None,
            secret_key: None,
            session_token: None,
            path_style: false,
        }
    }
}

/// S3 object store
#[derive(Debug, Clone)]
pub struct S3Store {
    inner: aws_sdk_s3::Client,
}

impl S3Store {
    /// Create a new store from connection parameters
    pub async fn new(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Static keys win over the default credential chain
        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = aws_credential_types::Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                "nb-static-credentials",
            );
            loader = loader.credentials_provider(credentials);
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.path_style)
            .build();

        tracing::debug!(
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            region = %config.region,
            "Created S3 client"
        );
        Ok(Self::from_client(aws_sdk_s3::Client::from_conf(s3_config)))
    }

    /// Wrap an already configured SDK client
    pub fn from_client(inner: aws_sdk_s3::Client) -> Self {
        Self { inner }
    }

    /// Get the underlying aws-sdk-s3 client
    pub fn inner(&self) -> &aws_sdk_s3::Client {
        &self.inner
    }

    fn uri(bucket: &str, key: &str) -> Result<ResourceUri> {
        ResourceUri::new(Scheme::S3, bucket, key)
    }

    fn descriptor_from_head(
        uri: &ResourceUri,
        size: Option<i64>,
        modified: Option<&DateTime>,
        etag: Option<&str>,
        content_type: Option<&str>,
    ) -> ObjectDescriptor {
        let etag = etag.map(normalize_etag);
        let mut descriptor = ObjectDescriptor::object(uri.clone(), size.unwrap_or(0).max(0) as u64)
            .with_last_modified(modified.and_then(|dt| Timestamp::from_second(dt.secs()).ok()))
            .with_checksum(etag.as_deref().and_then(Checksum::from_etag))
            .with_etag(etag);
        if let Some(ct) = content_type {
            descriptor
                .metadata
                .insert("content-type".to_string(), ct.to_string());
        }
        descriptor
    }

    async fn head(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        let response = self
            .inner
            .head_object()
            .bucket(uri.authority())
            .key(uri.key())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, uri))?;

        Ok(Self::descriptor_from_head(
            uri,
            response.content_length(),
            response.last_modified(),
            response.e_tag(),
            response.content_type(),
        ))
    }

    /// All keys below a prefix
    async fn keys_under(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let response = self
                .inner
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &format!("{bucket}/{prefix}")))?;
            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );
            match response.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_keys(&self, bucket: &str, keys: Vec<String>) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects = batch
                .iter()
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::General(e.to_string()))?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| Error::General(e.to_string()))?;

            let response = self
                .inner
                .delete_objects()
                .bucket(bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| map_sdk_error(e, &bucket))?;

            if !response.errors().is_empty() {
                let failed: Vec<&str> = response.errors().iter().filter_map(|e| e.key()).collect();
                tracing::warn!(bucket, ?failed, "Failed to delete some objects");
                return Err(Error::General(format!(
                    "failed to delete {} objects in {bucket}",
                    failed.len()
                )));
            }
        }
        Ok(())
    }
}

/// Strip the quotes S3 puts around ETags
pub(crate) fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

/// `x-amz-copy-source` value: bucket and URL-encoded key
pub(crate) fn copy_source(uri: &ResourceUri) -> String {
    let key = urlencoding::encode(uri.key()).replace("%2F", "/");
    format!("{}/{key}", uri.authority())
}

/// Map an S3 error code and HTTP status to an nb-core error
pub(crate) fn classify(code: Option<&str>, status: u16, target: &str, message: String) -> Error {
    match code {
        Some("NoSuchKey" | "NoSuchBucket" | "NotFound" | "NoSuchUpload") => {
            return Error::NotFound(target.to_string());
        }
        Some("AccessDenied" | "Forbidden" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
            return Error::PermissionDenied(format!("{target}: {message}"));
        }
        Some(
            "SlowDown" | "InternalError" | "ServiceUnavailable" | "RequestTimeout"
            | "RequestTimeTooSkewed",
        ) => return Error::TransientNetwork(format!("{target}: {message}")),
        _ => {}
    }
    match status {
        404 => Error::NotFound(target.to_string()),
        403 => Error::PermissionDenied(format!("{target}: {message}")),
        408 | 429 | 500..=599 => Error::TransientNetwork(format!("{target}: {message}")),
        _ => Error::Network(format!("{target}: {message}")),
    }
}

/// Convert an SDK error, treating transport failures as transient
pub(crate) fn map_sdk_error<E>(error: SdkError<E>, target: &impl std::fmt::Display) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let target = target.to_string();
    match &error {
        SdkError::ServiceError(service_err) => {
            let err = service_err.err();
            let status = service_err.raw().status().as_u16();
            let message = err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            classify(err.code(), status, &target, message)
        }
        SdkError::TimeoutError(_) => Error::TransientNetwork(format!("{target}: request timeout")),
        SdkError::DispatchFailure(err) => {
            Error::TransientNetwork(format!("{target}: network dispatch error: {err:?}"))
        }
        SdkError::ResponseError(err) => {
            Error::TransientNetwork(format!("{target}: response error: {err:?}"))
        }
        SdkError::ConstructionFailure(err) => {
            Error::General(format!("{target}: request construction failed: {err:?}"))
        }
        _ => Error::Network(format!("{target}: {error}")),
    }
}

/// CopyObject can fail after S3 answered 200; the error then lives in the body
fn map_copy_error<E>(error: SdkError<E>, target: &impl std::fmt::Display) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    if let SdkError::ServiceError(service_err) = &error
        && service_err.raw().status().as_u16() == 200
    {
        let err = service_err.err();
        let message = format!("{target}: {}", err.message().unwrap_or("copy failed"));
        let retryable = matches!(
            err.code(),
            Some("InternalError" | "SlowDown" | "ServiceUnavailable")
        );
        return Error::EmbeddedCopy { message, retryable };
    }
    map_sdk_error(error, target)
}

#[async_trait]
impl ObjectStore for S3Store {
    fn scheme(&self) -> Scheme {
        Scheme::S3
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        Some(ChecksumAlgorithm::Md5)
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let bucket = uri.authority();
        let base = uri.as_dir();
        let prefix = format!("{}{}", base.key(), options.prefix.as_deref().unwrap_or(""));

        let mut request = self.inner.list_objects_v2().bucket(bucket);
        if !prefix.is_empty() {
            request = request.prefix(&prefix);
        }
        if let Some(delimiter) = options.effective_delimiter() {
            request = request.delimiter(delimiter);
        }
        if let Some(max) = options.page_size {
            request = request.max_keys(max.min(i32::MAX as usize) as i32);
        }
        if let Some(token) = &options.page_token {
            request = request.continuation_token(token);
        }

        let response = request.send().await.map_err(|e| {
            match map_sdk_error(e, uri) {
                Error::Network(msg) if options.page_token.is_some() => Error::InvalidPageToken(msg),
                other => other,
            }
        })?;

        let mut items = Vec::new();
        for common in response.common_prefixes() {
            if let Some(p) = common.prefix() {
                items.push(ObjectDescriptor::directory(Self::uri(bucket, p)?));
            }
        }
        for object in response.contents() {
            let key = object.key().unwrap_or_default();
            // The directory marker of the listed prefix itself
            if key == prefix && key.ends_with('/') {
                continue;
            }
            let child = Self::uri(bucket, key)?;
            let descriptor = if key.ends_with('/') {
                ObjectDescriptor::directory(child)
            } else {
                let etag = object.e_tag().map(normalize_etag);
                ObjectDescriptor::object(child, object.size().unwrap_or(0).max(0) as u64)
                    .with_last_modified(
                        object
                            .last_modified()
                            .and_then(|dt| Timestamp::from_second(dt.secs()).ok()),
                    )
                    .with_checksum(etag.as_deref().and_then(Checksum::from_etag))
                    .with_etag(etag)
            };
            items.push(descriptor);
        }
        items.sort_by(|a, b| a.uri.path().cmp(b.uri.path()));

        let next_page_token = if response.is_truncated().unwrap_or(false) {
            response.next_continuation_token().map(str::to_string)
        } else {
            None
        };
        Ok(ListPage {
            items,
            next_page_token,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri.clone()));
        }
        self.head(uri).await
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        let mut request = self
            .inner
            .get_object()
            .bucket(uri.authority())
            .key(uri.key());
        if offset > 0 {
            request = request.range(format!("bytes={offset}-"));
        }

        let response = match request.send().await {
            Ok(response) => response,
            // Reading from the end of the object
            Err(SdkError::ServiceError(e)) if e.err().code() == Some("InvalidRange") => {
                return Ok(Box::pin(futures::stream::empty()));
            }
            Err(e) => return Err(map_sdk_error(e, uri)),
        };

        let target = uri.to_string();
        let stream = futures::stream::unfold(
            Some(response.body),
            move |body: Option<SdkByteStream>| {
                let target = target.clone();
                async move {
                    let mut body = body?;
                    match body.next().await? {
                        Ok(chunk) => Some((Ok(chunk), Some(body))),
                        Err(e) => Some((
                            Err(Error::TransientNetwork(format!("{target}: {e}"))),
                            None,
                        )),
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        let target = UploadTarget::new(self.inner.clone(), dest.clone());
        let session = S3UploadSession::begin(target, options).await?;
        Ok(Box::new(session))
    }

    fn resumable_uploads(&self) -> bool {
        true
    }

    async fn resume_upload(
        &self,
        dest: &ResourceUri,
        token: &str,
    ) -> Result<Box<dyn UploadSession>> {
        let target = UploadTarget::new(self.inner.clone(), dest.clone());
        let session = S3UploadSession::resume(target, token).await?;
        Ok(Box::new(session))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        let bucket = uri.authority();
        if !uri.is_dir() {
            // DeleteObject succeeds for missing keys
            self.head(uri).await?;
            self.inner
                .delete_object()
                .bucket(bucket)
                .key(uri.key())
                .send()
                .await
                .map_err(|e| map_sdk_error(e, uri))?;
            tracing::debug!(%uri, "Deleted object");
            return Ok(());
        }

        let keys = self.keys_under(bucket, uri.key()).await?;
        if keys.is_empty() {
            return Err(Error::NotFound(uri.to_string()));
        }
        let children = keys.iter().filter(|k| k.as_str() != uri.key()).count();
        if children > 0 && !recursive {
            return Err(Error::DirectoryNotEmpty(uri.to_string()));
        }
        let count = keys.len();
        self.delete_keys(bucket, keys).await?;
        tracing::debug!(%uri, count, "Deleted prefix");
        Ok(())
    }

    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        if src.is_dir() {
            return Err(Error::NotSupported(format!(
                "{src} is a directory; copy its objects individually"
            )));
        }
        self.inner
            .copy_object()
            .copy_source(copy_source(src))
            .bucket(dest.authority())
            .key(dest.key())
            .send()
            .await
            .map_err(|e| map_copy_error(e, src))?;

        // Size and content type are only available from HEAD
        self.head(dest).await
    }

    async fn mkdir(&self, uri: &ResourceUri) -> Result<()> {
        if uri.is_root() {
            return Ok(());
        }
        let marker = uri.as_dir();
        self.inner
            .put_object()
            .bucket(marker.authority())
            .key(marker.key())
            .body(SdkByteStream::from_static(b""))
            .send()
            .await
            .map_err(|e| map_sdk_error(e, &marker))?;
        Ok(())
    }

    fn multipart_copy(&self) -> Option<&dyn MultipartCopy> {
        Some(self)
    }
}

#[async_trait]
impl MultipartCopy for S3Store {
    async fn create_multipart(&self, dest: &ResourceUri) -> Result<String> {
        let response = self
            .inner
            .create_multipart_upload()
            .bucket(dest.authority())
            .key(dest.key())
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;
        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::General(format!("{dest}: missing upload id")))
    }

    async fn copy_part(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> Result<PartInfo> {
        let response = self
            .inner
            .upload_part_copy()
            .copy_source(copy_source(src))
            .copy_source_range(format!("bytes={}-{}", range.start, range.end - 1))
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .send()
            .await
            .map_err(|e| map_copy_error(e, src))?;

        let etag = response
            .copy_part_result()
            .and_then(|r| r.e_tag())
            .map(normalize_etag)
            .ok_or_else(|| Error::General(format!("{dest}: part {part_number} has no ETag")))?;
        tracing::trace!(%dest, part_number, "Copied part");
        Ok(PartInfo {
            part_number,
            etag,
            size: range.end - range.start,
        })
    }

    async fn list_parts(&self, dest: &ResourceUri, upload_id: &str) -> Result<Vec<PartInfo>> {
        crate::upload::list_parts(&self.inner, dest, upload_id).await
    }

    async fn complete_multipart(
        &self,
        dest: &ResourceUri,
        upload_id: &str,
        mut parts: Vec<PartInfo>,
    ) -> Result<ObjectDescriptor> {
        parts.sort_by_key(|p| p.part_number);
        let completed = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(format!("\"{}\"", p.etag))
                    .build()
            })
            .collect();
        self.inner
            .complete_multipart_upload()
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| map_copy_error(e, dest))?;
        self.head(dest).await
    }

    async fn abort_multipart(&self, dest: &ResourceUri, upload_id: &str) -> Result<()> {
        self.inner
            .abort_multipart_upload()
            .bucket(dest.authority())
            .key(dest.key())
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error(e, dest))?;
        tracing::debug!(%dest, upload_id, "Aborted multipart upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_source_encodes_key() {
        let uri = ResourceUri::parse("s3://bucket/reports/q1 final+draft.pdf").unwrap();
        assert_eq!(copy_source(&uri), "bucket/reports/q1%20final%2Bdraft.pdf");
    }

    #[test]
    fn test_classify_codes() {
        assert!(matches!(
            classify(Some("NoSuchKey"), 404, "s3://b/k", String::new()),
            Error::NotFound(_)
        ));
        assert!(matches!(
            classify(Some("AccessDenied"), 403, "s3://b/k", "denied".into()),
            Error::PermissionDenied(_)
        ));
        assert!(classify(Some("SlowDown"), 503, "s3://b/k", String::new()).is_retryable());
        assert!(classify(None, 500, "s3://b/k", String::new()).is_retryable());
        assert!(!classify(Some("InvalidArgument"), 400, "s3://b/k", String::new()).is_retryable());
        assert!(matches!(
            classify(None, 404, "s3://b/k", String::new()),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_descriptor_from_head() {
        let uri = ResourceUri::parse("s3://bucket/a.txt").unwrap();
        let descriptor = S3Store::descriptor_from_head(
            &uri,
            Some(11),
            None,
            Some("\"5eb63bbbe01eeed093cb22bb8f5acdc3\""),
            Some("text/plain"),
        );
        assert_eq!(descriptor.size, Some(11));
        assert_eq!(
            descriptor.etag.as_deref(),
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3")
        );
        assert_eq!(
            descriptor.content_checksum,
            Some(Checksum::new(
                ChecksumAlgorithm::Md5,
                "5eb63bbbe01eeed093cb22bb8f5acdc3"
            ))
        );
        assert_eq!(descriptor.metadata["content-type"], "text/plain");

        // Multipart ETags are not content hashes
        let multipart =
            S3Store::descriptor_from_head(&uri, Some(11), None, Some("\"abc-3\""), None);
        assert!(multipart.content_checksum.is_none());
    }

    #[test]
    fn test_config_defaults() {
        let config: S3Config = serde_json::from_str(r#"{"endpoint":"http://localhost:9000"}"#).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert!(!config.path_style);
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
    }
}
