//! Provider abstraction
//!
//! `ObjectStore` is the uniform capability set every backend implements.
//! Server-side copy protocols that only some backends offer are exposed as
//! optional capability traits reached through accessor methods, so the
//! executor can ask a store what it supports without knowing its type.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::checksum::{Checksum, ChecksumAlgorithm, Digests};
use crate::error::{Error, Result};
use crate::transfer;
use crate::uri::{ResourceUri, Scheme};

/// Stream of object content chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Metadata for a file, object, blob, asset or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectDescriptor {
    pub uri: ResourceUri,
    pub name: String,
    /// Size in bytes, absent for synthesized directories
    pub size: Option<u64>,
    pub last_modified: Option<Timestamp>,
    pub etag: Option<String>,
    /// Checksum as reported by the backend
    pub content_checksum: Option<Checksum>,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ObjectDescriptor {
    /// Descriptor for a regular object
    pub fn object(uri: ResourceUri, size: u64) -> Self {
        let name = uri.name().to_string();
        Self {
            uri,
            name,
            size: Some(size),
            last_modified: None,
            etag: None,
            content_checksum: None,
            is_directory: false,
            metadata: HashMap::new(),
        }
    }

    /// Descriptor for a directory or common prefix
    pub fn directory(uri: ResourceUri) -> Self {
        let uri = uri.as_dir();
        let name = uri.name().to_string();
        Self {
            uri,
            name,
            size: None,
            last_modified: None,
            etag: None,
            content_checksum: None,
            is_directory: true,
            metadata: HashMap::new(),
        }
    }

    pub fn with_last_modified(mut self, ts: Option<Timestamp>) -> Self {
        self.last_modified = ts;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<Checksum>) -> Self {
        self.content_checksum = checksum;
        self
    }
}

/// Options for listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only return names starting with this string (relative to the listed URI)
    pub prefix: Option<String>,
    /// Delimiter used to fold keys into directories, `/` when unset
    pub delimiter: Option<String>,
    /// List the whole subtree instead of one level
    pub recursive: bool,
    /// Continuation token from a previous page
    pub page_token: Option<String>,
    /// Maximum entries per page, backend default when unset
    pub page_size: Option<usize>,
}

impl ListOptions {
    /// Delimiter to send to the backend; `None` for recursive listings
    pub fn effective_delimiter(&self) -> Option<&str> {
        if self.recursive {
            None
        } else {
            Some(self.delimiter.as_deref().unwrap_or("/"))
        }
    }

    pub fn with_page_token(mut self, token: Option<String>) -> Self {
        self.page_token = token;
        self
    }
}

/// One page of listing results
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<ObjectDescriptor>,
    pub next_page_token: Option<String>,
}

/// Options for uploads
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Total size when known in advance
    pub size_hint: Option<u64>,
    /// Preferred chunk size; the backend rounds it to its own constraints
    pub chunk_size: Option<u64>,
}

/// An in-progress upload of one object
///
/// Data is written sequentially. A session may buffer data until it has a
/// full chunk, so `committed()` can lag behind what was written. After a
/// failed `write_chunk` the caller calls `query_committed()`, which drops
/// any buffered bytes, and continues feeding from the returned offset.
#[async_trait]
pub trait UploadSession: Send {
    /// Chunk granularity of the backend protocol
    fn chunk_size(&self) -> u64;

    /// Bytes durably stored by the backend
    fn committed(&self) -> u64;

    /// Opaque token that lets `ObjectStore::resume_upload` reattach
    fn resume_token(&self) -> Option<String>;

    /// Append data at the current write position, returning the new committed offset
    async fn write_chunk(&mut self, data: Bytes) -> Result<u64>;

    /// Ask the backend how much has been committed and rewind to it
    async fn query_committed(&mut self) -> Result<u64>;

    /// Flush remaining data and make the object visible
    async fn finish(self: Box<Self>, digests: &Digests) -> Result<ObjectDescriptor>;

    /// Discard the upload and any staged data
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// A part of a multipart object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// Server-side multipart copy (create, copy parts, complete)
#[async_trait]
pub trait MultipartCopy: Send + Sync {
    /// Start a multipart upload at `dest`, returning its upload id
    async fn create_multipart(&self, dest: &ResourceUri) -> Result<String>;

    /// Copy `range` of `src` into part `part_number`
    async fn copy_part(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        upload_id: &str,
        part_number: u32,
        range: Range<u64>,
    ) -> Result<PartInfo>;

    /// Parts the backend has committed for this upload
    async fn list_parts(&self, dest: &ResourceUri, upload_id: &str) -> Result<Vec<PartInfo>>;

    async fn complete_multipart(
        &self,
        dest: &ResourceUri,
        upload_id: &str,
        parts: Vec<PartInfo>,
    ) -> Result<ObjectDescriptor>;

    async fn abort_multipart(&self, dest: &ResourceUri, upload_id: &str) -> Result<()>;
}

/// Result of one rewrite round
#[derive(Debug, Clone)]
pub struct RewriteStatus {
    pub done: bool,
    /// Continuation token for the next round
    pub token: Option<String>,
    pub bytes_rewritten: u64,
    pub total: u64,
    /// Final object, present once `done`
    pub descriptor: Option<ObjectDescriptor>,
}

/// Iterative server-side copy driven by a continuation token
#[async_trait]
pub trait RewriteCopy: Send + Sync {
    async fn rewrite(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        token: Option<String>,
    ) -> Result<RewriteStatus>;
}

/// Handle of an accepted asynchronous copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyHandle {
    pub copy_id: String,
    /// Source ETag observed when the copy was accepted
    pub source_etag: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyState {
    Pending,
    Success,
    Failed,
    Aborted,
}

/// Status of an asynchronous copy
#[derive(Debug, Clone)]
pub struct CopyProgress {
    pub state: CopyState,
    pub bytes_copied: u64,
    pub total: Option<u64>,
    pub description: Option<String>,
    /// Source ETag the backend is copying from, when reported
    pub source_etag: Option<String>,
}

/// Copy that the backend completes in the background
#[async_trait]
pub trait AsyncCopy: Send + Sync {
    async fn start_copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<CopyHandle>;

    async fn copy_status(&self, dest: &ResourceUri, copy_id: &str) -> Result<CopyProgress>;

    async fn abort_copy(&self, dest: &ResourceUri, copy_id: &str) -> Result<()>;
}

/// Uniform object operations implemented by every backend
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug + 'static {
    fn scheme(&self) -> Scheme;

    /// Checksum algorithm the backend reports by itself
    fn native_checksum(&self) -> Option<ChecksumAlgorithm>;

    /// List one page of entries below `uri`, ordered by name
    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage>;

    /// Metadata of a single object or directory
    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor>;

    /// Whether `uri` exists; absence is not an error
    async fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        match self.stat(uri).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Stream object content starting at `offset`
    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream>;

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>>;

    /// Whether upload sessions survive a restart through `resume_upload`
    fn resumable_uploads(&self) -> bool {
        false
    }

    /// Reattach to an upload from its resume token
    async fn resume_upload(
        &self,
        dest: &ResourceUri,
        token: &str,
    ) -> Result<Box<dyn UploadSession>> {
        let _ = token;
        Err(Error::NotSupported(format!(
            "{} uploads cannot be resumed ({dest})",
            self.scheme()
        )))
    }

    /// Download an object to a local file, returning the bytes written
    async fn get(&self, uri: &ResourceUri, dest: &Path) -> Result<u64> {
        transfer::download_to_path(self, uri, dest).await
    }

    /// Upload a local file
    async fn put(
        &self,
        src: &Path,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<ObjectDescriptor> {
        transfer::upload_from_path(self, src, dest, options).await
    }

    /// Delete an object, or a directory when `recursive` is set
    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()>;

    /// Server-side copy within this backend
    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor>;

    /// Move within this backend; copy then delete unless overridden
    async fn move_object(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        let descriptor = self.copy(src, dest).await?;
        self.delete(src, false).await?;
        Ok(descriptor)
    }

    /// Whether `move_object` is a single atomic rename
    fn native_rename(&self) -> bool {
        false
    }

    async fn mkdir(&self, uri: &ResourceUri) -> Result<()>;

    fn multipart_copy(&self) -> Option<&dyn MultipartCopy> {
        None
    }

    fn rewrite_copy(&self) -> Option<&dyn RewriteCopy> {
        None
    }

    fn async_copy(&self) -> Option<&dyn AsyncCopy> {
        None
    }
}
