//! JSON API resources

use std::collections::HashMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use jiff::Timestamp;
use nb_core::{Checksum, ObjectDescriptor, ResourceUri, Result, Scheme};
use serde::Deserialize;

/// Object resource
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GcsObject {
    pub name: String,
    pub bucket: Option<String>,
    /// Decimal string
    pub size: Option<String>,
    pub updated: Option<Timestamp>,
    /// Base64 MD5, absent for composite objects
    pub md5_hash: Option<String>,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl GcsObject {
    pub fn size(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn checksum(&self) -> Option<Checksum> {
        let encoded = self.md5_hash.as_deref()?;
        let raw = BASE64.decode(encoded).ok()?;
        (raw.len() == 16).then(|| Checksum::md5_from_bytes(&raw))
    }

    pub fn into_descriptor(self, bucket: &str) -> Result<ObjectDescriptor> {
        let uri = ResourceUri::new(Scheme::Gcs, bucket, &self.name)?;
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri));
        }
        let mut descriptor = ObjectDescriptor::object(uri, self.size())
            .with_last_modified(self.updated)
            .with_checksum(self.checksum())
            .with_etag(self.etag.clone());
        descriptor.metadata = self.metadata;
        if let Some(ct) = self.content_type {
            descriptor.metadata.insert("content-type".to_string(), ct);
        }
        Ok(descriptor)
    }
}

/// Response of `objects.list`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ObjectList {
    #[serde(default)]
    pub items: Vec<GcsObject>,
    #[serde(default)]
    pub prefixes: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Response of `objects.rewrite`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RewriteResponse {
    pub total_bytes_rewritten: String,
    pub object_size: String,
    pub done: bool,
    pub rewrite_token: Option<String>,
    pub resource: Option<GcsObject>,
}

impl RewriteResponse {
    pub fn rewritten(&self) -> u64 {
        self.total_bytes_rewritten.parse().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.object_size.parse().unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorReason>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ErrorReason {
    #[serde(default)]
    pub reason: String,
}
