//! Asset metadata records

use std::collections::HashMap;

use jiff::Timestamp;
use nb_core::{Checksum, ChecksumAlgorithm, ObjectDescriptor, ResourceUri, Result, Scheme};
use serde::{Deserialize, Serialize};

/// One registered asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// Path within the namespace
    pub path: String,
    /// Content digest, `blake3:<hex>`
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<Timestamp>,
    /// Snapshots pinning this asset
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub snapshots: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AssetRecord {
    /// Hex BLAKE3 digest without the algorithm prefix
    pub fn blake3_hex(&self) -> &str {
        self.digest.strip_prefix("blake3:").unwrap_or(&self.digest)
    }

    pub fn into_descriptor(self, namespace: &str) -> Result<ObjectDescriptor> {
        let uri = ResourceUri::new(Scheme::Asset, namespace, &self.path)?;
        let checksum = Checksum::new(ChecksumAlgorithm::Blake3, self.blake3_hex());
        let mut descriptor = ObjectDescriptor::object(uri, self.size)
            .with_last_modified(self.created_at)
            .with_etag(Some(self.digest.clone()))
            .with_checksum(Some(checksum));
        descriptor.metadata = self.metadata;
        if let Some(ct) = self.content_type {
            descriptor.metadata.insert("content-type".to_string(), ct);
        }
        if !self.snapshots.is_empty() {
            descriptor
                .metadata
                .insert("snapshots".to_string(), self.snapshots.join(","));
        }
        Ok(descriptor)
    }
}

/// Result of `assets.list`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetPage {
    #[serde(default)]
    pub items: Vec<AssetRecord>,
    /// Folded path prefixes when a delimiter was given
    #[serde(default)]
    pub prefixes: Vec<String>,
    #[serde(default)]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_into_descriptor() {
        let json = r#"{
            "path": "checkpoints/llama.safetensors",
            "digest": "blake3:d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24",
            "size": 11,
            "content_type": "application/octet-stream",
            "created_at": "2024-06-01T12:00:00Z",
            "snapshots": ["snap-1", "snap-2"]
        }"#;
        let record: AssetRecord = serde_json::from_str(json).unwrap();
        let descriptor = record.into_descriptor("models").unwrap();

        assert_eq!(
            descriptor.uri.to_string(),
            "asset://models/checkpoints/llama.safetensors"
        );
        assert_eq!(descriptor.size, Some(11));
        let checksum = descriptor.content_checksum.unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Blake3);
        assert!(checksum.value.starts_with("d74981ef"));
        assert_eq!(descriptor.metadata["snapshots"], "snap-1,snap-2");
    }

    #[test]
    fn test_page_defaults() {
        let page: AssetPage = serde_json::from_str("{}").unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
    }
}
