//! XML bodies of the Blob service

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use nb_core::{Checksum, ObjectDescriptor, ResourceUri, Result, Scheme};
use serde::Deserialize;

/// Response of List Blobs
#[derive(Debug, Deserialize)]
#[serde(rename = "EnumerationResults")]
pub(crate) struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    pub blobs: Blobs,
    #[serde(rename = "NextMarker", default)]
    pub next_marker: Option<String>,
}

impl EnumerationResults {
    pub fn parse(body: &str) -> Result<Self> {
        quick_xml::de::from_str(body)
            .map_err(|e| nb_core::Error::General(format!("invalid blob listing: {e}")))
    }

    /// Continuation marker; the service sends an empty element on the last page
    pub fn next_marker(&self) -> Option<String> {
        self.next_marker.clone().filter(|m| !m.is_empty())
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Blobs {
    #[serde(rename = "$value", default)]
    pub entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
pub(crate) enum Entry {
    Blob(BlobItem),
    BlobPrefix(PrefixItem),
}

#[derive(Debug, Deserialize)]
pub(crate) struct PrefixItem {
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct BlobItem {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Properties")]
    pub properties: BlobProperties,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct BlobProperties {
    #[serde(rename = "Content-Length", default)]
    pub content_length: Option<u64>,
    #[serde(rename = "Last-Modified", default)]
    pub last_modified: Option<String>,
    #[serde(rename = "Etag", default)]
    pub etag: Option<String>,
    #[serde(rename = "Content-Type", default)]
    pub content_type: Option<String>,
    #[serde(rename = "Content-MD5", default)]
    pub content_md5: Option<String>,
}

/// Decode a base64 Content-MD5 value
pub(crate) fn md5_checksum(encoded: Option<&str>) -> Option<Checksum> {
    let raw = BASE64.decode(encoded?.trim()).ok()?;
    (raw.len() == 16).then(|| Checksum::md5_from_bytes(&raw))
}

/// Parse an HTTP date (`Mon, 01 May 2024 10:00:00 GMT`)
pub(crate) fn http_date(value: Option<&str>) -> Option<jiff::Timestamp> {
    jiff::fmt::rfc2822::DateTimeParser::new()
        .parse_timestamp(value?)
        .ok()
}

impl BlobItem {
    pub fn into_descriptor(self, container: &str) -> Result<ObjectDescriptor> {
        let uri = ResourceUri::new(Scheme::Azure, container, &self.name)?;
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri));
        }
        let props = self.properties;
        let mut descriptor = ObjectDescriptor::object(uri, props.content_length.unwrap_or(0))
            .with_last_modified(http_date(props.last_modified.as_deref()))
            .with_checksum(md5_checksum(props.content_md5.as_deref()))
            .with_etag(props.etag.map(|e| e.trim_matches('"').to_string()));
        if let Some(ct) = props.content_type {
            descriptor.metadata.insert("content-type".to_string(), ct);
        }
        Ok(descriptor)
    }
}

/// Body of Put Block List
pub(crate) fn block_list(ids: &[String]) -> String {
    let mut body = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        body.push_str("<Latest>");
        body.push_str(id);
        body.push_str("</Latest>");
    }
    body.push_str("</BlockList>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ServiceEndpoint="https://acct.blob.core.windows.net/" ContainerName="reports">
  <Prefix>2024/</Prefix>
  <Delimiter>/</Delimiter>
  <Blobs>
    <Blob>
      <Name>2024/summary.pdf</Name>
      <Properties>
        <Last-Modified>Wed, 01 May 2024 10:00:00 GMT</Last-Modified>
        <Etag>0x8DC69C1A2B3C4D5</Etag>
        <Content-Length>11</Content-Length>
        <Content-Type>application/pdf</Content-Type>
        <Content-MD5>XrY7u+Ae7tCTyyK7j1rNww==</Content-MD5>
        <BlobType>BlockBlob</BlobType>
      </Properties>
    </Blob>
    <BlobPrefix>
      <Name>2024/q1/</Name>
    </BlobPrefix>
    <Blob>
      <Name>2024/z.csv</Name>
      <Properties>
        <Content-Length>0</Content-Length>
      </Properties>
    </Blob>
  </Blobs>
  <NextMarker>2!72!MDAwMDE</NextMarker>
</EnumerationResults>"#;

    #[test]
    fn test_parse_listing() {
        let results = EnumerationResults::parse(LISTING).unwrap();
        assert_eq!(results.blobs.entries.len(), 3);
        assert_eq!(results.next_marker().as_deref(), Some("2!72!MDAwMDE"));

        let mut blobs = Vec::new();
        let mut prefixes = Vec::new();
        for entry in results.blobs.entries {
            match entry {
                Entry::Blob(blob) => blobs.push(blob),
                Entry::BlobPrefix(prefix) => prefixes.push(prefix.name),
            }
        }
        assert_eq!(prefixes, vec!["2024/q1/"]);

        let descriptor = blobs.remove(0).into_descriptor("reports").unwrap();
        assert_eq!(descriptor.uri.to_string(), "az://reports/2024/summary.pdf");
        assert_eq!(descriptor.size, Some(11));
        assert_eq!(
            descriptor.content_checksum.unwrap().value,
            "5eb63bbbe01eeed093cb22bb8f5acdc3"
        );
        assert_eq!(descriptor.etag.as_deref(), Some("0x8DC69C1A2B3C4D5"));
        assert!(descriptor.last_modified.is_some());
    }

    #[test]
    fn test_empty_listing() {
        let body = r#"<?xml version="1.0" encoding="utf-8"?>
<EnumerationResults ContainerName="empty"><Blobs /><NextMarker /></EnumerationResults>"#;
        let results = EnumerationResults::parse(body).unwrap();
        assert!(results.blobs.entries.is_empty());
        assert!(results.next_marker().is_none());
    }

    #[test]
    fn test_block_list_body() {
        let body = block_list(&["AAA=".to_string(), "AAE=".to_string()]);
        assert!(body.ends_with("<BlockList><Latest>AAA=</Latest><Latest>AAE=</Latest></BlockList>"));
    }

    #[test]
    fn test_http_date() {
        let ts = http_date(Some("Wed, 01 May 2024 10:00:00 GMT")).unwrap();
        assert_eq!(ts.as_second(), 1_714_557_600);
        assert!(http_date(Some("yesterday")).is_none());
    }
}
