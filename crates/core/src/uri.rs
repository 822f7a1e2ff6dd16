//! Resource URI model
//!
//! Every object nimbus touches is addressed as `scheme://authority/path`:
//! - `file:///home/me/report.pdf` (local filesystem, empty authority)
//! - `s3://bucket/prefix/key`
//! - `gs://bucket/object`
//! - `az://container/blob`
//! - `asset://namespace/model.safetensors`
//!
//! A URI whose path ends in `/` (or is empty) denotes a directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backend selected by the URI scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    /// Local filesystem (`file://`)
    Local,
    /// S3-compatible object storage (`s3://`)
    S3,
    /// Google Cloud Storage compatible (`gs://`)
    Gcs,
    /// Azure Blob compatible (`az://`)
    Azure,
    /// Content-addressed asset store (`asset://`)
    Asset,
}

impl Scheme {
    /// All schemes, in a stable order
    pub const ALL: [Scheme; 5] = [
        Scheme::Local,
        Scheme::S3,
        Scheme::Gcs,
        Scheme::Azure,
        Scheme::Asset,
    ];

    /// The textual prefix used in URIs
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Local => "file",
            Scheme::S3 => "s3",
            Scheme::Gcs => "gs",
            Scheme::Azure => "az",
            Scheme::Asset => "asset",
        }
    }

    /// Whether the backend models directories as key prefixes
    pub fn is_prefix_based(&self) -> bool {
        !matches!(self, Scheme::Local)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Scheme::Local),
            "s3" => Ok(Scheme::S3),
            "gs" => Ok(Scheme::Gcs),
            "az" => Ok(Scheme::Azure),
            "asset" => Ok(Scheme::Asset),
            other => Err(Error::InvalidUri(format!("Unknown scheme: {other}"))),
        }
    }
}

/// A normalized, immutable resource identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceUri {
    scheme: Scheme,
    authority: String,
    path: String,
}

impl ResourceUri {
    /// Build a URI from its parts, normalizing the path
    pub fn new(scheme: Scheme, authority: impl Into<String>, path: &str) -> Result<Self> {
        let authority = authority.into();
        validate_authority(scheme, &authority)?;
        let path = normalize_path(path)?;
        Ok(Self {
            scheme,
            authority,
            path,
        })
    }

    /// The root directory of an authority (bucket, container, namespace)
    pub fn root(scheme: Scheme, authority: impl Into<String>) -> Result<Self> {
        Self::new(scheme, authority, "")
    }

    /// Parse a URI string
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::InvalidUri(format!("Missing scheme separator: {input}")))?;
        let scheme: Scheme = scheme.parse()?;

        let (authority, path) = match rest.split_once('/') {
            Some((authority, path)) => (authority, path),
            None => (rest, ""),
        };

        Self::new(scheme, authority, path)
    }

    /// Build a `file://` URI from an absolute local path
    pub fn from_local_path(path: &Path) -> Result<Self> {
        if !path.is_absolute() {
            return Err(Error::InvalidUri(format!(
                "Local path must be absolute: {}",
                path.display()
            )));
        }
        let text = path.to_string_lossy().replace('\\', "/");
        let trimmed = text.trim_start_matches('/');
        Self::new(Scheme::Local, "", trimmed)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Path below the authority, never starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Object key for prefix-based backends (same as the path)
    pub fn key(&self) -> &str {
        &self.path
    }

    pub fn is_dir(&self) -> bool {
        self.path.is_empty() || self.path.ends_with('/')
    }

    pub fn is_root(&self) -> bool {
        self.path.is_empty()
    }

    /// Last path segment, without the trailing slash of directories
    pub fn name(&self) -> &str {
        let trimmed = self.path.trim_end_matches('/');
        if trimmed.is_empty() {
            return &self.authority;
        }
        trimmed.rsplit('/').next().unwrap_or(trimmed)
    }

    /// Parent directory, or `None` at the root
    pub fn parent(&self) -> Option<ResourceUri> {
        if self.is_root() {
            return None;
        }
        let trimmed = self.path.trim_end_matches('/');
        let parent = match trimmed.rfind('/') {
            Some(idx) => &trimmed[..=idx],
            None => "",
        };
        Some(Self {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: parent.to_string(),
        })
    }

    /// Append a relative path to this URI, treating it as a directory
    pub fn join(&self, child: &str) -> Result<ResourceUri> {
        let base = self.as_dir();
        Self::new(
            self.scheme,
            self.authority.clone(),
            &format!("{}{}", base.path, child.trim_start_matches('/')),
        )
    }

    /// The same location viewed as a directory
    pub fn as_dir(&self) -> ResourceUri {
        if self.is_dir() {
            return self.clone();
        }
        Self {
            scheme: self.scheme,
            authority: self.authority.clone(),
            path: format!("{}/", self.path),
        }
    }

    /// Path relative to `base` when this URI lies below it
    pub fn relative_to<'a>(&'a self, base: &ResourceUri) -> Option<&'a str> {
        if self.scheme != base.scheme || self.authority != base.authority {
            return None;
        }
        let base = base.as_dir();
        self.path.strip_prefix(base.path.as_str())
    }

    /// Local filesystem path for `file://` URIs
    pub fn local_path(&self) -> Option<PathBuf> {
        if self.scheme != Scheme::Local {
            return None;
        }
        Some(PathBuf::from(format!("/{}", self.path)))
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.authority, self.path)
    }
}

impl FromStr for ResourceUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ResourceUri {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<ResourceUri> for String {
    fn from(uri: ResourceUri) -> Self {
        uri.to_string()
    }
}

fn validate_authority(scheme: Scheme, authority: &str) -> Result<()> {
    if scheme == Scheme::Local {
        if !authority.is_empty() {
            return Err(Error::InvalidUri(format!(
                "file URIs cannot name a host: {authority}"
            )));
        }
        return Ok(());
    }

    if authority.is_empty() {
        return Err(Error::InvalidUri(format!(
            "{scheme} URIs require a bucket, container or namespace"
        )));
    }
    if authority
        .chars()
        .any(|c| c.is_whitespace() || c == '/' || c == '\\' || c == '?' || c == '#')
    {
        return Err(Error::InvalidUri(format!("Invalid authority: {authority}")));
    }
    Ok(())
}

/// Collapse repeated slashes, strip the leading slash, keep the trailing one
fn normalize_path(path: &str) -> Result<String> {
    let is_dir = path.is_empty() || path.ends_with('/');
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" => continue,
            "." | ".." => {
                return Err(Error::InvalidUri(format!(
                    "Relative segments are not allowed: {path}"
                )));
            }
            s => segments.push(s),
        }
    }

    let mut normalized = segments.join("/");
    if is_dir && !normalized.is_empty() {
        normalized.push('/');
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_canonical() {
        let cases = [
            "file:///home/user/report.pdf",
            "file:///home/user/",
            "file:///",
            "s3://bucket/",
            "s3://bucket/a/b/c.txt",
            "s3://bucket/dir/",
            "gs://data-lake/2024/01/events.parquet",
            "az://container/blob name with spaces.bin",
            "asset://models/llama/weights.safetensors",
        ];
        for case in cases {
            let parsed = ResourceUri::parse(case).unwrap();
            assert_eq!(parsed.to_string(), case, "round trip failed for {case}");
            let reparsed = ResourceUri::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed);
        }
    }

    #[test]
    fn test_parse_parts() {
        let uri = ResourceUri::parse("s3://bucket/path/to/key.txt").unwrap();
        assert_eq!(uri.scheme(), Scheme::S3);
        assert_eq!(uri.authority(), "bucket");
        assert_eq!(uri.path(), "path/to/key.txt");
        assert!(!uri.is_dir());
        assert_eq!(uri.name(), "key.txt");
    }

    #[test]
    fn test_normalization() {
        let uri = ResourceUri::parse("s3://bucket//a///b/").unwrap();
        assert_eq!(uri.path(), "a/b/");
        assert!(uri.is_dir());

        let uri = ResourceUri::parse("gs://bucket").unwrap();
        assert_eq!(uri.to_string(), "gs://bucket/");
        assert!(uri.is_root());
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(ResourceUri::parse("bucket/key").is_err());
        assert!(ResourceUri::parse("ftp://host/file").is_err());
        assert!(ResourceUri::parse("s3:///key").is_err());
        assert!(ResourceUri::parse("s3://bucket/a/../b").is_err());
        assert!(ResourceUri::parse("file://host/etc/passwd").is_err());
    }

    #[test]
    fn test_parent_and_join() {
        let uri = ResourceUri::parse("az://container/a/b/c.bin").unwrap();
        let parent = uri.parent().unwrap();
        assert_eq!(parent.to_string(), "az://container/a/b/");
        assert_eq!(parent.name(), "b");

        let root = ResourceUri::parse("az://container/a").unwrap().parent().unwrap();
        assert!(root.is_root());
        assert!(root.parent().is_none());

        let joined = parent.join("d/e.bin").unwrap();
        assert_eq!(joined.to_string(), "az://container/a/b/d/e.bin");

        let file_join = uri.join("x").unwrap();
        assert_eq!(file_join.path(), "a/b/c.bin/x");
    }

    #[test]
    fn test_relative_to() {
        let base = ResourceUri::parse("s3://bucket/photos").unwrap();
        let child = ResourceUri::parse("s3://bucket/photos/2024/a.jpg").unwrap();
        assert_eq!(child.relative_to(&base), Some("2024/a.jpg"));

        let other = ResourceUri::parse("s3://other/photos/a.jpg").unwrap();
        assert_eq!(other.relative_to(&base), None);
    }

    #[test]
    fn test_local_paths() {
        let uri = ResourceUri::from_local_path(Path::new("/tmp/data/file.txt")).unwrap();
        assert_eq!(uri.to_string(), "file:///tmp/data/file.txt");
        assert_eq!(uri.local_path().unwrap(), PathBuf::from("/tmp/data/file.txt"));
        assert!(ResourceUri::from_local_path(Path::new("relative/file")).is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let uri = ResourceUri::parse("gs://bucket/obj").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"gs://bucket/obj\"");
        let back: ResourceUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
        assert!(serde_json::from_str::<ResourceUri>("\"nope\"").is_err());
    }

    #[test]
    fn test_scheme_parse() {
        for scheme in Scheme::ALL {
            assert_eq!(scheme.as_str().parse::<Scheme>().unwrap(), scheme);
        }
        assert!("S3".parse::<Scheme>().is_ok());
        assert!(!Scheme::Local.is_prefix_based());
        assert!(Scheme::Gcs.is_prefix_based());
    }
}
