//! Blob REST client implementing `ObjectStore` and `AsyncCopy`

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use nb_core::{
    AsyncCopy, ByteStream, ChecksumAlgorithm, CopyHandle, CopyProgress, CopyState, Error,
    ListOptions, ListPage, ObjectDescriptor, ObjectStore, PollBackoff, PutOptions, ResourceUri,
    Result, Scheme, UploadSession,
};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG, HeaderMap, LAST_MODIFIED};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::upload::AzureUploadSession;
use crate::xml::{EnumerationResults, Entry, http_date, md5_checksum};

/// Service version sent with every request
pub(crate) const API_VERSION: &str = "2021-08-06";

/// Connection parameters for a storage account
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AzureConfig {
    pub account: String,
    /// Blob endpoint; `https://<account>.blob.core.windows.net` when unset
    pub endpoint: Option<String>,
    /// Shared access signature query string
    pub sas_token: Option<String>,
    /// Entra ID bearer token
    pub bearer_token: Option<String>,
}

/// Shared HTTP plumbing for the store and its upload sessions
#[derive(Debug, Clone)]
pub(crate) struct AzureApi {
    http: reqwest::Client,
    endpoint: String,
    sas: Option<String>,
    bearer: Option<String>,
}

impl AzureApi {
    /// URL of a blob, or of the container when `blob` is empty
    pub(crate) fn url(&self, container: &str, blob: &str) -> String {
        let path = blob
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        let base = if blob.is_empty() {
            format!("{}/{}", self.endpoint, urlencoding::encode(container))
        } else {
            format!("{}/{}/{path}", self.endpoint, urlencoding::encode(container))
        };
        match &self.sas {
            Some(sas) => format!("{base}?{}", sas.trim_start_matches('?')),
            None => base,
        }
    }

    pub(crate) fn blob_url(&self, uri: &ResourceUri) -> String {
        self.url(uri.authority(), uri.key())
    }

    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header("x-ms-version", API_VERSION);
        match &self.bearer {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| transport_error(&e, target))
    }

    pub(crate) async fn execute(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        let response = self.send(request, target).await?;
        check(response, target).await
    }
}

pub(crate) fn transport_error(error: &reqwest::Error, target: &str) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        Error::TransientNetwork(format!("{target}: {error}"))
    } else {
        Error::Network(format!("{target}: {error}"))
    }
}

/// Map the `x-ms-error-code` and status of a failed response
pub(crate) fn classify(status: u16, code: Option<&str>, target: &str) -> Error {
    let detail = format!("{target}: {}", code.unwrap_or("request failed"));
    match code {
        Some("BlobNotFound" | "ContainerNotFound" | "ResourceNotFound") => {
            return Error::NotFound(target.to_string());
        }
        Some("AuthorizationFailure" | "AuthenticationFailed" | "AuthorizationPermissionMismatch") => {
            return Error::PermissionDenied(detail);
        }
        Some("ServerBusy" | "OperationTimedOut" | "InternalError") => {
            return Error::TransientNetwork(detail);
        }
        Some("OutOfRangeInput") => return Error::InvalidPageToken(detail),
        Some("CannotVerifyCopySource") => {
            return Error::EmbeddedCopy {
                message: detail,
                retryable: false,
            };
        }
        _ => {}
    }
    match status {
        404 => Error::NotFound(target.to_string()),
        401 | 403 => Error::PermissionDenied(detail),
        408 | 429 | 500..=599 => Error::TransientNetwork(detail),
        _ => Error::Network(detail),
    }
}

fn error_code(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

pub(crate) async fn check(response: Response, target: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = error_code(response.headers());
    Err(classify(status.as_u16(), code.as_deref(), target))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse `x-ms-copy-progress` (`copied/total`)
fn parse_copy_progress(value: Option<&str>) -> (u64, Option<u64>) {
    let Some((copied, total)) = value.and_then(|v| v.split_once('/')) else {
        return (0, None);
    };
    (copied.parse().unwrap_or(0), total.parse().ok())
}

fn parse_copy_state(value: Option<&str>) -> Result<CopyState> {
    match value {
        Some("pending") => Ok(CopyState::Pending),
        Some("success") => Ok(CopyState::Success),
        Some("failed") => Ok(CopyState::Failed),
        Some("aborted") => Ok(CopyState::Aborted),
        other => Err(Error::General(format!("unknown copy status: {other:?}"))),
    }
}

/// Azure Blob Storage object store
#[derive(Debug, Clone)]
pub struct AzureStore {
    api: AzureApi,
}

impl AzureStore {
    pub fn new(config: AzureConfig) -> Result<Self> {
        if config.account.is_empty() && config.endpoint.is_none() {
            return Err(Error::Config(
                "azure provider needs an account or an endpoint".to_string(),
            ));
        }
        let endpoint = config
            .endpoint
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", config.account));
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        tracing::debug!(%endpoint, "Created Azure client");
        Ok(Self {
            api: AzureApi {
                http,
                endpoint: endpoint.trim_end_matches('/').to_string(),
                sas: config.sas_token,
                bearer: config.bearer_token,
            },
        })
    }

    async fn list_raw(
        &self,
        container: &str,
        prefix: &str,
        delimiter: Option<&str>,
        marker: Option<&str>,
        max_results: Option<usize>,
    ) -> Result<EnumerationResults> {
        let mut query: Vec<(&str, String)> = vec![
            ("restype", "container".to_string()),
            ("comp", "list".to_string()),
        ];
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter.to_string()));
        }
        if let Some(marker) = marker {
            query.push(("marker", marker.to_string()));
        }
        if let Some(max) = max_results {
            query.push(("maxresults", max.to_string()));
        }

        let target = format!("az://{container}/{prefix}");
        let request = self
            .api
            .request(Method::GET, &self.api.url(container, ""))
            .query(&query);
        let response = self.api.send(request, &target).await?;
        if response.status() == StatusCode::BAD_REQUEST && marker.is_some() {
            return Err(Error::InvalidPageToken(target));
        }
        let response = check(response, &target).await?;
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&e, &target))?;
        EnumerationResults::parse(&body)
    }

    async fn names_under(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .list_raw(container, prefix, None, marker.as_deref(), None)
                .await?;
            let next = page.next_marker();
            names.extend(page.blobs.entries.into_iter().filter_map(|e| match e {
                Entry::Blob(blob) => Some(blob.name),
                Entry::BlobPrefix(_) => None,
            }));
            match next {
                Some(next) => marker = Some(next),
                None => break,
            }
        }
        Ok(names)
    }

    async fn properties(&self, uri: &ResourceUri) -> Result<HeaderMap> {
        let target = uri.to_string();
        let response = self
            .api
            .execute(
                self.api.request(Method::HEAD, &self.api.blob_url(uri)),
                &target,
            )
            .await?;
        Ok(response.headers().clone())
    }

    fn descriptor_from_headers(uri: &ResourceUri, headers: &HeaderMap) -> ObjectDescriptor {
        let size = header(headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut descriptor = ObjectDescriptor::object(uri.clone(), size)
            .with_last_modified(http_date(header(headers, LAST_MODIFIED.as_str())))
            .with_checksum(md5_checksum(header(headers, "content-md5")))
            .with_etag(header(headers, ETAG.as_str()).map(|e| e.trim_matches('"').to_string()));
        if let Some(ct) = header(headers, CONTENT_TYPE.as_str()) {
            descriptor
                .metadata
                .insert("content-type".to_string(), ct.to_string());
        }
        descriptor
    }

    async fn delete_blob(&self, uri: &ResourceUri) -> Result<()> {
        self.api
            .execute(
                self.api.request(Method::DELETE, &self.api.blob_url(uri)),
                &uri.to_string(),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for AzureStore {
    fn scheme(&self) -> Scheme {
        Scheme::Azure
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        Some(ChecksumAlgorithm::Md5)
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let container = uri.authority();
        let prefix = format!(
            "{}{}",
            uri.as_dir().key(),
            options.prefix.as_deref().unwrap_or("")
        );
        let page = self
            .list_raw(
                container,
                &prefix,
                options.effective_delimiter(),
                options.page_token.as_deref(),
                options.page_size,
            )
            .await?;
        let next_page_token = page.next_marker();

        let mut items = Vec::new();
        for entry in page.blobs.entries {
            match entry {
                Entry::BlobPrefix(dir) => items.push(ObjectDescriptor::directory(
                    ResourceUri::new(Scheme::Azure, container, &dir.name)?,
                )),
                Entry::Blob(blob) if blob.name == prefix && prefix.ends_with('/') => {}
                Entry::Blob(blob) => items.push(blob.into_descriptor(container)?),
            }
        }
        items.sort_by(|a, b| a.uri.path().cmp(b.uri.path()));
        Ok(ListPage {
            items,
            next_page_token,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri.clone()));
        }
        let headers = self.properties(uri).await?;
        Ok(Self::descriptor_from_headers(uri, &headers))
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        let target = uri.to_string();
        let mut request = self.api.request(Method::GET, &self.api.blob_url(uri));
        if offset > 0 {
            request = request.header("x-ms-range", format!("bytes={offset}-"));
        }
        let response = self.api.send(request, &target).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let response = check(response, &target).await?;
        Ok(response
            .bytes_stream()
            .map_err(move |e| transport_error(&e, &target))
            .boxed())
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        Ok(Box::new(AzureUploadSession::new(
            self.api.clone(),
            dest.clone(),
            options,
        )))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        if !uri.is_dir() {
            self.delete_blob(uri).await?;
            tracing::debug!(%uri, "Deleted blob");
            return Ok(());
        }
        let names = self.names_under(uri.authority(), uri.key()).await?;
        if names.is_empty() {
            return Err(Error::NotFound(uri.to_string()));
        }
        if !recursive && names.iter().any(|n| n != uri.key()) {
            return Err(Error::DirectoryNotEmpty(uri.to_string()));
        }
        let count = names.len();
        for name in names {
            let child = ResourceUri::new(Scheme::Azure, uri.authority(), &name)?;
            match self.delete_blob(&child).await {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(%uri, count, "Deleted prefix");
        Ok(())
    }

    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        if src.is_dir() {
            return Err(Error::NotSupported(format!(
                "{src} is a directory; copy its blobs individually"
            )));
        }
        let handle = self.start_copy(src, dest).await?;
        let mut backoff = PollBackoff::new(Duration::from_millis(200), Duration::from_secs(5));
        loop {
            let progress = self.copy_status(dest, &handle.copy_id).await?;
            match progress.state {
                CopyState::Success => return self.stat(dest).await,
                CopyState::Pending => tokio::time::sleep(backoff.next_delay()).await,
                CopyState::Failed => {
                    return Err(Error::EmbeddedCopy {
                        message: format!(
                            "{dest}: {}",
                            progress.description.unwrap_or_else(|| "copy failed".into())
                        ),
                        retryable: false,
                    });
                }
                CopyState::Aborted => {
                    return Err(Error::General(format!("{dest}: copy was aborted")));
                }
            }
        }
    }

    async fn mkdir(&self, uri: &ResourceUri) -> Result<()> {
        if uri.is_root() {
            return Ok(());
        }
        let marker = uri.as_dir();
        self.api
            .execute(
                self.api
                    .request(Method::PUT, &self.api.blob_url(&marker))
                    .header("x-ms-blob-type", "BlockBlob")
                    .header(CONTENT_LENGTH, 0)
                    .body(Vec::new()),
                &marker.to_string(),
            )
            .await?;
        Ok(())
    }

    fn async_copy(&self) -> Option<&dyn AsyncCopy> {
        Some(self)
    }
}

#[async_trait]
impl AsyncCopy for AzureStore {
    async fn start_copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<CopyHandle> {
        // Pin the copy to the version of the source we observed
        let source = self.properties(src).await?;
        let source_etag = header(&source, ETAG.as_str()).map(str::to_string);

        let mut request = self
            .api
            .request(Method::PUT, &self.api.blob_url(dest))
            .header("x-ms-copy-source", self.api.blob_url(src))
            .header(CONTENT_LENGTH, 0);
        if let Some(etag) = &source_etag {
            request = request.header("x-ms-source-if-match", etag);
        }
        let response = self.api.execute(request, &dest.to_string()).await?;
        let copy_id = header(response.headers(), "x-ms-copy-id")
            .ok_or_else(|| Error::General(format!("{dest}: no copy id in response")))?
            .to_string();
        tracing::debug!(%src, %dest, copy_id, "Started blob copy");
        Ok(CopyHandle {
            copy_id,
            source_etag: source_etag.map(|e| e.trim_matches('"').to_string()),
        })
    }

    async fn copy_status(&self, dest: &ResourceUri, copy_id: &str) -> Result<CopyProgress> {
        let headers = self.properties(dest).await?;
        if header(&headers, "x-ms-copy-id") != Some(copy_id) {
            return Err(Error::General(format!(
                "{dest}: copy {copy_id} was replaced by another operation"
            )));
        }
        let (bytes_copied, total) = parse_copy_progress(header(&headers, "x-ms-copy-progress"));
        Ok(CopyProgress {
            state: parse_copy_state(header(&headers, "x-ms-copy-status"))?,
            bytes_copied,
            total,
            description: header(&headers, "x-ms-copy-status-description").map(str::to_string),
            source_etag: None,
        })
    }

    async fn abort_copy(&self, dest: &ResourceUri, copy_id: &str) -> Result<()> {
        let url = self.api.blob_url(dest);
        let separator = if url.contains('?') { '&' } else { '?' };
        let url = format!(
            "{url}{separator}comp=copy&copyid={}",
            urlencoding::encode(copy_id)
        );
        let response = self
            .api
            .send(
                self.api
                    .request(Method::PUT, &url)
                    .header("x-ms-copy-action", "abort")
                    .header(CONTENT_LENGTH, 0),
                &dest.to_string(),
            )
            .await?;
        // Already finished copies cannot be aborted
        if response.status() == StatusCode::CONFLICT {
            tracing::debug!(%dest, copy_id, "Copy already finished");
            return Ok(());
        }
        check(response, &dest.to_string()).await?;
        Ok(())
    }
}
