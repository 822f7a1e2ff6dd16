//! GCS JSON API client implementing `ObjectStore`

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use nb_core::{
    ByteStream, ChecksumAlgorithm, Error, ListOptions, ListPage, ObjectDescriptor, ObjectStore,
    PutOptions, ResourceUri, Result, RewriteCopy, RewriteStatus, Scheme, UploadSession,
};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;

use crate::types::{ErrorBody, GcsObject, ObjectList, RewriteResponse};
use crate::upload::GcsUploadSession;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";

/// Connection parameters for a GCS-compatible endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcsConfig {
    pub endpoint: String,
    /// OAuth2 bearer token; anonymous when unset
    pub token: Option<String>,
}

impl Default for GcsConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            token: None,
        }
    }
}

/// Shared HTTP plumbing for the store and its upload sessions
#[derive(Debug, Clone)]
pub(crate) struct GcsApi {
    http: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl GcsApi {
    pub(crate) fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) fn object_url(&self, uri: &ResourceUri) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(uri.authority()),
            urlencoding::encode(uri.key())
        )
    }

    pub(crate) fn upload_url(&self, bucket: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(bucket)
        )
    }

    fn bucket_url(&self, bucket: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(bucket)
        )
    }

    /// Send a request, mapping transport failures only
    pub(crate) async fn send(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        request
            .send()
            .await
            .map_err(|e| transport_error(&e, target))
    }

    /// Send a request and require a success status
    pub(crate) async fn execute(&self, request: RequestBuilder, target: &str) -> Result<Response> {
        let response = self.send(request, target).await?;
        check(response, target).await
    }

    pub(crate) async fn json<T: serde::de::DeserializeOwned>(
        response: Response,
        target: &str,
    ) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error(&e, target))?;
        Ok(serde_json::from_slice(&body)?)
    }
}

pub(crate) fn transport_error(error: &reqwest::Error, target: &str) -> Error {
    if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
        Error::TransientNetwork(format!("{target}: {error}"))
    } else {
        Error::Network(format!("{target}: {error}"))
    }
}

/// Map an error status to an nb-core error
pub(crate) fn status_error(status: StatusCode, target: &str, message: &str) -> Error {
    let detail = if message.is_empty() {
        format!("{target}: HTTP {}", status.as_u16())
    } else {
        format!("{target}: {message}")
    };
    match status.as_u16() {
        404 => Error::NotFound(target.to_string()),
        401 | 403 => Error::PermissionDenied(detail),
        408 | 429 | 500..=599 => Error::TransientNetwork(detail),
        _ => Error::Network(detail),
    }
}

pub(crate) async fn check(response: Response, target: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error.message)
        .unwrap_or(body);
    Err(status_error(status, target, &message))
}

/// Google Cloud Storage object store
#[derive(Debug, Clone)]
pub struct GcsStore {
    api: GcsApi,
}

impl GcsStore {
    pub fn new(config: GcsConfig) -> Result<Self> {
        // Resumable uploads answer 308 without a Location header
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        tracing::debug!(endpoint = %config.endpoint, "Created GCS client");
        Ok(Self {
            api: GcsApi {
                http,
                endpoint: config.endpoint.trim_end_matches('/').to_string(),
                token: config.token,
            },
        })
    }

    #[cfg(test)]
    pub(crate) fn api(&self) -> GcsApi {
        self.api.clone()
    }

    async fn list_raw(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        page_token: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<ObjectList> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(delimiter) = delimiter {
            query.push(("delimiter", delimiter.to_string()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }
        if let Some(size) = page_size {
            query.push(("maxResults", size.to_string()));
        }

        let target = format!("gs://{bucket}/{prefix}");
        let response = self
            .api
            .send(
                self.api
                    .request(Method::GET, &self.api.bucket_url(bucket))
                    .query(&query),
                &target,
            )
            .await?;
        if response.status() == StatusCode::BAD_REQUEST && page_token.is_some() {
            return Err(Error::InvalidPageToken(target));
        }
        let response = check(response, &target).await?;
        GcsApi::json(response, &target).await
    }

    async fn names_under(&self, bucket: &str, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self
                .list_raw(bucket, prefix, None, token.as_deref(), None)
                .await?;
            names.extend(page.items.into_iter().map(|o| o.name));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        Ok(names)
    }

    async fn delete_object(&self, uri: &ResourceUri) -> Result<()> {
        let target = uri.to_string();
        self.api
            .execute(
                self.api.request(Method::DELETE, &self.api.object_url(uri)),
                &target,
            )
            .await?;
        Ok(())
    }

    async fn rewrite_once(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        token: Option<&str>,
    ) -> Result<RewriteResponse> {
        let url = format!(
            "{}/rewriteTo/b/{}/o/{}",
            self.api.object_url(src),
            urlencoding::encode(dest.authority()),
            urlencoding::encode(dest.key())
        );
        let mut request = self
            .api
            .request(Method::POST, &url)
            .json(&serde_json::json!({}));
        if let Some(token) = token {
            request = request.query(&[("rewriteToken", token)]);
        }
        let target = src.to_string();
        let response = self.api.execute(request, &target).await?;
        GcsApi::json(response, &target).await
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    fn scheme(&self) -> Scheme {
        Scheme::Gcs
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        Some(ChecksumAlgorithm::Md5)
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let bucket = uri.authority();
        let prefix = format!(
            "{}{}",
            uri.as_dir().key(),
            options.prefix.as_deref().unwrap_or("")
        );
        let page = self
            .list_raw(
                bucket,
                &prefix,
                options.effective_delimiter(),
                options.page_token.as_deref(),
                options.page_size,
            )
            .await?;

        let mut items = Vec::with_capacity(page.items.len() + page.prefixes.len());
        for dir in &page.prefixes {
            items.push(ObjectDescriptor::directory(ResourceUri::new(
                Scheme::Gcs,
                bucket,
                dir,
            )?));
        }
        for object in page.items {
            // Marker object of the listed directory
            if object.name == prefix && prefix.ends_with('/') {
                continue;
            }
            items.push(object.into_descriptor(bucket)?);
        }
        items.sort_by(|a, b| a.uri.path().cmp(b.uri.path()));

        Ok(ListPage {
            items,
            next_page_token: page.next_page_token,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri.clone()));
        }
        let target = uri.to_string();
        let response = self
            .api
            .execute(
                self.api.request(Method::GET, &self.api.object_url(uri)),
                &target,
            )
            .await?;
        let object: GcsObject = GcsApi::json(response, &target).await?;
        object.into_descriptor(uri.authority())
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        let target = uri.to_string();
        let mut request = self
            .api
            .request(Method::GET, &self.api.object_url(uri))
            .query(&[("alt", "media")]);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = self.api.send(request, &target).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Box::pin(futures::stream::empty()));
        }
        let response = check(response, &target).await?;

        let stream = response
            .bytes_stream()
            .map_err(move |e| transport_error(&e, &target));
        Ok(stream.boxed())
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        let session = GcsUploadSession::begin(self.api.clone(), dest.clone(), options).await?;
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
        let session = GcsUploadSession::resume(self.api.clone(), dest.clone(), token).await?;
        Ok(Box::new(session))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        if !uri.is_dir() {
            self.delete_object(uri).await?;
            tracing::debug!(%uri, "Deleted object");
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
            let child = ResourceUri::new(Scheme::Gcs, uri.authority(), &name)?;
            match self.delete_object(&child).await {
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
                "{src} is a directory; copy its objects individually"
            )));
        }
        let mut token = None;
        loop {
            let status = self.rewrite(src, dest, token).await?;
            if status.done {
                return match status.descriptor {
                    Some(descriptor) => Ok(descriptor),
                    None => self.stat(dest).await,
                };
            }
            token = status.token;
        }
    }

    async fn mkdir(&self, uri: &ResourceUri) -> Result<()> {
        if uri.is_root() {
            return Ok(());
        }
        let marker = uri.as_dir();
        let target = marker.to_string();
        self.api
            .execute(
                self.api
                    .request(Method::POST, &self.api.upload_url(marker.authority()))
                    .query(&[("uploadType", "media"), ("name", marker.key())])
                    .header(CONTENT_LENGTH, 0)
                    .body(Vec::new()),
                &target,
            )
            .await?;
        Ok(())
    }

    fn rewrite_copy(&self) -> Option<&dyn RewriteCopy> {
        Some(self)
    }
}

#[async_trait]
impl RewriteCopy for GcsStore {
    async fn rewrite(
        &self,
        src: &ResourceUri,
        dest: &ResourceUri,
        token: Option<String>,
    ) -> Result<RewriteStatus> {
        let response = self.rewrite_once(src, dest, token.as_deref()).await?;
        let (bytes_rewritten, total) = (response.rewritten(), response.total());
        tracing::trace!(%src, %dest, bytes_rewritten, total, done = response.done, "Rewrite round");

        let descriptor = match response.resource {
            Some(object) if response.done => Some(object.into_descriptor(dest.authority())?),
            _ => None,
        };
        if !response.done && response.rewrite_token.is_none() {
            return Err(Error::General(format!(
                "{dest}: rewrite not done but no continuation token"
            )));
        }
        Ok(RewriteStatus {
            done: response.done,
            token: response.rewrite_token,
            bytes_rewritten,
            total,
            descriptor,
        })
    }
}
