//! `ObjectStore` over the asset service

use std::sync::Arc;

use async_trait::async_trait;
use nb_core::{
    ByteStream, ChecksumAlgorithm, Error, ListOptions, ListPage, ObjectDescriptor, ObjectStore,
    PutOptions, ResourceUri, Result, Scheme, UploadSession,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::blobs::{AssetUploadSession, BlobClient};
use crate::rpc::{HttpRpc, RpcTransport};
use crate::types::{AssetPage, AssetRecord};

/// Connection parameters for an asset service
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AssetConfig {
    /// Base URL; JSON-RPC is served at `<endpoint>/rpc`, blobs at `<endpoint>/blobs`
    pub endpoint: String,
    pub token: Option<String>,
}

/// Content-addressed asset store
#[derive(Debug, Clone)]
pub struct AssetStore {
    rpc: Arc<dyn RpcTransport>,
    blobs: BlobClient,
}

impl AssetStore {
    pub fn new(config: AssetConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(Error::Config("asset provider needs an endpoint".to_string()));
        }
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        let endpoint = config.endpoint.trim_end_matches('/');
        let rpc = HttpRpc::new(http.clone(), format!("{endpoint}/rpc"), config.token.clone());
        tracing::debug!(endpoint, "Created asset store client");
        Ok(Self::with_transport(
            Arc::new(rpc),
            BlobClient::new(http, endpoint, config.token),
        ))
    }

    fn with_transport(rpc: Arc<dyn RpcTransport>, blobs: BlobClient) -> Self {
        Self { rpc, blobs }
    }

    async fn call<T: serde::de::DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let result = self.rpc.call(method, params).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn record(&self, uri: &ResourceUri) -> Result<AssetRecord> {
        self.call(
            "assets.stat",
            json!({ "namespace": uri.authority(), "path": uri.key() }),
        )
        .await
        .map_err(|e| match e {
            Error::NotFound(_) => Error::NotFound(uri.to_string()),
            other => other,
        })
    }

    async fn page(
        &self,
        namespace: &str,
        prefix: &str,
        delimiter: Option<&str>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<AssetPage> {
        let mut params = json!({ "namespace": namespace, "prefix": prefix });
        if let Some(delimiter) = delimiter {
            params["delimiter"] = json!(delimiter);
        }
        if let Some(cursor) = cursor {
            params["cursor"] = json!(cursor);
        }
        if let Some(limit) = limit {
            params["limit"] = json!(limit);
        }
        self.call("assets.list", params).await
    }

    async fn paths_under(&self, namespace: &str, prefix: &str) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .page(namespace, prefix, None, cursor.as_deref(), None)
                .await?;
            paths.extend(page.items.into_iter().map(|r| r.path));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(paths)
    }

    async fn delete_asset(&self, namespace: &str, path: &str) -> Result<()> {
        let _: Value = self
            .call(
                "assets.delete",
                json!({ "namespace": namespace, "path": path }),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for AssetStore {
    fn scheme(&self) -> Scheme {
        Scheme::Asset
    }

    fn native_checksum(&self) -> Option<ChecksumAlgorithm> {
        Some(ChecksumAlgorithm::Blake3)
    }

    async fn list(&self, uri: &ResourceUri, options: &ListOptions) -> Result<ListPage> {
        let namespace = uri.authority();
        let prefix = format!(
            "{}{}",
            uri.as_dir().key(),
            options.prefix.as_deref().unwrap_or("")
        );
        let page = self
            .page(
                namespace,
                &prefix,
                options.effective_delimiter(),
                options.page_token.as_deref(),
                options.page_size,
            )
            .await?;

        let mut items = Vec::with_capacity(page.items.len() + page.prefixes.len());
        for dir in &page.prefixes {
            items.push(ObjectDescriptor::directory(ResourceUri::new(
                Scheme::Asset,
                namespace,
                dir,
            )?));
        }
        for record in page.items {
            items.push(record.into_descriptor(namespace)?);
        }
        items.sort_by(|a, b| a.uri.path().cmp(b.uri.path()));
        Ok(ListPage {
            items,
            next_page_token: page.next_cursor,
        })
    }

    async fn stat(&self, uri: &ResourceUri) -> Result<ObjectDescriptor> {
        if uri.is_dir() {
            return Ok(ObjectDescriptor::directory(uri.clone()));
        }
        self.record(uri).await?.into_descriptor(uri.authority())
    }

    async fn open_read(&self, uri: &ResourceUri, offset: u64) -> Result<ByteStream> {
        let record = self.record(uri).await?;
        self.blobs
            .open(&record.digest, offset, &uri.to_string())
            .await
    }

    async fn begin_upload(
        &self,
        dest: &ResourceUri,
        options: &PutOptions,
    ) -> Result<Box<dyn UploadSession>> {
        let session =
            AssetUploadSession::begin(self.blobs.clone(), self.rpc.clone(), dest.clone(), options)
                .await?;
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
        let session =
            AssetUploadSession::resume(self.blobs.clone(), self.rpc.clone(), dest.clone(), token)
                .await?;
        Ok(Box::new(session))
    }

    async fn delete(&self, uri: &ResourceUri, recursive: bool) -> Result<()> {
        let namespace = uri.authority();
        if !uri.is_dir() {
            self.delete_asset(namespace, uri.key()).await?;
            tracing::debug!(%uri, "Deleted asset");
            return Ok(());
        }

        let paths = self.paths_under(namespace, uri.key()).await?;
        if paths.is_empty() {
            return Err(Error::NotFound(uri.to_string()));
        }
        if !recursive {
            return Err(Error::DirectoryNotEmpty(uri.to_string()));
        }
        let count = paths.len();
        for path in paths {
            self.delete_asset(namespace, &path).await?;
        }
        tracing::debug!(%uri, count, "Deleted asset prefix");
        Ok(())
    }

    async fn copy(&self, src: &ResourceUri, dest: &ResourceUri) -> Result<ObjectDescriptor> {
        Err(Error::NotSupported(format!(
            "asset store has no server-side copy ({src} -> {dest})"
        )))
    }

    async fn mkdir(&self, _uri: &ResourceUri) -> Result<()> {
        // Directories only exist as path prefixes of assets
        Ok(())
    }
}
