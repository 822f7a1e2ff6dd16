//! `providers.toml` loading and provider setup
//!
//! ```toml
//! [engine]
//! concurrency = 2
//!
//! [s3]
//! endpoint = "http://localhost:9000"
//! access_key = "minio"
//! secret_key = "minio123"
//! path_style = true
//!
//! [gcs]
//! token = "ya29..."
//! ```
//!
//! Local files are always available; each cloud provider is registered
//! only when its section is present.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use nb_assets::{AssetConfig, AssetStore};
use nb_azure::{AzureConfig, AzureStore};
use nb_core::{EngineConfig, LocalStore, ProviderRegistry};
use nb_gcs::{GcsConfig, GcsStore};
use nb_s3::{S3Config, S3Store};
use serde::Deserialize;

pub const CONFIG_FILE: &str = "providers.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub engine: EngineConfig,
    pub s3: Option<S3Config>,
    pub gcs: Option<GcsConfig>,
    pub azure: Option<AzureConfig>,
    pub assets: Option<AssetConfig>,
}

impl CliConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(content).context("Invalid providers.toml")?;
        config.engine.validate()?;
        Ok(config)
    }

    /// Load `providers.toml` from `dir`; a missing file means local files only
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                tracing::debug!(path = %path.display(), "Loaded provider config");
                Self::from_toml_str(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Register every configured provider
    pub async fn registry(&self) -> Result<ProviderRegistry> {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(LocalStore::new()));
        if let Some(s3) = &self.s3 {
            let store = S3Store::new(s3.clone())
                .await
                .context("Failed to configure S3 provider")?;
            registry.register(Arc::new(store));
        }
        if let Some(gcs) = &self.gcs {
            let store = GcsStore::new(gcs.clone()).context("Failed to configure GCS provider")?;
            registry.register(Arc::new(store));
        }
        if let Some(azure) = &self.azure {
            let store =
                AzureStore::new(azure.clone()).context("Failed to configure Azure provider")?;
            registry.register(Arc::new(store));
        }
        if let Some(assets) = &self.assets {
            let store =
                AssetStore::new(assets.clone()).context("Failed to configure asset provider")?;
            registry.register(Arc::new(store));
        }
        Ok(registry)
    }
}

/// `--config-dir`/`NB_CONFIG_DIR`, else the user config directory
pub fn config_dir(explicit: Option<&Path>) -> Option<PathBuf> {
    explicit
        .map(Path::to_path_buf)
        .or_else(|| dirs::config_dir().map(|d| d.join("nimbus")))
}
