//! Provider registry
//!
//! Routes a URI to the provider registered for its scheme. Providers are
//! shared `Arc` handles, so one HTTP connection pool serves every job.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::traits::ObjectStore;
use crate::uri::{ResourceUri, Scheme};

/// Maps URI schemes to provider instances
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<HashMap<Scheme, Arc<dyn ObjectStore>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own scheme, replacing any previous one
    pub fn register(&self, provider: Arc<dyn ObjectStore>) {
        let scheme = provider.scheme();
        if let Ok(mut providers) = self.providers.write() {
            providers.insert(scheme, provider);
        }
        tracing::debug!(%scheme, "Registered provider");
    }

    pub fn unregister(&self, scheme: Scheme) {
        if let Ok(mut providers) = self.providers.write() {
            providers.remove(&scheme);
        }
    }

    /// Provider for a scheme
    pub fn get(&self, scheme: Scheme) -> Result<Arc<dyn ObjectStore>> {
        self.providers
            .read()
            .ok()
            .and_then(|providers| providers.get(&scheme).cloned())
            .ok_or_else(|| Error::Config(format!("No provider configured for {scheme}://")))
    }

    /// Provider responsible for `uri`
    pub fn resolve(&self, uri: &ResourceUri) -> Result<Arc<dyn ObjectStore>> {
        self.get(uri.scheme())
    }

    /// Registered schemes in stable order
    pub fn schemes(&self) -> Vec<Scheme> {
        let mut schemes: Vec<Scheme> = self
            .providers
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default();
        schemes.sort();
        schemes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;

    #[test]
    fn test_resolve_by_scheme() {
        let registry = ProviderRegistry::new();
        registry.register(Arc::new(LocalStore::new()));

        let uri = ResourceUri::parse("file:///tmp/x").unwrap();
        assert_eq!(registry.resolve(&uri).unwrap().scheme(), Scheme::Local);

        let s3 = ResourceUri::parse("s3://bucket/key").unwrap();
        assert!(matches!(registry.resolve(&s3), Err(Error::Config(_))));
        assert_eq!(registry.schemes(), vec![Scheme::Local]);

        registry.unregister(Scheme::Local);
        assert!(registry.resolve(&uri).is_err());
    }
}
