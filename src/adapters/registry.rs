//! Adapter lookup by provider tag.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::{AdapterContext, GoogleAdsAdapter, MetaAdapter, ShopifyAdapter, SyncAdapter};
use crate::config::AppConfig;
use crate::models::Provider;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no sync adapter registered for provider '{provider}'")]
    AdapterNotFound { provider: Provider },
}

/// Owned by the service object; there is no process-global registry.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn SyncAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("providers", &self.providers())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the three production adapters. Google Ads needs a developer
    /// token and is skipped without one.
    pub fn with_defaults(context: AdapterContext, config: &AppConfig) -> Self {
        let mut registry = Self::new();
        match config.google_ads_developer_token.clone() {
            Some(developer_token) => registry.register(Arc::new(GoogleAdsAdapter::new(
                context.clone(),
                config.google_ads_api_base.clone(),
                developer_token,
            ))),
            None => warn!("google ads adapter not registered: missing developer token"),
        }
        registry.register(Arc::new(MetaAdapter::new(
            context.clone(),
            config.meta_graph_base.clone(),
        )));
        registry.register(Arc::new(ShopifyAdapter::new(
            context,
            config.shopify_api_base.clone(),
        )));
        registry
    }

    /// Replaces any adapter already registered for the same provider.
    pub fn register(&mut self, adapter: Arc<dyn SyncAdapter>) {
        self.adapters.insert(adapter.provider(), adapter);
    }

    pub fn get(&self, provider: Provider) -> Result<Arc<dyn SyncAdapter>, RegistryError> {
        self.adapters
            .get(&provider)
            .cloned()
            .ok_or(RegistryError::AdapterNotFound { provider })
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<_> = self.adapters.keys().copied().collect();
        providers.sort();
        providers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{SyncError, SyncResult};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct Noop(Provider);

    #[async_trait]
    impl SyncAdapter for Noop {
        fn provider(&self) -> Provider {
            self.0
        }

        async fn sync(&self, _integration_id: Uuid) -> Result<SyncResult, SyncError> {
            Ok(SyncResult::default())
        }
    }

    #[test]
    fn looks_up_by_provider() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(Noop(Provider::Meta)));
        registry.register(Arc::new(Noop(Provider::Shopify)));

        assert_eq!(registry.get(Provider::Meta).unwrap().provider(), Provider::Meta);
        assert!(matches!(
            registry.get(Provider::GoogleAds),
            Err(RegistryError::AdapterNotFound {
                provider: Provider::GoogleAds
            })
        ));
        assert_eq!(registry.providers(), vec![Provider::Meta, Provider::Shopify]);
    }
}
