//! Provider registry for dynamic provider resolution.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use siberian_common::settings::{provider_key, token_key};
use siberian_common::{Error, ProviderId, Result, SettingsStore};

use crate::gcs::GcsProvider;
use crate::gdrive::GDriveProvider;
use crate::local::LocalProvider;
use crate::provider::StorageProvider;
use crate::s3::S3Provider;
use crate::token::{Clock, SystemClock, TokenCache};

/// Collaborators handed to every provider factory.
#[derive(Clone)]
pub struct ProviderContext {
    pub store: Arc<dyn SettingsStore>,
    pub clock: Arc<dyn Clock>,
}

impl ProviderContext {
    pub fn new(store: Arc<dyn SettingsStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

/// Factory function type for creating providers.
///
/// `None` means no configuration was stored; the factory returns an
/// unconfigured provider rather than failing.
pub type ProviderFactory = Box<
    dyn Fn(Option<Value>, &ProviderContext) -> Result<Arc<dyn StorageProvider>> + Send + Sync,
>;

/// Registry for storage provider factories.
pub struct ProviderRegistry {
    factories: BTreeMap<ProviderId, ProviderFactory>,
}

impl ProviderRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Register a provider factory.
    ///
    /// # Errors
    /// - Returns error if the identifier is already registered
    pub fn register(&mut self, id: ProviderId, factory: ProviderFactory) -> Result<()> {
        if self.factories.contains_key(&id) {
            return Err(Error::Config(format!(
                "Provider '{}' is already registered",
                id
            )));
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    /// Build a provider from an explicit configuration.
    ///
    /// # Errors
    /// - Provider not registered
    /// - Configuration cannot be decoded
    pub fn resolve(
        &self,
        id: ProviderId,
        config: Option<Value>,
        ctx: &ProviderContext,
    ) -> Result<Arc<dyn StorageProvider>> {
        let factory = self
            .factories
            .get(&id)
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))?;
        factory(config, ctx)
    }

    /// Build a provider from the configuration persisted in the store.
    pub fn load(&self, id: ProviderId, ctx: &ProviderContext) -> Result<Arc<dyn StorageProvider>> {
        let stored = ctx.store.get(&provider_key(id.as_str()))?;
        self.resolve(id, stored.filter(|v| !v.is_null()), ctx)
    }

    /// Registered identifiers, in stable order.
    pub fn providers(&self) -> Vec<ProviderId> {
        self.factories.keys().copied().collect()
    }

    /// Check if a provider is registered.
    pub fn has_provider(&self, id: ProviderId) -> bool {
        self.factories.contains_key(&id)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn decode<T: DeserializeOwned>(id: ProviderId, config: Option<Value>) -> Result<Option<T>> {
    config
        .map(|value| {
            serde_json::from_value(value).map_err(|e| {
                Error::Config(format!("Stored configuration of '{}' is invalid: {}", id, e))
            })
        })
        .transpose()
}

/// Create a registry with the four built-in providers.
///
/// Cloud providers keep their access tokens in the settings store under
/// `token.<id>`; Google Drive also writes rotated refresh tokens back to
/// its configuration.
pub fn create_default_registry() -> ProviderRegistry {
    let mut factories: BTreeMap<ProviderId, ProviderFactory> = BTreeMap::new();

    factories.insert(
        ProviderId::Local,
        Box::new(|config: Option<Value>, _ctx: &ProviderContext| {
            let config = decode(ProviderId::Local, config)?;
            Ok(Arc::new(LocalProvider::new(config)))
        }),
    );

    factories.insert(
        ProviderId::S3,
        Box::new(|config: Option<Value>, ctx: &ProviderContext| {
            let config = decode(ProviderId::S3, config)?;
            Ok(Arc::new(S3Provider::with_clock(config, ctx.clock.clone())?))
        }),
    );

    factories.insert(
        ProviderId::Gcs,
        Box::new(|config: Option<Value>, ctx: &ProviderContext| {
            let config = decode(ProviderId::Gcs, config)?;
            let cache = TokenCache::new(ctx.clock.clone())
                .persisted(ctx.store.clone(), token_key(ProviderId::Gcs.as_str()));
            Ok(Arc::new(GcsProvider::with_token_cache(config, cache)?))
        }),
    );

    factories.insert(
        ProviderId::Gdrive,
        Box::new(|config: Option<Value>, ctx: &ProviderContext| {
            let config = decode(ProviderId::Gdrive, config)?;
            let cache = TokenCache::new(ctx.clock.clone())
                .persisted(ctx.store.clone(), token_key(ProviderId::Gdrive.as_str()));
            Ok(Arc::new(GDriveProvider::with_token_cache(
                config,
                cache,
                Some(ctx.store.clone()),
            )?))
        }),
    );

    ProviderRegistry { factories }
}
