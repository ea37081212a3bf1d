//! Access token management for Google Drive.

use async_trait::async_trait;
use chrono::Duration;
use reqwest::Client;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use siberian_common::settings::provider_key;
use siberian_common::{Error, ProviderId, Result, SettingsStore};

use super::provider::GDriveConfig;
use super::proxy::refresh_via_proxy;
use crate::token::{AuthToken, TokenCache, TokenSource};

/// Lifetime assumed when the proxy does not report one.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

struct AuthState {
    cache: TokenCache,
    refresh_token: Zeroizing<String>,
}

/// Hands out access tokens and refreshes them through the OAuth proxy.
///
/// A rotated refresh token is written back into the stored provider
/// configuration so the next process starts from it.
pub struct DriveAuth {
    http: Client,
    proxy_url: String,
    state: Mutex<AuthState>,
    store: Option<Arc<dyn SettingsStore>>,
}

impl DriveAuth {
    /// # Errors
    /// - The configuration holds no refresh token
    pub fn new(http: Client, config: &GDriveConfig, mut cache: TokenCache) -> Result<Self> {
        let refresh_token = config
            .refresh_token
            .clone()
            .ok_or_else(|| Error::NotConfigured("gdrive: no refresh token".to_string()))?;

        // A token handed over with the configuration replaces whatever the
        // cache holds unless it has already expired.
        if let (Some(token), Some(expires_at)) = (&config.access_token, config.token_expires_at) {
            let replaces = match cache.peek() {
                None => true,
                Some(cached) => cached.token != *token && expires_at > cache.now(),
            };
            if replaces {
                cache.store(AuthToken::new(token.clone(), expires_at));
            }
        }

        Ok(Self {
            http,
            proxy_url: config.proxy_url.clone(),
            state: Mutex::new(AuthState {
                cache,
                refresh_token: Zeroizing::new(refresh_token),
            }),
            store: None,
        })
    }

    /// Persist rotated refresh tokens into `store`.
    pub fn with_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// A usable access token, refreshing through the proxy if needed.
    pub async fn access_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.cache.current() {
            return Ok(token.token.clone());
        }
        self.refresh_locked(&mut state).await
    }

    /// Force a refresh, e.g. after the API rejected the current token.
    pub async fn refresh(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Replace `rejected`, unless the cache already holds a different
    /// usable token.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.cache.current().filter(|t| t.token != rejected) {
            return Ok(token.token.clone());
        }
        self.refresh_locked(&mut state).await
    }

    async fn refresh_locked(&self, state: &mut AuthState) -> Result<String> {
        let bundle = refresh_via_proxy(&self.http, &self.proxy_url, &state.refresh_token).await?;

        let lifetime = Duration::seconds(bundle.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS));
        let now = state.cache.now();
        state
            .cache
            .store(AuthToken::expiring_in(bundle.access_token.clone(), now, lifetime));

        if let Some(rotated) = bundle.refresh_token {
            if rotated.as_str() != state.refresh_token.as_str() {
                info!("Proxy rotated the refresh token");
                self.persist_refresh_token(&rotated);
                state.refresh_token = Zeroizing::new(rotated);
            }
        }
        Ok(bundle.access_token)
    }

    fn persist_refresh_token(&self, token: &str) {
        let Some(store) = &self.store else {
            return;
        };
        let key = provider_key(ProviderId::Gdrive.as_str());
        let result = store.get(&key).and_then(|stored| match stored {
            Some(mut config) if config.is_object() => {
                config["refresh_token"] = serde_json::Value::String(token.to_string());
                store.set(&key, config)
            }
            _ => Ok(()),
        });
        if let Err(e) = result {
            warn!(key = %key, "Could not persist rotated refresh token: {}", e);
        }
    }
}

#[async_trait]
impl TokenSource for DriveAuth {
    async fn access_token(&self) -> Result<String> {
        DriveAuth::access_token(self).await
    }

    async fn refresh(&self) -> Result<()> {
        DriveAuth::refresh(self).await.map(|_| ())
    }

    async fn refresh_rejected(&self, rejected: &str) -> Result<()> {
        DriveAuth::refresh_rejected(self, rejected).await.map(|_| ())
    }
}
