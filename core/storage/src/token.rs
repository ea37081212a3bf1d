//! Bearer token caching with an injectable clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};

use siberian_common::{Result, SettingsStore};

/// Source of the current time.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|n| *n).unwrap_or_else(|_| Utc::now())
    }
}

/// Short-lived bearer credential.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    pub fn new(token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Token valid for `lifetime` starting at `now`.
    pub fn expiring_in(token: impl Into<String>, now: DateTime<Utc>, lifetime: Duration) -> Self {
        Self::new(token, now + lifetime)
    }

    /// Whether the token may still be sent at `now`, keeping `margin` spare.
    pub fn is_usable_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now < self.expires_at - margin
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of bearer tokens for an authenticated API.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token believed to be valid.
    async fn access_token(&self) -> Result<String>;

    /// Discard the current token and obtain a new one.
    async fn refresh(&self) -> Result<()>;

    /// Called after the API refused `rejected`. Sources that cache tokens
    /// skip the refresh when another caller already replaced it.
    async fn refresh_rejected(&self, rejected: &str) -> Result<()> {
        let _ = rejected;
        self.refresh().await
    }
}

/// Default spare lifetime kept before a token is considered expired.
pub const DEFAULT_SAFETY_MARGIN_SECS: i64 = 300;

/// Per-provider token cache.
///
/// Optionally mirrors its content into a settings store so the next
/// process can reuse a still-valid token.
pub struct TokenCache {
    token: Option<AuthToken>,
    margin: Duration,
    clock: Arc<dyn Clock>,
    persist: Option<(Arc<dyn SettingsStore>, String)>,
}

impl TokenCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            token: None,
            margin: Duration::seconds(DEFAULT_SAFETY_MARGIN_SECS),
            clock,
            persist: None,
        }
    }

    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Seed the cache with a known token.
    pub fn with_token(mut self, token: AuthToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Mirror the cache under `key` in `store`, loading any token already
    /// stored there.
    pub fn persisted(mut self, store: Arc<dyn SettingsStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        match store.get(&key) {
            Ok(Some(value)) => match serde_json::from_value::<AuthToken>(value) {
                Ok(token) => self.token = Some(token),
                Err(e) => tracing::warn!(key = %key, "Ignoring unreadable cached token: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::warn!(key = %key, "Could not read cached token: {}", e),
        }
        self.persist = Some((store, key));
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The cached token, if it is still usable.
    pub fn current(&self) -> Option<&AuthToken> {
        let now = self.clock.now();
        self.token
            .as_ref()
            .filter(|t| t.is_usable_at(now, self.margin))
    }

    /// The cached token regardless of expiry.
    pub fn peek(&self) -> Option<&AuthToken> {
        self.token.as_ref()
    }

    /// Replace the cached token.
    pub fn store(&mut self, token: AuthToken) {
        if let Some((store, key)) = &self.persist {
            let result = serde_json::to_value(&token)
                .map_err(siberian_common::Error::from)
                .and_then(|v| store.set(key, v));
            if let Err(e) = result {
                tracing::warn!(key = %key, "Could not persist token: {}", e);
            }
        }
        self.token = Some(token);
    }

    /// Drop the cached token so the next use regenerates it.
    pub fn invalidate(&mut self) {
        self.token = None;
        if let Some((store, key)) = &self.persist {
            if let Err(e) = store.remove(key) {
                tracing::warn!(key = %key, "Could not clear persisted token: {}", e);
            }
        }
    }
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("token", &self.token)
            .field("margin", &self.margin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siberian_common::MemoryStore;

    fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_token_respects_margin() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut cache = TokenCache::new(clock.clone());
        cache.store(AuthToken::expiring_in("t1", start(), Duration::hours(1)));

        assert_eq!(cache.current().unwrap().token, "t1");

        // 54 minutes in: 6 minutes left, still outside the 5 minute margin
        clock.advance(Duration::minutes(54));
        assert!(cache.current().is_some());

        // 56 minutes in: inside the margin
        clock.advance(Duration::minutes(2));
        assert!(cache.current().is_none());
        assert!(cache.peek().is_some());
    }

    #[test]
    fn test_invalidate() {
        let clock = Arc::new(ManualClock::new(start()));
        let mut cache = TokenCache::new(clock)
            .with_token(AuthToken::expiring_in("t1", start(), Duration::hours(1)));
        cache.invalidate();
        assert!(cache.current().is_none());
    }

    #[test]
    fn test_persisted_token_is_reloaded() {
        let store: Arc<dyn SettingsStore> = Arc::new(MemoryStore::new());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(start()));

        {
            let mut cache = TokenCache::new(clock.clone()).persisted(store.clone(), "token.gcs");
            assert!(cache.current().is_none());
            cache.store(AuthToken::expiring_in("saved", start(), Duration::hours(1)));
        }

        let cache = TokenCache::new(clock).persisted(store.clone(), "token.gcs");
        assert_eq!(cache.current().unwrap().token, "saved");
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AuthToken::expiring_in("secret-value", start(), Duration::hours(1));
        let printed = format!("{:?}", token);
        assert!(!printed.contains("secret-value"));
    }
}
