//! Service-account authentication for Cloud Storage.
//!
//! A signed RS256 JWT asserting the service account is exchanged at the
//! token endpoint for a short-lived bearer token, which is cached until
//! shortly before it expires.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::form_urlencoded;

use siberian_common::{Error, Result};

use super::provider::GcsConfig;
use crate::http::{json_error_message, remote_error, transport_error};
use crate::token::{AuthToken, TokenCache, TokenSource};

/// OAuth scope for object read/write.
pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime requested for each assertion. Google caps it at one hour.
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// JWT claim set for the service-account assertion.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub iss: String,
    pub scope: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    ASSERTION_LIFETIME_SECS
}

/// Parse a PEM private key, reporting problems as configuration errors.
pub fn parse_private_key(pem: &str) -> Result<EncodingKey> {
    EncodingKey::from_rsa_pem(pem.as_bytes())
        .map_err(|e| Error::Config(format!("Invalid service account private key: {}", e)))
}

/// Issues and caches bearer tokens for one service account.
pub struct ServiceAccountAuth {
    http: Client,
    client_email: String,
    token_uri: String,
    key: EncodingKey,
    cache: Mutex<TokenCache>,
}

impl ServiceAccountAuth {
    pub fn new(http: Client, config: &GcsConfig, cache: TokenCache) -> Result<Self> {
        Ok(Self {
            http,
            client_email: config.client_email.clone(),
            token_uri: config.token_uri.clone(),
            key: parse_private_key(&config.private_key)?,
            cache: Mutex::new(cache),
        })
    }

    /// Signed assertion valid from `now`.
    pub fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let claims = Claims {
            iss: self.client_email.clone(),
            scope: STORAGE_SCOPE.to_string(),
            aud: self.token_uri.clone(),
            iat: now.timestamp(),
            exp: now.timestamp() + ASSERTION_LIFETIME_SECS,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.key)
            .map_err(|e| Error::Auth(format!("Failed to sign assertion: {}", e)))
    }

    /// A usable bearer token, exchanging a new assertion if needed.
    pub async fn access_token(&self) -> Result<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.current() {
            return Ok(token.token.clone());
        }
        let token = self.exchange(cache.now()).await?;
        let value = token.token.clone();
        cache.store(token);
        Ok(value)
    }

    /// Drop the cached token and fetch a new one.
    pub async fn refresh(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.refresh_locked(&mut cache).await
    }

    /// Replace `rejected`, unless the cache already holds a different
    /// usable token.
    pub async fn refresh_rejected(&self, rejected: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if cache.current().is_some_and(|t| t.token != rejected) {
            debug!("Rejected token was already replaced");
            return Ok(());
        }
        self.refresh_locked(&mut cache).await
    }

    async fn refresh_locked(&self, cache: &mut TokenCache) -> Result<()> {
        cache.invalidate();
        let token = self.exchange(cache.now()).await?;
        cache.store(token);
        Ok(())
    }

    async fn exchange(&self, now: DateTime<Utc>) -> Result<AuthToken> {
        let assertion = self.assertion(now)?;
        let body = form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", JWT_BEARER_GRANT)
            .append_pair("assertion", &assertion)
            .finish();

        debug!(token_uri = %self.token_uri, "Exchanging service account assertion");
        let response = self
            .http
            .post(&self.token_uri)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| transport_error("Token exchange", e))?;

        let status = response.status();
        if !status.is_success() {
            let err = remote_error(response, json_error_message).await;
            return Err(match (status, err) {
                (StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED, Error::Remote { message, .. }) => {
                    Error::Auth(format!("Token exchange rejected: {}", message))
                }
                (_, other) => other,
            });
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed token response: {}", e)))?;
        info!(account = %self.client_email, expires_in = parsed.expires_in, "Obtained access token");
        Ok(AuthToken::expiring_in(
            parsed.access_token,
            now,
            Duration::seconds(parsed.expires_in),
        ))
    }
}

#[async_trait]
impl TokenSource for ServiceAccountAuth {
    async fn access_token(&self) -> Result<String> {
        ServiceAccountAuth::access_token(self).await
    }

    async fn refresh(&self) -> Result<()> {
        ServiceAccountAuth::refresh(self).await
    }

    async fn refresh_rejected(&self, rejected: &str) -> Result<()> {
        ServiceAccountAuth::refresh_rejected(self, rejected).await
    }
}
