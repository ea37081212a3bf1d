//! OAuth proxy protocol for Google Drive.
//!
//! The OAuth client secret lives on the proxy, never here. The flow is:
//! 1. Send the user to [`consent_url`], which carries our callback URL.
//! 2. The proxy completes the Google consent screen and redirects to the
//!    callback with an encrypted [`ProxyPayload`].
//! 3. [`ProxyPayload::open`] decrypts it locally into a [`TokenBundle`].
//!
//! Access tokens are later refreshed through the proxy as well.

use aes::{Aes128, Aes256};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};
use url::{form_urlencoded, Url};
use zeroize::Zeroizing;

use siberian_common::{Error, Result};

use crate::http::{json_error_message, remote_error, transport_error};

/// Encrypted token bundle as delivered by the proxy. Every field is base64.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyPayload {
    pub key: String,
    pub iv: String,
    pub data: String,
}

impl fmt::Debug for ProxyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyPayload")
            .field("key", &"<redacted>")
            .field("iv", &self.iv)
            .field("data", &format!("<{} base64 chars>", self.data.len()))
            .finish()
    }
}

/// Decrypted OAuth tokens.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    /// Lifetime of the access token in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl fmt::Debug for TokenBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBundle")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("email", &self.email)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

fn decode_field(name: &str, value: &str) -> Result<Zeroizing<Vec<u8>>> {
    STANDARD
        .decode(value.trim())
        .map(Zeroizing::new)
        .map_err(|e| Error::Auth(format!("Proxy payload field '{}' is not base64: {}", name, e)))
}

impl ProxyPayload {
    /// Read the payload from the callback URL's query string.
    pub fn from_callback_url(callback: &str) -> Result<Self> {
        let url = Url::parse(callback)
            .map_err(|e| Error::Validation(format!("Invalid callback URL: {}", e)))?;
        let mut key = None;
        let mut iv = None;
        let mut data = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "key" => key = Some(value.into_owned()),
                "iv" => iv = Some(value.into_owned()),
                "data" => data = Some(value.into_owned()),
                _ => {}
            }
        }
        match (key, iv, data) {
            (Some(key), Some(iv), Some(data)) => Ok(Self { key, iv, data }),
            _ => Err(Error::Validation(
                "Callback URL lacks the key, iv and data parameters".to_string(),
            )),
        }
    }

    /// Decrypt (AES-CBC with PKCS#7 padding) and parse the bundle.
    pub fn open(&self) -> Result<TokenBundle> {
        let key = decode_field("key", &self.key)?;
        let iv = decode_field("iv", &self.iv)?;
        let data = decode_field("data", &self.data)?;

        let plaintext = Zeroizing::new(match key.len() {
            32 => cbc::Decryptor::<Aes256>::new_from_slices(&key, &iv)
                .map_err(|_| Error::Auth("Proxy payload IV must be 16 bytes".to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&key, &iv)
                .map_err(|_| Error::Auth("Proxy payload IV must be 16 bytes".to_string()))?
                .decrypt_padded_vec_mut::<Pkcs7>(&data),
            n => {
                return Err(Error::Auth(format!(
                    "Proxy payload key has {} bytes, expected 16 or 32",
                    n
                )))
            }
        }
        .map_err(|_| Error::Auth("Proxy payload failed to decrypt".to_string()))?);

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::Auth(format!("Decrypted proxy payload is not a token bundle: {}", e)))
    }

    /// Encrypt `bundle` under a 256-bit `key` and `iv`, as the proxy does.
    pub fn seal(bundle: &TokenBundle, key: &[u8; 32], iv: &[u8; 16]) -> Result<Self> {
        let plaintext = Zeroizing::new(serde_json::to_vec(bundle)?);
        let ciphertext = cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::Auth("Invalid payload key or IV length".to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);
        Ok(Self {
            key: STANDARD.encode(key),
            iv: STANDARD.encode(iv),
            data: STANDARD.encode(ciphertext),
        })
    }
}

/// Consent URL to open in the user's browser.
pub fn consent_url(proxy_url: &str, callback_url: &str, now: DateTime<Utc>) -> String {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("callback", callback_url)
        .append_pair("timestamp", &now.timestamp().to_string())
        .finish();
    format!("{}/authorize?{}", proxy_url.trim_end_matches('/'), query)
}

/// Refresh answer: plain tokens, or a payload encrypted like the callback.
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Encrypted(ProxyPayload),
    Plain(TokenBundle),
}

/// Exchange a refresh token for a new access token through the proxy.
pub async fn refresh_via_proxy(
    http: &Client,
    proxy_url: &str,
    refresh_token: &str,
) -> Result<TokenBundle> {
    let url = format!("{}/refresh", proxy_url.trim_end_matches('/'));
    debug!(url = %url, "Refreshing access token through proxy");

    let response = http
        .post(&url)
        .json(&serde_json::json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .map_err(|e| transport_error("Token refresh", e))?;

    let status = response.status();
    if !status.is_success() {
        let err = remote_error(response, json_error_message).await;
        return Err(match (status, err) {
            (
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN,
                Error::Remote { message, .. },
            ) => Error::Auth(format!("Proxy refused the refresh token: {}", message)),
            (_, other) => other,
        });
    }

    let parsed: RefreshResponse = response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("Malformed refresh response: {}", e)))?;
    let bundle = match parsed {
        RefreshResponse::Encrypted(payload) => payload.open()?,
        RefreshResponse::Plain(bundle) => bundle,
    };
    info!(rotated = bundle.refresh_token.is_some(), "Access token refreshed");
    Ok(bundle)
}
