//! HTTP plumbing shared by the remote providers.

use futures::StreamExt;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use siberian_common::{Error, Result};

use crate::token::TokenSource;

const USER_AGENT: &str = concat!("siberian-backup/", env!("CARGO_PKG_VERSION"));

/// Per-request timeout. Chunks are at most a few megabytes.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Build the HTTP client used by one provider instance.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| Error::Transport(format!("Failed to create HTTP client: {}", e)))
}

/// Wrap a request failure with the operation that was attempted.
pub fn transport_error(context: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Transport(format!("{}: timed out", context))
    } else {
        Error::Transport(format!("{}: {}", context, err))
    }
}

/// Turn a non-success response into `Error::Remote`, using `extract` to pull
/// the provider's own message out of the body.
pub async fn remote_error(response: Response, extract: fn(&str) -> Option<String>) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = extract(&body)
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(512).collect())
        })
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());
    Error::Remote {
        status: status.as_u16(),
        message,
    }
}

/// Pass successful responses through, convert the rest.
pub async fn check(response: Response, extract: fn(&str) -> Option<String>) -> Result<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(remote_error(response, extract).await)
    }
}

/// Send a bearer-authenticated request built by `build`.
///
/// A 401 answer triggers exactly one token refresh and one retry. A second
/// 401 is reported as an authentication error.
pub async fn send_authorized<F>(
    http: &Client,
    auth: &dyn TokenSource,
    context: &str,
    build: F,
) -> Result<Response>
where
    F: Fn(&Client) -> RequestBuilder + Send + Sync,
{
    let token = auth.access_token().await?;
    let response = build(http)
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| transport_error(context, e))?;
    if response.status() != StatusCode::UNAUTHORIZED {
        return Ok(response);
    }

    tracing::warn!(context, "Access token rejected, refreshing");
    auth.refresh_rejected(&token).await?;
    let token = auth.access_token().await?;
    let response = build(http)
        .bearer_auth(&token)
        .send()
        .await
        .map_err(|e| transport_error(context, e))?;
    if response.status() == StatusCode::UNAUTHORIZED {
        let message = match remote_error(response, json_error_message).await {
            Error::Remote { message, .. } => message,
            other => other.to_string(),
        };
        return Err(Error::Auth(format!(
            "{}: token rejected after refresh: {}",
            context, message
        )));
    }
    Ok(response)
}

/// Message from a Google-style JSON error body
/// (`{"error": {"message": "..."}}` or `{"error": "...", "error_description": "..."}`).
pub fn json_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if let Some(message) = error.get("message").and_then(|m| m.as_str()) {
        return Some(message.to_string());
    }
    let code = error.as_str()?;
    match value.get("error_description").and_then(|d| d.as_str()) {
        Some(description) => Some(format!("{}: {}", code, description)),
        None => Some(code.to_string()),
    }
}

/// Stream a response body into `dest`, returning the number of bytes
/// written. Fails if the body is shorter or longer than `Content-Length`.
pub async fn download_to_file(response: Response, dest: &Path) -> Result<u64> {
    let expected = response.content_length();

    if let Some(parent) = dest.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| transport_error("Download interrupted", e))?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;

    if let Some(expected) = expected {
        if expected != written {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(Error::Integrity(format!(
                "downloaded {} bytes, server announced {}",
                written, expected
            )));
        }
    }
    Ok(written)
}

/// 308 is "Resume Incomplete" in the resumable upload protocols.
pub fn is_resume_incomplete(status: StatusCode) -> bool {
    status == StatusCode::PERMANENT_REDIRECT
}

/// Session URL of a freshly started resumable upload.
pub fn location_header(response: &Response) -> Result<String> {
    response
        .headers()
        .get(header::LOCATION)
        .ok_or_else(|| Error::Protocol("No session URL in Location header".to_string()))?
        .to_str()
        .map(str::to_string)
        .map_err(|e| Error::Protocol(format!("Invalid session URL: {}", e)))
}

const RELATED_BOUNDARY: &str = "siberian_backup_boundary";

/// `multipart/related` body carrying JSON metadata followed by the media.
/// Returns the `Content-Type` header value and the body.
pub fn multipart_related(metadata: &serde_json::Value, data: &[u8]) -> (String, Vec<u8>) {
    let mut body = Vec::with_capacity(data.len() + 512);
    body.extend_from_slice(format!("--{}\r\n", RELATED_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", RELATED_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/zip\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--", RELATED_BOUNDARY).as_bytes());

    (
        format!("multipart/related; boundary={}", RELATED_BOUNDARY),
        body,
    )
}

/// Last acknowledged byte offset + 1 from a `Range: bytes=0-N` header.
pub fn acknowledged_bytes(response: &Response) -> Option<u64> {
    let range = response.headers().get(header::RANGE)?.to_str().ok()?;
    let end = range.strip_prefix("bytes=")?.split('-').nth(1)?;
    end.trim().parse::<u64>().ok().map(|n| n + 1)
}
