//! Cloud Storage JSON API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use siberian_common::{Error, Result};

use super::auth::ServiceAccountAuth;
use crate::http::{
    acknowledged_bytes, check, is_resume_incomplete, json_error_message, location_header,
    multipart_related, send_authorized, transport_error,
};

/// Object names are sent as a single path segment.
const OBJECT_NAME_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Object resource as returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct GcsObject {
    pub name: String,
    /// Decimal string, as the API encodes 64-bit integers.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub id: Option<String>,
}

impl GcsObject {
    pub fn size_bytes(&self) -> u64 {
        self.size.as_ref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Server answer to one resumable chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// 308: more data expected. Carries the acknowledged byte count, if sent.
    Incomplete(Option<u64>),
    /// 200/201: object created.
    Complete(GcsObject),
}

/// Cloud Storage client for one bucket.
pub struct GcsClient {
    http: Client,
    api_base: String,
    bucket: String,
    auth: ServiceAccountAuth,
}

impl GcsClient {
    pub fn new(http: Client, api_base: &str, bucket: &str, auth: ServiceAccountAuth) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bucket: bucket.to_string(),
            auth,
        }
    }

    pub fn auth(&self) -> &ServiceAccountAuth {
        &self.auth
    }

    fn bucket_url(&self) -> String {
        format!("{}/storage/v1/b/{}", self.api_base, self.bucket)
    }

    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/o/{}",
            self.bucket_url(),
            utf8_percent_encode(name, OBJECT_NAME_SET)
        )
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/storage/v1/b/{}/o", self.api_base, self.bucket)
    }

    async fn send<F>(&self, context: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        send_authorized(&self.http, &self.auth, context, build).await
    }

    /// Metadata and media in one `multipart/related` request.
    pub async fn upload_simple(&self, metadata: &Value, data: Vec<u8>) -> Result<GcsObject> {
        let (content_type, body) = multipart_related(metadata, &data);
        let body = Bytes::from(body);
        let url = self.upload_url();
        let response = self
            .send("Object upload", |http| {
                http.post(&url)
                    .query(&[("uploadType", "multipart")])
                    .header(header::CONTENT_TYPE, content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        parse_object(check(response, json_error_message).await?).await
    }

    /// Open a resumable session and return its URL.
    pub async fn start_resumable(&self, metadata: &Value, total_size: u64) -> Result<String> {
        let url = self.upload_url();
        let response = self
            .send("Resumable session start", |http| {
                http.post(&url)
                    .query(&[("uploadType", "resumable")])
                    .header("X-Upload-Content-Type", "application/zip")
                    .header("X-Upload-Content-Length", total_size.to_string())
                    .json(metadata)
            })
            .await?;
        let response = check(response, json_error_message).await?;
        location_header(&response)
    }

    /// Send one chunk to a resumable session. The session URL is its own
    /// credential, so no bearer token is attached.
    pub async fn put_chunk(
        &self,
        session_url: &str,
        chunk: Bytes,
        content_range: &str,
    ) -> Result<ChunkOutcome> {
        let response = self
            .http
            .put(session_url)
            .header(header::CONTENT_RANGE, content_range)
            .body(chunk)
            .send()
            .await
            .map_err(|e| transport_error("Chunk upload", e))?;

        let status = response.status();
        if is_resume_incomplete(status) {
            return Ok(ChunkOutcome::Incomplete(acknowledged_bytes(&response)));
        }
        let response = check(response, json_error_message).await?;
        Ok(ChunkOutcome::Complete(parse_object(response).await?))
    }

    /// Cancel a resumable session. Google answers 499 on success.
    pub async fn cancel_session(&self, session_url: &str) -> Result<()> {
        let response = self
            .http
            .delete(session_url)
            .send()
            .await
            .map_err(|e| transport_error("Session cancel", e))?;
        debug!(status = %response.status(), "Resumable session cancelled");
        Ok(())
    }

    /// All objects under `prefix`, following page tokens.
    pub async fn list_objects(&self, prefix: &str) -> Result<Vec<GcsObject>> {
        let url = format!("{}/o", self.bucket_url());
        let mut objects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .send("Object listing", |http| {
                    let mut request = http
                        .get(&url)
                        .query(&[("fields", "items(name,size,updated,id),nextPageToken")]);
                    if !prefix.is_empty() {
                        request = request.query(&[("prefix", prefix)]);
                    }
                    if let Some(token) = &page_token {
                        request = request.query(&[("pageToken", token.as_str())]);
                    }
                    request
                })
                .await?;
            let page: ObjectList = check(response, json_error_message)
                .await?
                .json()
                .await
                .map_err(|e| Error::Protocol(format!("Malformed object listing: {}", e)))?;
            objects.extend(page.items);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(objects)
    }

    /// Object metadata, `None` on 404.
    pub async fn get_object(&self, name: &str) -> Result<Option<GcsObject>> {
        let url = self.object_url(name);
        let response = self.send("Object lookup", |http| http.get(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        parse_object(check(response, json_error_message).await?)
            .await
            .map(Some)
    }

    /// Start a media download. The caller streams the body.
    pub async fn download(&self, name: &str) -> Result<Response> {
        let url = self.object_url(name);
        let response = self
            .send("Object download", |http| {
                http.get(&url).query(&[("alt", "media")])
            })
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("Object not found: {}", name)));
        }
        check(response, json_error_message).await
    }

    /// Delete an object. Returns `false` if it did not exist.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let url = self.object_url(name);
        let response = self.send("Object delete", |http| http.delete(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, json_error_message).await?;
        Ok(true)
    }

    /// Bucket metadata request, used as a connectivity check.
    pub async fn get_bucket(&self) -> Result<()> {
        let url = self.bucket_url();
        let response = self.send("Bucket lookup", |http| http.get(&url)).await?;
        check(response, json_error_message).await?;
        Ok(())
    }
}

async fn parse_object(response: Response) -> Result<GcsObject> {
    response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("Malformed object resource: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name_encoding() {
        let encoded = utf8_percent_encode("nightly/siberian backup.zip", OBJECT_NAME_SET).to_string();
        assert_eq!(encoded, "nightly%2Fsiberian%20backup.zip");
    }

    #[test]
    fn test_object_size_parsing() {
        let object: GcsObject =
            serde_json::from_str(r#"{"name": "a.zip", "size": "6291456"}"#).unwrap();
        assert_eq!(object.size_bytes(), 6 * 1024 * 1024);
        assert!(object.updated.is_none());
    }
}
