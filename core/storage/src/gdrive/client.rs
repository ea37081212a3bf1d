//! Google Drive API client.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use siberian_common::{Error, Result};

use super::auth::DriveAuth;
use crate::http::{
    acknowledged_bytes, check, is_resume_incomplete, json_error_message, location_header,
    multipart_related, send_authorized, transport_error,
};

/// Google API root. Drive lives under `/drive/v3`, uploads under
/// `/upload/drive/v3`.
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

const FILE_FIELDS: &str = "id,name,mimeType,size,createdTime,modifiedTime,trashed";

/// Drive file metadata.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Decimal string. Absent for folders.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trashed: bool,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    pub fn size_bytes(&self) -> u64 {
        self.size.as_ref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Server answer to one resumable chunk.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// 308: more data expected.
    Incomplete(Option<u64>),
    /// 200/201 with the created file, if the body named one.
    Complete(Option<DriveFile>),
}

/// Escape a value for use inside a single-quoted Drive query string.
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Drive client bound to one account.
pub struct DriveClient {
    http: Client,
    api_base: String,
    auth: DriveAuth,
}

impl DriveClient {
    pub fn new(http: Client, api_base: &str, auth: DriveAuth) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            auth,
        }
    }

    pub fn auth(&self) -> &DriveAuth {
        &self.auth
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.api_base)
    }

    async fn send<F>(&self, context: &str, build: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        send_authorized(&self.http, &self.auth, context, build).await
    }

    async fn list_query(&self, query: &str, page_size: u32) -> Result<Vec<DriveFile>> {
        let url = self.files_url();
        let fields = format!("files({}),nextPageToken", FILE_FIELDS);
        let page_size = page_size.to_string();
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let response = self
                .send("File listing", |http| {
                    let mut request = http.get(&url).query(&[
                        ("q", query),
                        ("fields", fields.as_str()),
                        ("pageSize", page_size.as_str()),
                        ("spaces", "drive"),
                    ]);
                    if let Some(token) = &page_token {
                        request = request.query(&[("pageToken", token.as_str())]);
                    }
                    request
                })
                .await?;
            let page: FileListResponse = check(response, json_error_message)
                .await?
                .json()
                .await
                .map_err(|e| Error::Protocol(format!("Malformed file listing: {}", e)))?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(files)
    }

    /// Top-level folder named `name`, if one exists.
    pub async fn find_folder(&self, name: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and mimeType = '{}' and 'root' in parents and trashed = false",
            quote(name),
            FOLDER_MIME_TYPE
        );
        Ok(self.list_query(&query, 10).await?.into_iter().next())
    }

    /// Create a top-level folder.
    pub async fn create_folder(&self, name: &str) -> Result<DriveFile> {
        let url = self.files_url();
        let body = json!({ "name": name, "mimeType": FOLDER_MIME_TYPE });
        let response = self
            .send("Folder creation", |http| {
                http.post(&url).query(&[("fields", FILE_FIELDS)]).json(&body)
            })
            .await?;
        parse_file(check(response, json_error_message).await?).await
    }

    /// Every non-trashed child of `folder_id`.
    pub async fn list_folder(&self, folder_id: &str) -> Result<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", quote(folder_id));
        self.list_query(&query, 1000).await
    }

    /// A non-trashed file called `name` directly inside `folder_id`.
    pub async fn find_file(&self, name: &str, folder_id: &str) -> Result<Option<DriveFile>> {
        let query = format!(
            "name = '{}' and '{}' in parents and trashed = false",
            quote(name),
            quote(folder_id)
        );
        Ok(self.list_query(&query, 10).await?.into_iter().next())
    }

    /// Metadata and media in one `multipart/related` request.
    pub async fn upload_simple(&self, metadata: &Value, data: Vec<u8>) -> Result<DriveFile> {
        let (content_type, body) = multipart_related(metadata, &data);
        let body = Bytes::from(body);
        let url = self.upload_url();
        let response = self
            .send("File upload", |http| {
                http.post(&url)
                    .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
                    .header(header::CONTENT_TYPE, content_type.as_str())
                    .body(body.clone())
            })
            .await?;
        parse_file(check(response, json_error_message).await?).await
    }

    /// Open a resumable session and return its URL.
    pub async fn start_resumable(&self, metadata: &Value, total_size: u64) -> Result<String> {
        let url = self.upload_url();
        let response = self
            .send("Resumable session start", |http| {
                http.post(&url)
                    .query(&[("uploadType", "resumable"), ("fields", FILE_FIELDS)])
                    .header("X-Upload-Content-Type", "application/zip")
                    .header("X-Upload-Content-Length", total_size.to_string())
                    .json(metadata)
            })
            .await?;
        let response = check(response, json_error_message).await?;
        location_header(&response)
    }

    /// Send one chunk to a resumable session.
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

        if is_resume_incomplete(response.status()) {
            return Ok(ChunkOutcome::Incomplete(acknowledged_bytes(&response)));
        }
        let response = check(response, json_error_message).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| transport_error("Chunk upload response", e))?;
        Ok(ChunkOutcome::Complete(
            serde_json::from_slice::<DriveFile>(&body).ok(),
        ))
    }

    /// Close an unfinished resumable session. Drive answers 499.
    pub async fn cancel_resumable(&self, session_url: &str) -> Result<()> {
        let response = self
            .http
            .delete(session_url)
            .send()
            .await
            .map_err(|e| transport_error("Session cancel", e))?;
        debug!(status = %response.status(), "Resumable session cancelled");
        Ok(())
    }

    /// Start a media download. The caller streams the body.
    pub async fn download(&self, file_id: &str) -> Result<Response> {
        let url = format!("{}/{}", self.files_url(), file_id);
        let response = self
            .send("File download", |http| {
                http.get(&url).query(&[("alt", "media")])
            })
            .await?;
        check(response, json_error_message).await
    }

    /// Delete a file. Returns `false` if it was already gone.
    pub async fn delete(&self, file_id: &str) -> Result<bool> {
        let url = format!("{}/{}", self.files_url(), file_id);
        let response = self.send("File delete", |http| http.delete(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response, json_error_message).await?;
        Ok(true)
    }

    /// Account the tokens belong to.
    pub async fn about(&self) -> Result<Option<String>> {
        let url = format!("{}/drive/v3/about", self.api_base);
        let response = self
            .send("Account lookup", |http| {
                http.get(&url).query(&[("fields", "user(emailAddress)")])
            })
            .await?;
        let body: Value = check(response, json_error_message)
            .await?
            .json()
            .await
            .map_err(|e| Error::Protocol(format!("Malformed about response: {}", e)))?;
        let email = body["user"]["emailAddress"].as_str().map(str::to_string);
        debug!(email = ?email, "Drive account");
        Ok(email)
    }
}

async fn parse_file(response: Response) -> Result<DriveFile> {
    response
        .json()
        .await
        .map_err(|e| Error::Protocol(format!("Malformed file resource: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_quoting() {
        assert_eq!(quote("it's"), "it\\'s");
        assert_eq!(quote("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_drive_file_parsing() {
        let file: DriveFile = serde_json::from_str(
            r#"{"id": "f1", "name": "Backups", "mimeType": "application/vnd.google-apps.folder"}"#,
        )
        .unwrap();
        assert!(file.is_folder());
        assert_eq!(file.size_bytes(), 0);
    }
}
