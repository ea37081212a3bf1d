//! Google Drive storage provider implementation.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use siberian_common::{
    is_backup_filename, key_basename, Error, FileInfo, ProviderId, Result, SettingsStore,
    UploadMetadata, UploadResult,
};

use super::auth::DriveAuth;
use super::client::{ChunkOutcome, DriveClient, DriveFile, DEFAULT_API_BASE};
use crate::config::{FieldKind, FieldSpec, ProviderConfig, RawConfig};
use crate::http::{build_client, download_to_file};
use crate::provider::StorageProvider;
use crate::token::{SystemClock, TokenCache};
use crate::transfer::{source_size, ChunkReader, SessionHandle, UploadSession, CHUNK_SIZE};

/// OAuth proxy holding the Drive client secret.
pub const DEFAULT_PROXY_URL: &str = "https://oauth.siberiancms.com/gdrive";

/// Folder created in the user's Drive for the artifacts.
pub const DEFAULT_FOLDER_NAME: &str = "Siberian Backups";

/// Files below this size are sent in a single request.
pub const SIMPLE_UPLOAD_LIMIT: u64 = 5 * 1024 * 1024;

static SCHEMA: &[FieldSpec] = &[
    FieldSpec::required(
        "refresh_token",
        "Refresh token (set by the authorization flow)",
        FieldKind::Password,
    ),
    FieldSpec::optional("folder_name", "Backup folder name", FieldKind::Text),
    FieldSpec::optional("proxy_url", "OAuth proxy URL", FieldKind::Text),
    FieldSpec::optional("endpoint", "Custom API endpoint", FieldKind::Text),
];

/// Google Drive provider configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct GDriveConfig {
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default = "default_folder_name")]
    pub folder_name: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Account the tokens were issued for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_proxy_url() -> String {
    DEFAULT_PROXY_URL.to_string()
}

fn default_folder_name() -> String {
    DEFAULT_FOLDER_NAME.to_string()
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

impl fmt::Debug for GDriveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GDriveConfig")
            .field("proxy_url", &self.proxy_url)
            .field("folder_name", &self.folder_name)
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("token_expires_at", &self.token_expires_at)
            .field("email", &self.email)
            .field("api_base", &self.api_base)
            .finish()
    }
}

fn http_url(field: &str, value: String) -> Result<String> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(Error::Validation(format!(
            "Field '{}' must be an http(s) URL",
            field
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

/// Google Drive storage provider.
///
/// Artifacts live flat inside one folder of the user's Drive, which is
/// looked up by name and created on first use.
pub struct GDriveProvider {
    config: Option<GDriveConfig>,
    client: Option<DriveClient>,
    folder_id: Mutex<Option<String>>,
    chunk_size: usize,
    simple_limit: u64,
}

impl GDriveProvider {
    /// Create a provider with an in-memory token cache.
    pub fn new(config: Option<GDriveConfig>) -> Result<Self> {
        Self::with_token_cache(config, TokenCache::new(Arc::new(SystemClock)), None)
    }

    /// Create a provider that keeps its access token in `cache` and writes
    /// rotated refresh tokens to `store`.
    ///
    /// A configuration without a refresh token yields an unconfigured
    /// provider.
    pub fn with_token_cache(
        config: Option<GDriveConfig>,
        cache: TokenCache,
        store: Option<Arc<dyn SettingsStore>>,
    ) -> Result<Self> {
        let client = match &config {
            Some(c) if c.refresh_token.is_some() => {
                let http = build_client()?;
                let mut auth = DriveAuth::new(http.clone(), c, cache)?;
                if let Some(store) = store {
                    auth = auth.with_store(store);
                }
                Some(DriveClient::new(http, &c.api_base, auth))
            }
            _ => None,
        };
        Ok(Self {
            config,
            client,
            folder_id: Mutex::new(None),
            chunk_size: CHUNK_SIZE,
            simple_limit: SIMPLE_UPLOAD_LIMIT,
        })
    }

    /// Override the resumable chunk size. Must be a multiple of 256 KiB.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Override the size from which resumable sessions are used.
    pub fn with_simple_limit(mut self, limit: u64) -> Self {
        self.simple_limit = limit;
        self
    }

    fn client(&self) -> Result<&DriveClient> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::NotConfigured("gdrive".to_string()))
    }

    fn folder_name(&self) -> &str {
        self.config
            .as_ref()
            .map(|c| c.folder_name.as_str())
            .unwrap_or(DEFAULT_FOLDER_NAME)
    }

    /// Id of the backup folder, looking it up or creating it on first use.
    async fn folder(&self) -> Result<String> {
        let mut cached = self.folder_id.lock().await;
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let client = self.client()?;
        let name = self.folder_name();
        let folder = match client.find_folder(name).await? {
            Some(folder) => folder,
            None => {
                let folder = client.create_folder(name).await?;
                info!(folder = %name, id = %folder.id, "Created backup folder");
                folder
            }
        };
        *cached = Some(folder.id.clone());
        Ok(folder.id)
    }

    async fn upload_resumable(
        &self,
        src: &Path,
        name: &str,
        folder: &str,
        resource: &Value,
        size: u64,
    ) -> Result<DriveFile> {
        let client = self.client()?;
        let session_url = client.start_resumable(resource, size).await?;
        let mut session = UploadSession::new(SessionHandle::SessionUrl(session_url.clone()), size);

        match self
            .send_chunks(client, src, name, folder, &session_url, &mut session)
            .await
        {
            Ok(file) => Ok(file),
            Err(e) => {
                if let Err(cancel_err) = client.cancel_resumable(&session_url).await {
                    warn!(name, error = %cancel_err, "Failed to cancel upload session");
                }
                Err(e)
            }
        }
    }

    async fn send_chunks(
        &self,
        client: &DriveClient,
        src: &Path,
        name: &str,
        folder: &str,
        session_url: &str,
        session: &mut UploadSession,
    ) -> Result<DriveFile> {
        let (mut reader, _) = ChunkReader::open(src, self.chunk_size).await?;

        while let Some(chunk) = reader.next_chunk().await? {
            let len = chunk.len() as u64;
            let last = session.is_final_chunk(len);
            let range = session.content_range(len);

            let outcome = client.put_chunk(session_url, chunk, &range).await?;
            session.record_chunk(len, None);
            debug!(range = %range, last, "Chunk uploaded");

            match (outcome, last) {
                (ChunkOutcome::Incomplete(acknowledged), false) => {
                    if let Some(acked) = acknowledged {
                        if acked != session.bytes_sent {
                            return Err(Error::Integrity(format!(
                                "server acknowledged {} of {} bytes sent",
                                acked, session.bytes_sent
                            )));
                        }
                    }
                }
                (ChunkOutcome::Complete(file), true) => {
                    session.verify_complete()?;
                    return match file {
                        Some(file) => Ok(file),
                        None => self.confirm_upload(name, folder, session.total_size).await,
                    };
                }
                (ChunkOutcome::Incomplete(_), true) => {
                    return Err(Error::Protocol(
                        "Server expects more data after the final chunk".to_string(),
                    ));
                }
                (ChunkOutcome::Complete(_), false) => {
                    return Err(Error::Protocol(
                        "Server finished the upload before the final chunk".to_string(),
                    ));
                }
            }
        }

        Err(Error::Integrity(format!(
            "source ended after {} of {} bytes",
            session.bytes_sent, session.total_size
        )))
    }

    /// The final chunk was accepted without naming the created file, so
    /// look it up by name.
    async fn confirm_upload(&self, name: &str, folder: &str, size: u64) -> Result<DriveFile> {
        warn!(name, "Upload response carried no file id, searching by name");
        let file = self
            .client()?
            .find_file(name, folder)
            .await?
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "Upload finished but no file named {} exists in the backup folder",
                    name
                ))
            })?;
        if file.size.is_some() && file.size_bytes() != size {
            return Err(Error::Integrity(format!(
                "{} holds {} bytes, expected {}",
                name,
                file.size_bytes(),
                size
            )));
        }
        Ok(file)
    }
}

#[async_trait]
impl StorageProvider for GDriveProvider {
    fn identifier(&self) -> ProviderId {
        ProviderId::Gdrive
    }

    fn display_name(&self) -> &str {
        "Google Drive"
    }

    fn config_schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    fn validate_config(&self, raw: &Value) -> Result<ProviderConfig> {
        let raw = RawConfig::new(raw, SCHEMA)?;

        let access_token = raw.text("access_token");
        let token_expires_at = match (&access_token, raw.number("expires_in")?) {
            (Some(_), Some(secs)) => {
                let secs = i64::try_from(secs).map_err(|_| {
                    Error::Validation("Field 'expires_in' is out of range".to_string())
                })?;
                Some(Utc::now() + Duration::seconds(secs))
            }
            _ => None,
        };

        Ok(ProviderConfig::Gdrive(GDriveConfig {
            proxy_url: match raw.text("proxy_url") {
                Some(url) => http_url("proxy_url", url)?,
                None => default_proxy_url(),
            },
            folder_name: raw.text("folder_name").unwrap_or_else(default_folder_name),
            refresh_token: Some(raw.required("refresh_token")?),
            access_token: token_expires_at.and(access_token),
            token_expires_at,
            email: raw.text("email"),
            api_base: match raw.text("endpoint") {
                Some(url) => http_url("endpoint", url)?,
                None => default_api_base(),
            },
        }))
    }

    async fn initialize(&self) -> Result<()> {
        self.client()?;
        Ok(())
    }

    async fn upload(
        &self,
        src: &Path,
        dest_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let client = self.client()?;
        let name = key_basename(dest_key);
        let size = source_size(src).await?;
        let folder = self.folder().await?;

        let resource = json!({
            "name": name,
            "parents": [folder],
            "mimeType": "application/zip",
            "appProperties": metadata.properties(),
        });

        let file = if size < self.simple_limit {
            let data = tokio::fs::read(src).await?;
            if data.len() as u64 != size {
                return Err(Error::Integrity(format!(
                    "read {} bytes from {}, expected {}",
                    data.len(),
                    src.display(),
                    size
                )));
            }
            client.upload_simple(&resource, data).await?
        } else {
            self.upload_resumable(src, name, &folder, &resource, size)
                .await?
        };

        info!(name, id = %file.id, size, "Drive upload complete");
        Ok(UploadResult {
            provider: ProviderId::Gdrive,
            key: name.to_string(),
            size,
            remote_id: Some(file.id),
        })
    }

    async fn download(&self, src_key: &str, dest: &Path) -> Result<()> {
        let client = self.client()?;
        let name = key_basename(src_key);
        let folder = self.folder().await?;
        let file = client
            .find_file(name, &folder)
            .await?
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", name)))?;

        let response = client.download(&file.id).await?;
        let size = download_to_file(response, dest).await?;
        info!(name, size, "Drive download complete");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        let client = self.client()?;
        let folder = self.folder().await?;

        let mut files = Vec::new();
        for file in client.list_folder(&folder).await? {
            if file.is_folder() {
                continue;
            }
            if !is_backup_filename(&file.name) {
                warn!(name = %file.name, "Ignoring non-backup file in backup folder");
                continue;
            }
            if !file.name.starts_with(prefix) {
                continue;
            }
            files.push(FileInfo {
                key: file.name.clone(),
                size: file.size_bytes(),
                modified: file
                    .modified_time
                    .or(file.created_time)
                    .unwrap_or_else(Utc::now),
                remote_id: Some(file.id.clone()),
                name: file.name,
            });
        }
        files.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(files)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let client = self.client()?;
        let name = key_basename(key);
        let folder = self.folder().await?;

        match client.find_file(name, &folder).await? {
            Some(file) => {
                if !client.delete(&file.id).await? {
                    debug!(name, "File already absent");
                }
                Ok(())
            }
            None => {
                warn!(name, "Nothing to delete, file not found");
                Ok(())
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let folder = self.folder().await?;
        Ok(self
            .client()?
            .find_file(key_basename(key), &folder)
            .await?
            .is_some())
    }

    async fn test_connection(&self) -> Result<()> {
        let email = self.client()?.about().await?;
        info!(email = ?email, "Drive connection verified");
        Ok(())
    }

    async fn refresh_credentials(&self) -> Result<bool> {
        self.client()?.auth().refresh().await?;
        Ok(true)
    }
}
