//! S3 storage provider implementation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use siberian_common::{
    is_backup_filename, key_basename, Error, FileInfo, ProviderId, Result, UploadMetadata,
    UploadResult,
};

use super::client::S3Client;
use crate::config::{FieldKind, FieldSpec, ProviderConfig, RawConfig};
use crate::http::download_to_file;
use crate::provider::StorageProvider;
use crate::token::{Clock, SystemClock};
use crate::transfer::{
    source_size, ChunkReader, SessionHandle, UploadSession, CHUNK_SIZE, MULTIPART_THRESHOLD,
};

/// Storage classes accepted by the `storage_class` field.
pub const STORAGE_CLASSES: &[&str] = &[
    "STANDARD",
    "STANDARD_IA",
    "ONEZONE_IA",
    "INTELLIGENT_TIERING",
    "GLACIER_IR",
];

static SCHEMA: &[FieldSpec] = &[
    FieldSpec::required("access_key_id", "Access key ID", FieldKind::Text),
    FieldSpec::required("secret_access_key", "Secret access key", FieldKind::Password),
    FieldSpec::required("region", "Region", FieldKind::Text),
    FieldSpec::required("bucket", "Bucket", FieldKind::Text),
    FieldSpec::optional("endpoint", "Custom endpoint (S3-compatible services)", FieldKind::Text),
    FieldSpec::optional("prefix", "Key prefix", FieldKind::Text),
    FieldSpec::select("storage_class", "Storage class", false, STORAGE_CLASSES),
];

/// S3 provider configuration.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
    pub bucket: String,
    /// Custom endpoint URL. Switches to path-style addressing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Prefix prepended to every key, normalized to end with `/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .field("prefix", &self.prefix)
            .field("storage_class", &self.storage_class)
            .finish()
    }
}

/// Bucket names: 3-63 chars of lowercase letters, digits, dots and hyphens,
/// starting and ending with a letter or digit.
fn valid_bucket_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    (3..=63).contains(&bytes.len())
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'.' || *b == b'-')
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
}

fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim_matches('/');
    (!trimmed.is_empty()).then(|| format!("{}/", trimmed))
}

/// `x-amz-meta-*` pairs describing the artifact. Header values must be
/// visible ASCII, so other values are left out.
fn object_metadata(metadata: &UploadMetadata) -> Vec<(String, String)> {
    metadata
        .properties()
        .into_iter()
        .filter(|(_, value)| value.bytes().all(|b| (0x20..0x7f).contains(&b)))
        .map(|(name, value)| (name.replace('_', "-"), value))
        .collect()
}

/// S3 (and S3-compatible) storage provider.
pub struct S3Provider {
    config: Option<S3Config>,
    client: Option<S3Client>,
    part_size: usize,
    multipart_threshold: u64,
}

impl S3Provider {
    /// Create a provider. `None` yields an unconfigured provider.
    ///
    /// # Errors
    /// - The custom endpoint is not a valid URL
    /// - The HTTP client cannot be created
    pub fn new(config: Option<S3Config>) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a provider that signs with timestamps from `clock`.
    pub fn with_clock(config: Option<S3Config>, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = match &config {
            Some(c) => Some(S3Client::new(c.clone(), clock)?),
            None => None,
        };
        Ok(Self {
            config,
            client,
            part_size: CHUNK_SIZE,
            multipart_threshold: MULTIPART_THRESHOLD,
        })
    }

    /// Override the multipart part size.
    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size;
        self
    }

    /// Override the size above which multipart upload is used.
    pub fn with_multipart_threshold(mut self, threshold: u64) -> Self {
        self.multipart_threshold = threshold;
        self
    }

    fn client(&self) -> Result<&S3Client> {
        self.client
            .as_ref()
            .ok_or_else(|| Error::NotConfigured("s3".to_string()))
    }

    fn key_prefix(&self) -> &str {
        self.config
            .as_ref()
            .and_then(|c| c.prefix.as_deref())
            .unwrap_or("")
    }

    /// Bucket key for a provider-relative key.
    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix(), key.trim_start_matches('/'))
    }

    async fn upload_multipart(
        &self,
        src: &Path,
        key: &str,
        size: u64,
        meta: &[(String, String)],
    ) -> Result<()> {
        let client = self.client()?;
        let upload_id = client.create_multipart(key, meta).await?;
        let mut session = UploadSession::new(SessionHandle::UploadId(upload_id.clone()), size);
        debug!(key, upload_id = %upload_id, "Multipart upload started");

        match self.send_parts(client, src, key, &upload_id, &mut session).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(abort_err) = client.abort_multipart(key, &upload_id).await {
                    warn!(key, upload_id = %upload_id, error = %abort_err, "Failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        client: &S3Client,
        src: &Path,
        key: &str,
        upload_id: &str,
        session: &mut UploadSession,
    ) -> Result<()> {
        let (mut reader, _) = ChunkReader::open(src, self.part_size).await?;

        while let Some(chunk) = reader.next_chunk().await? {
            let part_number = session.next_part_number();
            let len = chunk.len() as u64;
            let etag = client.upload_part(key, upload_id, part_number, chunk).await?;
            session.record_chunk(len, Some(etag));
            debug!(key, part_number, sent = session.bytes_sent, total = session.total_size, "Part uploaded");
        }

        session.verify_complete()?;
        client.complete_multipart(key, upload_id, &session.parts).await
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn identifier(&self) -> ProviderId {
        ProviderId::S3
    }

    fn display_name(&self) -> &str {
        "Amazon S3"
    }

    fn config_schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn is_configured(&self) -> bool {
        self.client.is_some()
    }

    fn validate_config(&self, raw: &Value) -> Result<ProviderConfig> {
        let raw = RawConfig::new(raw, SCHEMA)?;

        let region = raw.required("region")?;
        if !region
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Validation(format!(
                "Field 'region' is not a valid region name: {}",
                region
            )));
        }

        let bucket = raw.required("bucket")?;
        if !valid_bucket_name(&bucket) {
            return Err(Error::Validation(format!(
                "Field 'bucket' is not a valid bucket name: {}",
                bucket
            )));
        }

        let endpoint = match raw.text("endpoint") {
            Some(endpoint) => {
                let url = Url::parse(&endpoint).map_err(|e| {
                    Error::Validation(format!("Field 'endpoint' is not a valid URL: {}", e))
                })?;
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(Error::Validation(
                        "Field 'endpoint' must be an http(s) URL with a host".to_string(),
                    ));
                }
                Some(endpoint.trim_end_matches('/').to_string())
            }
            None => None,
        };

        Ok(ProviderConfig::S3(S3Config {
            access_key_id: raw.required("access_key_id")?,
            secret_access_key: raw.required("secret_access_key")?,
            region,
            bucket,
            endpoint,
            prefix: raw.text("prefix").and_then(|p| normalize_prefix(&p)),
            storage_class: raw.text("storage_class"),
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
        let key = self.object_key(dest_key);
        let size = source_size(src).await?;
        let meta = object_metadata(metadata);

        if size > self.multipart_threshold {
            self.upload_multipart(src, &key, size, &meta).await?;
        } else {
            let body = tokio::fs::read(src).await?;
            if body.len() as u64 != size {
                return Err(Error::Integrity(format!(
                    "read {} bytes from {}, expected {}",
                    body.len(),
                    src.display(),
                    size
                )));
            }
            client.put_object(&key, Bytes::from(body), &meta).await?;
        }

        info!(key = %key, size, "S3 upload complete");
        Ok(UploadResult {
            provider: ProviderId::S3,
            key: dest_key.to_string(),
            size,
            remote_id: None,
        })
    }

    async fn download(&self, src_key: &str, dest: &Path) -> Result<()> {
        let key = self.object_key(src_key);
        let response = self.client()?.get_object(&key).await?;
        let size = download_to_file(response, dest).await?;
        info!(key = %key, size, "S3 download complete");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        let client = self.client()?;
        let base = self.key_prefix();
        let objects = client.list_objects(&self.object_key(prefix)).await?;

        let mut files = Vec::new();
        for object in objects {
            let key = object.key.strip_prefix(base).unwrap_or(&object.key);
            let name = key_basename(key);
            if !is_backup_filename(name) {
                debug!(key = %object.key, "Skipping non-backup object");
                continue;
            }
            files.push(FileInfo {
                name: name.to_string(),
                key: key.to_string(),
                size: object.size,
                modified: object.last_modified.unwrap_or_else(chrono::Utc::now),
                remote_id: None,
            });
        }
        files.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(files)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.object_key(key);
        if !self.client()?.delete_object(&key).await? {
            debug!(key = %key, "Object already absent");
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.client()?.head_object(&self.object_key(key)).await
    }

    async fn test_connection(&self) -> Result<()> {
        self.client()?
            .list_page(self.key_prefix(), None, Some(1))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw() -> Value {
        json!({
            "access_key_id": "AKIAEXAMPLE",
            "secret_access_key": "secret",
            "region": "eu-central-1",
            "bucket": "siberian-backups",
        })
    }

    #[test]
    fn test_validate_config_normalizes() {
        let provider = S3Provider::new(None).unwrap();
        let mut input = raw();
        input["prefix"] = json!("/nightly/");
        input["endpoint"] = json!("https://minio.example.com:9000/");
        input["storage_class"] = json!("STANDARD_IA");

        let ProviderConfig::S3(config) = provider.validate_config(&input).unwrap() else {
            panic!("expected S3 config");
        };
        assert_eq!(config.prefix.as_deref(), Some("nightly/"));
        assert_eq!(config.endpoint.as_deref(), Some("https://minio.example.com:9000"));
        assert_eq!(config.storage_class.as_deref(), Some("STANDARD_IA"));
    }

    #[test]
    fn test_validate_config_rejects_bad_fields() {
        let provider = S3Provider::new(None).unwrap();

        let mut bad_bucket = raw();
        bad_bucket["bucket"] = json!("Not_A_Bucket");
        assert!(provider.validate_config(&bad_bucket).is_err());

        let mut bad_class = raw();
        bad_class["storage_class"] = json!("COLD");
        assert!(provider.validate_config(&bad_class).is_err());

        let mut bad_endpoint = raw();
        bad_endpoint["endpoint"] = json!("ftp://host");
        assert!(provider.validate_config(&bad_endpoint).is_err());

        let mut missing = raw();
        missing.as_object_mut().unwrap().remove("secret_access_key");
        let err = provider.validate_config(&missing).unwrap_err();
        assert!(err.to_string().contains("secret_access_key"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let provider = S3Provider::new(None).unwrap();
        let ProviderConfig::S3(config) = provider.validate_config(&raw()).unwrap() else {
            panic!("expected S3 config");
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("\"secret\""));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_object_key_applies_prefix() {
        let config = S3Config {
            access_key_id: "a".into(),
            secret_access_key: "s".into(),
            region: "us-east-1".into(),
            bucket: "bucket".into(),
            endpoint: None,
            prefix: Some("nightly/".into()),
            storage_class: None,
        };
        let provider = S3Provider::new(Some(config)).unwrap();
        assert_eq!(provider.object_key("/a.zip"), "nightly/a.zip");
    }

    #[test]
    fn test_object_metadata() {
        let metadata = UploadMetadata {
            backup_type: Some(siberian_common::BackupKind::Db),
            scheduled: true,
            description: Some("před upgradem".into()),
            ..Default::default()
        };
        let meta = object_metadata(&metadata);
        assert_eq!(
            meta,
            vec![
                ("backup-type".to_string(), "db".to_string()),
                ("scheduled".to_string(), "true".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let provider = S3Provider::new(None).unwrap();
        assert!(!provider.is_configured());
        assert!(matches!(provider.list("").await, Err(Error::NotConfigured(_))));
    }
}
