//! Local filesystem storage provider.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use walkdir::WalkDir;

use siberian_common::{
    is_backup_filename, key_basename, Error, FileInfo, ProviderId, Result, UploadMetadata,
    UploadResult,
};

use crate::config::{FieldKind, FieldSpec, ProviderConfig, RawConfig};
use crate::provider::StorageProvider;
use crate::transfer::{source_size, MULTIPART_THRESHOLD};

/// Buffer used by the chunked copy loop.
const COPY_BUFFER_SIZE: usize = 8 * 1024 * 1024;

/// Suffix of the metadata sidecar written next to each artifact.
const SIDECAR_SUFFIX: &str = ".meta.json";

/// Name of the probe file written by `test_connection`.
const PROBE_FILE: &str = ".siberian-write-test";

static SCHEMA: &[FieldSpec] = &[FieldSpec::required(
    "path",
    "Storage directory",
    FieldKind::Text,
)];

/// Local provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Directory holding the backup tree.
    pub path: PathBuf,
}

/// Local filesystem storage provider.
///
/// Stores backups in a managed directory tree. Files larger than the
/// chunk threshold are copied through a bounded buffer instead of a single
/// whole-file copy.
pub struct LocalProvider {
    config: Option<LocalConfig>,
    chunk_threshold: u64,
}

impl LocalProvider {
    /// Create a provider. `None` yields an unconfigured provider.
    pub fn new(config: Option<LocalConfig>) -> Self {
        Self {
            config,
            chunk_threshold: MULTIPART_THRESHOLD,
        }
    }

    /// Convenience constructor for a configured provider.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        Self::new(Some(LocalConfig {
            path: root.as_ref().to_path_buf(),
        }))
    }

    /// Override the size above which the chunked copy loop is used.
    pub fn with_chunk_threshold(mut self, threshold: u64) -> Self {
        self.chunk_threshold = threshold;
        self
    }

    fn root(&self) -> Result<&Path> {
        self.config
            .as_ref()
            .map(|c| c.path.as_path())
            .ok_or_else(|| Error::NotConfigured("local".to_string()))
    }

    /// Convert an object key to a filesystem path under the root.
    ///
    /// # Errors
    /// - Key is empty, absolute or escapes the root
    fn to_fs_path(&self, key: &str) -> Result<PathBuf> {
        let root = self.root()?;
        let relative = Path::new(key.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::Validation(format!("Invalid object key: {}", key)));
        }
        Ok(root.join(relative))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    async fn write_sidecar(&self, dest: &Path, metadata: &UploadMetadata) -> Result<()> {
        let body = serde_json::json!({
            "metadata": metadata,
            "uploaded_at": Utc::now(),
        });
        fs::write(Self::sidecar_path(dest), serde_json::to_vec_pretty(&body)?).await?;
        Ok(())
    }

    /// Copy `src` to `dst`, then check the destination length.
    async fn copy_file(&self, src: &Path, dst: &Path, expected: u64) -> Result<()> {
        let result = if expected > self.chunk_threshold {
            debug!(src = %src.display(), size = expected, "Using chunked copy");
            copy_in_chunks(src, dst, expected).await
        } else {
            fs::copy(src, dst).await.map(|_| ()).map_err(Error::from)
        };

        let result = match result {
            Ok(()) => verify_length(dst, expected).await,
            Err(e) => Err(e),
        };

        if result.is_err() {
            let _ = fs::remove_file(dst).await;
        }
        result
    }
}

/// Copy through a bounded buffer, failing if the byte count read does not
/// match `expected`.
pub(crate) async fn copy_in_chunks(src: &Path, dst: &Path, expected: u64) -> Result<()> {
    let mut reader = fs::File::open(src).await?;
    let mut writer = fs::File::create(dst).await?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;

    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buffer[..n]).await?;
        copied += n as u64;
    }
    writer.flush().await?;

    if copied != expected {
        return Err(Error::Integrity(format!(
            "copied {} bytes, expected {}",
            copied, expected
        )));
    }
    Ok(())
}

async fn verify_length(path: &Path, expected: u64) -> Result<()> {
    let actual = fs::metadata(path).await?.len();
    if actual != expected {
        return Err(Error::Integrity(format!(
            "{} holds {} bytes, expected {}",
            path.display(),
            actual,
            expected
        )));
    }
    Ok(())
}

fn scan_tree(root: &Path, prefix: &str) -> Result<Vec<FileInfo>> {
    let mut results = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let key = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let name = key_basename(&key);
        if !key.starts_with(prefix) || !is_backup_filename(name) {
            continue;
        }
        let meta = entry
            .metadata()
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        let modified: DateTime<Utc> = meta
            .modified()
            .map(|t| t.into())
            .unwrap_or_else(|_| Utc::now());
        results.push(FileInfo {
            name: name.to_string(),
            key: key.clone(),
            size: meta.len(),
            modified,
            remote_id: None,
        });
    }
    results.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(results)
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn identifier(&self) -> ProviderId {
        ProviderId::Local
    }

    fn display_name(&self) -> &str {
        "Local storage"
    }

    fn config_schema(&self) -> &'static [FieldSpec] {
        SCHEMA
    }

    fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn validate_config(&self, raw: &Value) -> Result<ProviderConfig> {
        let raw = RawConfig::new(raw, SCHEMA)?;
        let path = PathBuf::from(raw.required("path")?);
        if path.is_relative() {
            return Err(Error::Validation(
                "Field 'path' must be an absolute directory".to_string(),
            ));
        }
        if path.exists() && !path.is_dir() {
            return Err(Error::Validation(format!(
                "Field 'path' points to a file: {}",
                path.display()
            )));
        }
        Ok(ProviderConfig::Local(LocalConfig { path }))
    }

    async fn initialize(&self) -> Result<()> {
        let root = self.root()?;
        if !root.exists() {
            fs::create_dir_all(root).await?;
        }
        Ok(())
    }

    async fn upload(
        &self,
        src: &Path,
        dest_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let dest = self.to_fs_path(dest_key)?;
        let size = source_size(src).await?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        self.copy_file(src, &dest, size).await?;

        if metadata != &UploadMetadata::default() {
            self.write_sidecar(&dest, metadata).await?;
        }

        info!(key = %dest_key, size, "Local upload complete");
        Ok(UploadResult {
            provider: ProviderId::Local,
            key: dest_key.to_string(),
            size,
            remote_id: None,
        })
    }

    async fn download(&self, src_key: &str, dest: &Path) -> Result<()> {
        let src = self.to_fs_path(src_key)?;
        if !src.is_file() {
            return Err(Error::NotFound(format!("File not found: {}", src_key)));
        }
        if let Some(parent) = dest.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let size = fs::metadata(&src).await?.len();
        self.copy_file(&src, dest, size).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        let root = self.root()?.to_path_buf();
        if !root.exists() {
            return Ok(Vec::new());
        }
        let prefix = prefix.trim_start_matches('/').to_string();
        tokio::task::spawn_blocking(move || scan_tree(&root, &prefix))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.to_fs_path(key)?;

        if !path.exists() {
            return Err(Error::NotFound(format!("File not found: {}", key)));
        }

        if path.is_dir() {
            return Err(Error::Validation(format!("Refusing to delete directory: {}", key)));
        }

        fs::remove_file(&path).await?;

        let sidecar = Self::sidecar_path(&path);
        if sidecar.exists() {
            fs::remove_file(&sidecar).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.to_fs_path(key)?.is_file())
    }

    async fn test_connection(&self) -> Result<()> {
        self.initialize().await?;
        let probe = self.root()?.join(PROBE_FILE);
        fs::write(&probe, b"ok").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const NAME: &str = "siberian-backup-db-2024-01-01-00-00-00.zip";

    fn write_source(dir: &Path, len: usize) -> PathBuf {
        let path = dir.join("source.zip");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_local_upload_download() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_root(temp.path().join("store"));
        provider.initialize().await.unwrap();
        let src = write_source(temp.path(), 4096);

        let result = provider
            .upload(&src, &format!("backups/{}", NAME), &UploadMetadata::default())
            .await
            .unwrap();
        assert_eq!(result.size, 4096);

        let out = temp.path().join("out").join("restored.zip");
        provider
            .download(&format!("backups/{}", NAME), &out)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), std::fs::read(&src).unwrap());
    }

    #[tokio::test]
    async fn test_chunked_copy_above_threshold() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_root(temp.path().join("store")).with_chunk_threshold(1024);
        let src = write_source(temp.path(), COPY_BUFFER_SIZE + 4097);

        provider
            .upload(&src, NAME, &UploadMetadata::default())
            .await
            .unwrap();

        let stored = temp.path().join("store").join(NAME);
        assert_eq!(
            std::fs::metadata(&stored).unwrap().len(),
            (COPY_BUFFER_SIZE + 4097) as u64
        );
        assert_eq!(std::fs::read(&stored).unwrap(), std::fs::read(&src).unwrap());
    }

    #[tokio::test]
    async fn test_chunked_copy_reports_size_mismatch() {
        let temp = TempDir::new().unwrap();
        let src = write_source(temp.path(), 1000);
        let dst = temp.path().join("copy.zip");

        let err = copy_in_chunks(&src, &dst, 1001).await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn test_list_filters_backup_pattern() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        std::fs::create_dir_all(root.join("nested")).unwrap();
        std::fs::write(root.join(NAME), b"a").unwrap();
        std::fs::write(
            root.join("nested").join("siberian-backup-full-2024-02-02-10-00-00.zip"),
            b"bb",
        )
        .unwrap();
        std::fs::write(root.join("random.zip"), b"c").unwrap();
        std::fs::write(root.join("notes.txt"), b"d").unwrap();

        let provider = LocalProvider::with_root(&root);
        let files = provider.list("").await.unwrap();
        let keys: Vec<_> = files.iter().map(|f| f.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "nested/siberian-backup-full-2024-02-02-10-00-00.zip",
                NAME
            ]
        );
        assert_eq!(files[0].name, "siberian-backup-full-2024-02-02-10-00-00.zip");

        let nested = provider.list("nested/").await.unwrap();
        assert_eq!(nested.len(), 1);
    }

    #[tokio::test]
    async fn test_sidecar_written_and_removed() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_root(temp.path().join("store"));
        let src = write_source(temp.path(), 10);
        let metadata = UploadMetadata {
            scheduled: true,
            ..Default::default()
        };

        provider.upload(&src, NAME, &metadata).await.unwrap();
        let sidecar = temp.path().join("store").join(format!("{}{}", NAME, SIDECAR_SUFFIX));
        assert!(sidecar.exists());

        // Sidecars never show up as backups
        assert_eq!(provider.list("").await.unwrap().len(), 1);

        provider.delete(NAME).await.unwrap();
        assert!(!sidecar.exists());
        assert!(!provider.exists(NAME).await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let temp = TempDir::new().unwrap();
        let provider = LocalProvider::with_root(temp.path());
        assert!(matches!(
            provider.exists("../outside.zip").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_unconfigured() {
        let provider = LocalProvider::new(None);
        assert!(!provider.is_configured());
        assert!(matches!(
            provider.list("").await,
            Err(Error::NotConfigured(_))
        ));
    }

    #[test]
    fn test_validate_config() {
        let provider = LocalProvider::new(None);
        let config = provider
            .validate_config(&serde_json::json!({"path": "/var/backups/siberian"}))
            .unwrap();
        assert_eq!(config.provider(), ProviderId::Local);

        assert!(provider
            .validate_config(&serde_json::json!({"path": "relative/dir"}))
            .is_err());
        assert!(provider.validate_config(&serde_json::json!({})).is_err());
    }
}
