//! In-memory storage provider for testing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use siberian_common::{
    is_backup_filename, key_basename, Error, FileInfo, ProviderId, Result, UploadMetadata,
    UploadResult,
};

use crate::config::{FieldSpec, ProviderConfig};
use crate::provider::StorageProvider;

/// Stored object.
#[derive(Debug, Clone)]
struct Object {
    id: String,
    data: Vec<u8>,
    modified: DateTime<Utc>,
    metadata: UploadMetadata,
}

/// In-memory storage provider.
///
/// Stands in for any backend identifier. Listing failures can be injected
/// and refresh attempts are counted, so retry paths can be exercised
/// without a network.
pub struct MemoryProvider {
    id: ProviderId,
    configured: bool,
    objects: RwLock<BTreeMap<String, Object>>,
    list_failures: AtomicUsize,
    list_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
}

impl MemoryProvider {
    /// Create an empty, configured provider posing as `id`.
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            configured: true,
            objects: RwLock::new(BTreeMap::new()),
            list_failures: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
        }
    }

    /// Create a provider that reports itself as unconfigured.
    pub fn unconfigured(id: ProviderId) -> Self {
        Self {
            configured: false,
            ..Self::new(id)
        }
    }

    /// Make the next `count` listings fail with a transport error.
    pub fn fail_next_lists(&self, count: usize) {
        self.list_failures.store(count, Ordering::SeqCst);
    }

    /// Seed an object without going through `upload`.
    pub fn insert(&self, key: &str, data: Vec<u8>, modified: DateTime<Utc>) -> Result<()> {
        self.write()?.insert(
            key.to_string(),
            Object {
                id: Uuid::new_v4().to_string(),
                data,
                modified,
                metadata: UploadMetadata::default(),
            },
        );
        Ok(())
    }

    /// Stored bytes of `key`.
    pub fn contents(&self, key: &str) -> Option<Vec<u8>> {
        self.read().ok()?.get(key).map(|o| o.data.clone())
    }

    /// Metadata supplied when `key` was uploaded.
    pub fn metadata_of(&self, key: &str) -> Option<UploadMetadata> {
        self.read().ok()?.get(key).map(|o| o.metadata.clone())
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, BTreeMap<String, Object>>> {
        self.objects
            .read()
            .map_err(|_| Error::Io(std::io::Error::other("memory provider lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, BTreeMap<String, Object>>> {
        self.objects
            .write()
            .map_err(|_| Error::Io(std::io::Error::other("memory provider lock poisoned")))
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(Error::NotConfigured(self.id.to_string()))
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn identifier(&self) -> ProviderId {
        self.id
    }

    fn display_name(&self) -> &str {
        "In-memory storage"
    }

    fn config_schema(&self) -> &'static [FieldSpec] {
        &[]
    }

    fn is_configured(&self) -> bool {
        self.configured
    }

    fn validate_config(&self, _raw: &Value) -> Result<ProviderConfig> {
        Err(Error::Validation(
            "The in-memory provider takes no configuration".to_string(),
        ))
    }

    async fn initialize(&self) -> Result<()> {
        self.ensure_configured()
    }

    async fn upload(
        &self,
        src: &Path,
        dest_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        self.ensure_configured()?;
        let data = tokio::fs::read(src).await?;
        let size = data.len() as u64;
        let id = Uuid::new_v4().to_string();
        self.write()?.insert(
            dest_key.to_string(),
            Object {
                id: id.clone(),
                data,
                modified: Utc::now(),
                metadata: metadata.clone(),
            },
        );
        Ok(UploadResult {
            provider: self.id,
            key: dest_key.to_string(),
            size,
            remote_id: Some(id),
        })
    }

    async fn download(&self, src_key: &str, dest: &Path) -> Result<()> {
        self.ensure_configured()?;
        let data = self
            .read()?
            .get(src_key)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", src_key)))?;
        tokio::fs::write(dest, data).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>> {
        self.ensure_configured()?;
        self.list_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Transport(format!("{}: injected listing failure", self.id)));
        }

        Ok(self
            .read()?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix) && is_backup_filename(key_basename(key)))
            .map(|(key, object)| FileInfo {
                name: key_basename(key).to_string(),
                key: key.clone(),
                size: object.data.len() as u64,
                modified: object.modified,
                remote_id: Some(object.id.clone()),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_configured()?;
        self.write()?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("File not found: {}", key)))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.ensure_configured()?;
        Ok(self.read()?.contains_key(key))
    }

    async fn test_connection(&self) -> Result<()> {
        self.ensure_configured()
    }

    async fn refresh_credentials(&self) -> Result<bool> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}
