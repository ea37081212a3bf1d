//! Storage provider trait definition.

use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

use siberian_common::{FileInfo, ProviderId, Result, UploadMetadata, UploadResult};

use crate::config::{FieldSpec, ProviderConfig};

/// Storage provider trait for the backup backends.
///
/// Every operation is awaited to completion before the next one starts:
/// chunked transfers are sequential loops of round-trips and no provider
/// spawns background work. Failures are reported as typed errors.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Fixed identifier ("local", "gdrive", "gcs", "s3").
    fn identifier(&self) -> ProviderId;

    /// Human readable backend name.
    fn display_name(&self) -> &str;

    /// Fields the backend needs in its configuration.
    fn config_schema(&self) -> &'static [FieldSpec];

    /// Whether a usable configuration was loaded.
    fn is_configured(&self) -> bool;

    /// Check raw user input against the schema.
    ///
    /// # Returns
    /// The normalized configuration (trimmed strings, defaults applied).
    ///
    /// # Errors
    /// - `Validation` naming the first missing or invalid field
    fn validate_config(&self, raw: &Value) -> Result<ProviderConfig>;

    /// Prepare the backend for use (create directories, resolve folders).
    ///
    /// Safe to call more than once.
    async fn initialize(&self) -> Result<()>;

    /// Upload a local file under `dest_key`.
    ///
    /// # Preconditions
    /// - `src` is a readable regular file
    ///
    /// # Postconditions
    /// - The remote object holds exactly `src`'s bytes
    ///
    /// # Errors
    /// - Not configured
    /// - Transport, authentication or remote errors
    /// - Integrity error if the transferred byte count differs from the source
    async fn upload(
        &self,
        src: &Path,
        dest_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult>;

    /// Download `src_key` into `dest`, replacing any existing file.
    async fn download(&self, src_key: &str, dest: &Path) -> Result<()>;

    /// List backup artifacts under `prefix`.
    ///
    /// Only names following the backup naming pattern are returned.
    async fn list(&self, prefix: &str) -> Result<Vec<FileInfo>>;

    /// Delete an object.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check whether an object exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Perform a cheap authenticated round-trip.
    async fn test_connection(&self) -> Result<()>;

    /// Force a credential refresh.
    ///
    /// Returns `Ok(false)` when the backend has nothing to refresh.
    async fn refresh_credentials(&self) -> Result<bool> {
        Ok(false)
    }
}
