//! Storage manager: provider ownership, guarded transfers and inventory
//! reconciliation.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use siberian_common::settings::{provider_key, token_key};
use siberian_common::{
    format_size, key_basename, BackupName, BackupRecord, Error, FileInfo, LogSink,
    ProviderId, Result, SettingsStore, UploadMetadata, UploadResult,
};
use siberian_storage::{
    create_default_registry, FieldSpec, LocalProvider, ProviderConfig, ProviderContext,
    ProviderRegistry, StorageProvider,
};

use crate::ledger::{Ledger, LedgerEntry};
use crate::reconcile::{merge, Listing, PROVIDER_PRIORITY};
use crate::retry::{is_transient, RetryConfig, RetryExecutor};

/// Subsystem name used for every line sent to the log sink.
const LOG_SUBSYSTEM: &str = "backup";

/// Description of one provider for configuration screens.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSchema {
    pub id: ProviderId,
    pub name: String,
    pub configured: bool,
    pub fields: &'static [FieldSpec],
}

/// Owns one provider per identifier and keeps the backup ledger in step
/// with what the providers actually hold.
pub struct StorageManager {
    store: Arc<dyn SettingsStore>,
    log: Arc<dyn LogSink>,
    registry: ProviderRegistry,
    ctx: ProviderContext,
    providers: RwLock<BTreeMap<ProviderId, Arc<dyn StorageProvider>>>,
    retry: RetryConfig,
    backup_dir: Option<PathBuf>,
    /// Serializes read-modify-write passes over the ledger.
    ledger_lock: Mutex<()>,
}

impl StorageManager {
    /// Create a manager, building every registered provider from the
    /// configuration persisted in `ctx.store`.
    ///
    /// A stored configuration that cannot be decoded is logged and the
    /// provider starts unconfigured.
    ///
    /// # Errors
    /// - Settings store read failure
    /// - A factory fails for a provider with no stored configuration
    pub fn new(
        registry: ProviderRegistry,
        ctx: ProviderContext,
        log: Arc<dyn LogSink>,
    ) -> Result<Self> {
        let mut providers = BTreeMap::new();
        for id in registry.providers() {
            let provider = match registry.load(id, &ctx) {
                Ok(provider) => provider,
                Err(Error::Config(message)) => {
                    log.log(LOG_SUBSYSTEM, "warning", &message);
                    registry.resolve(id, None, &ctx)?
                }
                Err(e) => return Err(e),
            };
            providers.insert(id, provider);
        }

        Ok(Self {
            store: ctx.store.clone(),
            log,
            registry,
            ctx,
            providers: RwLock::new(providers),
            retry: RetryConfig::default(),
            backup_dir: None,
            ledger_lock: Mutex::new(()),
        })
    }

    /// Create a manager over the four built-in providers.
    pub fn from_settings(store: Arc<dyn SettingsStore>, log: Arc<dyn LogSink>) -> Result<Self> {
        Self::new(create_default_registry(), ProviderContext::new(store), log)
    }

    /// Create a manager over pre-built providers.
    ///
    /// Nothing is registered, so `configure` persists the configuration
    /// but keeps the existing provider instance.
    pub fn with_providers(
        store: Arc<dyn SettingsStore>,
        log: Arc<dyn LogSink>,
        providers: Vec<Arc<dyn StorageProvider>>,
    ) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.identifier(), p))
            .collect();
        Self {
            ctx: ProviderContext::new(store.clone()),
            store,
            log,
            registry: ProviderRegistry::new(),
            providers: RwLock::new(providers),
            retry: RetryConfig::default(),
            backup_dir: None,
            ledger_lock: Mutex::new(()),
        }
    }

    /// Set the retry policy for reconciliation listings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Directory where the host writes fresh archives. It is scanned as
    /// the local copy during reconciliation instead of the local
    /// provider's root.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }

    fn note(&self, category: &str, message: &str) {
        self.log.log(LOG_SUBSYSTEM, category, message);
    }

    fn lock_error() -> Error {
        Error::Io(std::io::Error::other("provider table lock poisoned"))
    }

    /// Provider instance for `id`.
    ///
    /// # Errors
    /// - `ProviderNotFound` if no provider is held for `id`
    pub fn provider(&self, id: ProviderId) -> Result<Arc<dyn StorageProvider>> {
        self.providers
            .read()
            .map_err(|_| Self::lock_error())?
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::ProviderNotFound(id.to_string()))
    }

    /// Identifiers of every held provider.
    pub fn providers(&self) -> Result<Vec<ProviderId>> {
        Ok(self
            .providers
            .read()
            .map_err(|_| Self::lock_error())?
            .keys()
            .copied()
            .collect())
    }

    /// Configuration fields of every held provider.
    pub fn provider_schemas(&self) -> Result<Vec<ProviderSchema>> {
        Ok(self
            .providers
            .read()
            .map_err(|_| Self::lock_error())?
            .values()
            .map(|p| ProviderSchema {
                id: p.identifier(),
                name: p.display_name().to_string(),
                configured: p.is_configured(),
                fields: p.config_schema(),
            })
            .collect())
    }

    /// Check raw input against the schema of `id`.
    pub fn validate_config(&self, id: ProviderId, raw: &Value) -> Result<ProviderConfig> {
        self.provider(id)?.validate_config(raw)
    }

    /// Validate, persist and apply a configuration.
    ///
    /// # Postconditions
    /// - The normalized configuration is stored under `provider.<id>`
    /// - Any token cached under `token.<id>` for the previous configuration
    ///   is discarded
    /// - Later calls for `id` use a provider built from it
    ///
    /// # Errors
    /// - `ProviderNotFound`, `Validation`
    /// - Settings store write failure
    pub fn configure(&self, id: ProviderId, raw: &Value) -> Result<ProviderConfig> {
        let config = self.validate_config(id, raw)?;
        if config.provider() != id {
            return Err(Error::Validation(format!(
                "Configuration for '{}' was supplied to '{}'",
                config.provider(),
                id
            )));
        }
        let value = config.to_value()?;
        self.store.set(&provider_key(id.as_str()), value.clone())?;
        // The cached token may belong to another account.
        self.store.remove(&token_key(id.as_str()))?;

        if self.registry.has_provider(id) {
            let provider = self.registry.resolve(id, Some(value), &self.ctx)?;
            self.providers
                .write()
                .map_err(|_| Self::lock_error())?
                .insert(id, provider);
        }
        info!(provider = %id, "Provider configured");
        self.note("info", &format!("Saved configuration for {}", id));
        Ok(config)
    }

    /// Run the provider's connection check.
    pub async fn test_connection(&self, id: ProviderId) -> Result<()> {
        let provider = self.provider(id)?;
        if !provider.is_configured() {
            return Err(Error::NotConfigured(id.to_string()));
        }
        provider.test_connection().await
    }

    /// Provider for `id`, configured and initialized.
    async fn ready(&self, id: ProviderId) -> Result<Arc<dyn StorageProvider>> {
        let provider = self.provider(id)?;
        if !provider.is_configured() {
            return Err(Error::NotConfigured(id.to_string()));
        }
        provider.initialize().await?;
        Ok(provider)
    }

    /// Upload `src` to `id` and record the copy in the ledger.
    ///
    /// # Errors
    /// - `ProviderNotFound`, `NotConfigured`
    /// - Any transfer error of the provider
    pub async fn upload_file(
        &self,
        id: ProviderId,
        src: &Path,
        dest_key: &str,
        metadata: &UploadMetadata,
    ) -> Result<UploadResult> {
        let provider = self.ready(id).await?;
        let result = provider.upload(src, dest_key, metadata).await?;
        self.note(
            "info",
            &format!(
                "Uploaded {} to {} ({})",
                dest_key,
                id,
                format_size(result.size)
            ),
        );
        self.record_upload(&result, metadata).await?;
        Ok(result)
    }

    pub async fn download_file(&self, id: ProviderId, src_key: &str, dest: &Path) -> Result<()> {
        let provider = self.ready(id).await?;
        provider.download(src_key, dest).await?;
        debug!(provider = %id, key = %src_key, dest = %dest.display(), "Download complete");
        Ok(())
    }

    pub async fn list_files(&self, id: ProviderId, prefix: &str) -> Result<Vec<FileInfo>> {
        self.ready(id).await?.list(prefix).await
    }

    /// Delete `key` from `id` and drop that location from the ledger.
    pub async fn delete_file(&self, id: ProviderId, key: &str) -> Result<()> {
        let provider = self.ready(id).await?;
        provider.delete(key).await?;
        self.note("info", &format!("Deleted {} from {}", key, id));
        self.forget_storage(id, key_basename(key)).await
    }

    /// Record a successful upload in the ledger.
    ///
    /// A filename already in the ledger gains the provider as a location;
    /// an unknown one gets a fresh entry. Names outside the backup pattern
    /// are not recorded.
    ///
    /// # Returns
    /// The ledger id, or `None` if nothing was recorded.
    pub async fn record_upload(
        &self,
        result: &UploadResult,
        metadata: &UploadMetadata,
    ) -> Result<Option<String>> {
        let filename = key_basename(&result.key);
        let Some(name) = BackupName::parse(filename) else {
            self.note(
                "warning",
                &format!("{} does not follow the backup naming pattern", filename),
            );
            return Ok(None);
        };

        let _guard = self.ledger_lock.lock().await;
        let mut ledger = Ledger::load(self.store.as_ref())?;
        let id = match ledger.find_by_file(filename).map(|(id, _)| id.clone()) {
            Some(id) => {
                ledger.add_storage(&id, result.provider)?;
                id
            }
            None => {
                let id = format!("backup-{}", Uuid::new_v4().simple());
                ledger.insert(
                    id.clone(),
                    LedgerEntry {
                        file: filename.to_string(),
                        backup_type: metadata.backup_type.unwrap_or(name.kind),
                        size: format_size(result.size),
                        bytes: result.size,
                        storage: result.provider,
                        created: name.created.timestamp(),
                        locked: metadata.locked,
                        uploaded_to: vec![result.provider],
                        scheduled: metadata.scheduled,
                    },
                );
                id
            }
        };
        ledger.save(self.store.as_ref())?;
        Ok(Some(id))
    }

    /// Remove `provider` from the locations of `filename`.
    ///
    /// The entry is dropped once no location is left, unless the backup
    /// directory still holds a copy.
    pub async fn forget_storage(&self, provider: ProviderId, filename: &str) -> Result<()> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = Ledger::load(self.store.as_ref())?;
        let Some(id) = ledger.find_by_file(filename).map(|(id, _)| id.clone()) else {
            return Ok(());
        };

        if provider != ProviderId::Local && self.local_copy_exists(filename) {
            ledger.add_storage(&id, ProviderId::Local)?;
        }
        if ledger.remove_storage(&id, provider)?.is_none() {
            self.note("info", &format!("{} has no copies left, removed from ledger", filename));
        }
        ledger.save(self.store.as_ref())
    }

    fn local_copy_exists(&self, filename: &str) -> bool {
        self.backup_dir
            .as_ref()
            .is_some_and(|dir| dir.join(filename).is_file())
    }

    /// Mark a ledger entry as protected from deletion, or release it.
    pub async fn set_locked(&self, record_id: &str, locked: bool) -> Result<()> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = Ledger::load(self.store.as_ref())?;
        ledger.set_locked(record_id, locked)?;
        ledger.save(self.store.as_ref())
    }

    /// Every known backup across all providers, newest first.
    ///
    /// Merges the ledger, the local scan and a listing of every configured
    /// remote provider. Failing listings are retried with a credential
    /// refresh in between; a provider that keeps failing is logged and
    /// skipped. Newly discovered files and newly observed locations are
    /// written back to the ledger, so a repeated call with unchanged
    /// remotes changes nothing.
    ///
    /// # Errors
    /// - Ledger read or write failure
    pub async fn get_all_backups(&self) -> Result<Vec<BackupRecord>> {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = Ledger::load(self.store.as_ref())?;

        let mut listings = Vec::new();
        if let Some(listing) = self.scan_local().await {
            listings.push(listing);
        }
        for id in PROVIDER_PRIORITY.iter().filter(|id| id.is_remote()) {
            let Ok(provider) = self.provider(*id) else {
                continue;
            };
            if !provider.is_configured() {
                continue;
            }
            match self.list_with_retry(provider.as_ref()).await {
                Ok(files) => listings.push(Listing::new(*id, files)),
                Err(e) => {
                    warn!(provider = %id, error = %e, "Skipping provider during reconciliation");
                    self.note("warning", &format!("Could not list {}: {}", id, e));
                }
            }
        }

        let outcome = merge(&ledger, &listings);
        for discrepancy in &outcome.discrepancies {
            self.note("warning", &discrepancy.to_string());
        }
        for filename in &outcome.discovered {
            self.note("info", &format!("Discovered {}", filename));
        }

        let changed = ledger.absorb(outcome.records.values())?;
        if changed > 0 {
            ledger.save(self.store.as_ref())?;
            debug!(changed, "Ledger updated");
        }
        Ok(outcome.newest_first())
    }

    /// Listing of the local copy: the backup directory when set, the local
    /// provider's root otherwise.
    async fn scan_local(&self) -> Option<Listing> {
        let files = match &self.backup_dir {
            Some(dir) => LocalProvider::with_root(dir).list("").await,
            None => {
                let provider = self.provider(ProviderId::Local).ok()?;
                if !provider.is_configured() {
                    return None;
                }
                provider.list("").await
            }
        };
        match files {
            Ok(files) => Some(Listing::new(ProviderId::Local, files)),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                self.note("warning", &format!("Could not scan local backups: {}", e));
                None
            }
        }
    }

    async fn list_with_retry(&self, provider: &dyn StorageProvider) -> Result<Vec<FileInfo>> {
        let log: &dyn LogSink = self.log.as_ref();
        RetryExecutor::new(self.retry.clone())
            .execute_with_recovery(
                move || provider.list(""),
                is_transient,
                move |attempt| async move {
                    match provider.refresh_credentials().await {
                        Ok(true) => debug!(
                            provider = %provider.identifier(),
                            attempt,
                            "Credentials refreshed before retry"
                        ),
                        Ok(false) => {}
                        Err(e) => log.log(
                            LOG_SUBSYSTEM,
                            "warning",
                            &format!(
                                "Credential refresh for {} failed: {}",
                                provider.identifier(),
                                e
                            ),
                        ),
                    }
                },
            )
            .await
    }
}
