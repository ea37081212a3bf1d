//! Persisted ledger of known backups.
//!
//! The ledger maps a record id to what is known about one artifact and
//! where copies were placed. It is stored as a single JSON object under
//! [`LEDGER_KEY`] in the settings store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use siberian_common::settings::LEDGER_KEY;
use siberian_common::{
    format_size, BackupKind, BackupRecord, Error, ProviderId, Result, SettingsStore,
};

use crate::reconcile::primary_storage;

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub file: String,
    pub backup_type: BackupKind,
    /// Human readable size.
    #[serde(default)]
    pub size: String,
    pub bytes: u64,
    /// Primary storage location.
    pub storage: ProviderId,
    /// Unix seconds.
    pub created: i64,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub uploaded_to: Vec<ProviderId>,
    #[serde(default)]
    pub scheduled: bool,
}

impl LedgerEntry {
    /// Build a row from a reconciled record.
    pub fn from_record(record: &BackupRecord) -> Result<Self> {
        let storage = primary_storage(&record.storages).ok_or_else(|| {
            Error::Validation(format!("{} has no storage location", record.filename))
        })?;
        Ok(Self {
            file: record.filename.clone(),
            backup_type: record.backup_type,
            size: format_size(record.size_bytes),
            bytes: record.size_bytes,
            storage,
            created: record.created_timestamp,
            locked: record.locked,
            uploaded_to: record.storages.iter().copied().collect(),
            scheduled: record.scheduled,
        })
    }

    /// Every provider holding a copy, the primary one included.
    pub fn storages(&self) -> BTreeSet<ProviderId> {
        let mut storages: BTreeSet<ProviderId> = self.uploaded_to.iter().copied().collect();
        storages.insert(self.storage);
        storages
    }

    pub fn to_record(&self, id: &str) -> BackupRecord {
        BackupRecord {
            id: id.to_string(),
            filename: self.file.clone(),
            backup_type: self.backup_type,
            size_bytes: self.bytes,
            size_display: if self.size.is_empty() {
                format_size(self.bytes)
            } else {
                self.size.clone()
            },
            created_timestamp: self.created,
            storages: self.storages(),
            locked: self.locked,
            scheduled: self.scheduled,
        }
    }

    /// Replace the storage set, keeping `storage` on the highest-priority
    /// location. Returns `false` if the set is empty.
    fn set_storages(&mut self, storages: &BTreeSet<ProviderId>) -> bool {
        match primary_storage(storages) {
            Some(primary) => {
                self.storage = primary;
                self.uploaded_to = storages.iter().copied().collect();
                true
            }
            None => false,
        }
    }
}

/// The ledger, ordered by record id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ledger {
    entries: BTreeMap<String, LedgerEntry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the ledger. A missing blob is an empty ledger.
    pub fn load(store: &dyn SettingsStore) -> Result<Self> {
        match store.get(LEDGER_KEY)? {
            None | Some(serde_json::Value::Null) => Ok(Self::new()),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| Error::Config(format!("Backup ledger is unreadable: {}", e))),
        }
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        store.set(LEDGER_KEY, serde_json::to_value(self)?)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&LedgerEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &LedgerEntry)> {
        self.entries.iter()
    }

    /// First entry for `filename`, in id order.
    pub fn find_by_file(&self, filename: &str) -> Option<(&String, &LedgerEntry)> {
        self.entries.iter().find(|(_, e)| e.file == filename)
    }

    pub fn insert(&mut self, id: impl Into<String>, entry: LedgerEntry) {
        self.entries.insert(id.into(), entry);
    }

    pub fn remove(&mut self, id: &str) -> Option<LedgerEntry> {
        self.entries.remove(id)
    }

    /// Add `provider` to the storages of `id`. Returns whether the entry
    /// changed.
    pub fn add_storage(&mut self, id: &str, provider: ProviderId) -> Result<bool> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("No ledger entry {}", id)))?;
        let mut storages = entry.storages();
        if !storages.insert(provider) {
            return Ok(false);
        }
        entry.set_storages(&storages);
        Ok(true)
    }

    /// Remove `provider` from the storages of `id`, dropping the entry when
    /// no location is left. Returns the entry as it now stands, `None` if it
    /// was dropped.
    pub fn remove_storage(&mut self, id: &str, provider: ProviderId) -> Result<Option<&LedgerEntry>> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("No ledger entry {}", id)))?;
        let mut storages = entry.storages();
        storages.remove(&provider);
        if entry.set_storages(&storages) {
            Ok(self.entries.get(id))
        } else {
            self.entries.remove(id);
            Ok(None)
        }
    }

    pub fn set_locked(&mut self, id: &str, locked: bool) -> Result<()> {
        self.entries
            .get_mut(id)
            .map(|entry| entry.locked = locked)
            .ok_or_else(|| Error::NotFound(format!("No ledger entry {}", id)))
    }

    /// Fold reconciled records back into the ledger: unknown ids are
    /// appended, known ids gain any newly observed storages. Returns the
    /// number of entries added or changed.
    pub fn absorb<'a>(&mut self, records: impl IntoIterator<Item = &'a BackupRecord>) -> Result<usize> {
        let mut changed = 0;
        for record in records {
            match self.entries.get_mut(&record.id) {
                Some(entry) => {
                    let known = entry.storages();
                    let merged: BTreeSet<ProviderId> =
                        known.union(&record.storages).copied().collect();
                    if merged != known {
                        entry.set_storages(&merged);
                        changed += 1;
                    }
                }
                None => {
                    self.entries
                        .insert(record.id.clone(), LedgerEntry::from_record(record)?);
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }
}
