//! Inventory reconciliation.
//!
//! A reconciliation pass folds the persisted ledger and the live listings
//! of every reachable provider into one record per filename. The merge is
//! pure: it never touches the network or the settings store, the manager
//! gathers the listings and persists the outcome.

use std::collections::{BTreeMap, BTreeSet};

use siberian_common::{BackupName, BackupRecord, FileInfo, ProviderId};

use crate::ledger::Ledger;

/// Order in which providers are preferred as the primary location of a
/// record. Remote copies rank before the local one.
pub const PROVIDER_PRIORITY: [ProviderId; 4] = [
    ProviderId::S3,
    ProviderId::Gcs,
    ProviderId::Gdrive,
    ProviderId::Local,
];

/// Highest-priority provider in `storages`.
pub fn primary_storage(storages: &BTreeSet<ProviderId>) -> Option<ProviderId> {
    PROVIDER_PRIORITY
        .iter()
        .copied()
        .find(|id| storages.contains(id))
}

/// Files returned by one provider.
#[derive(Debug, Clone)]
pub struct Listing {
    pub provider: ProviderId,
    pub files: Vec<FileInfo>,
}

impl Listing {
    pub fn new(provider: ProviderId, files: Vec<FileInfo>) -> Self {
        Self { provider, files }
    }
}

/// Metadata disagreement between the ledger and a provider listing.
///
/// Matching is by filename only; disagreements are reported, never
/// corrected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discrepancy {
    /// The listed size differs from the recorded byte count.
    Size {
        filename: String,
        provider: ProviderId,
        recorded: u64,
        listed: u64,
    },
    /// The recorded creation time differs from the timestamp encoded in the
    /// filename.
    Timestamp {
        filename: String,
        recorded: i64,
        named: i64,
    },
}

impl std::fmt::Display for Discrepancy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Discrepancy::Size {
                filename,
                provider,
                recorded,
                listed,
            } => write!(
                f,
                "{} on {} is {} bytes, ledger records {} bytes",
                filename, provider, listed, recorded
            ),
            Discrepancy::Timestamp {
                filename,
                recorded,
                named,
            } => write!(
                f,
                "{} was recorded at {}, its name says {}",
                filename, recorded, named
            ),
        }
    }
}

/// Outcome of a merge.
#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    /// One record per filename.
    pub records: BTreeMap<String, BackupRecord>,
    /// Filenames first seen in a listing, absent from the ledger.
    pub discovered: BTreeSet<String>,
    pub discrepancies: Vec<Discrepancy>,
}

impl Reconciliation {
    /// Records sorted newest-first.
    pub fn newest_first(&self) -> Vec<BackupRecord> {
        newest_first(self.records.values().cloned())
    }
}

/// Merge the ledger with provider listings.
///
/// Ledger entries seed the map (the first id in id order wins for a
/// filename recorded twice). Every listed file adds its provider to the
/// record of the same filename, creating one with a derived id when the
/// ledger does not know it. Names outside the backup pattern are ignored.
pub fn merge(ledger: &Ledger, listings: &[Listing]) -> Reconciliation {
    let mut outcome = Reconciliation::default();

    for (id, entry) in ledger.entries() {
        if outcome.records.contains_key(&entry.file) {
            continue;
        }
        if let Some(named) = BackupName::parse(&entry.file) {
            let named = named.created.timestamp();
            if named != entry.created {
                outcome.discrepancies.push(Discrepancy::Timestamp {
                    filename: entry.file.clone(),
                    recorded: entry.created,
                    named,
                });
            }
        }
        outcome.records.insert(entry.file.clone(), entry.to_record(id));
    }

    for listing in listings {
        for info in &listing.files {
            match outcome.records.get_mut(&info.name) {
                Some(record) => {
                    if ledger.find_by_file(&info.name).is_some()
                        && record.size_bytes != info.size
                    {
                        outcome.discrepancies.push(Discrepancy::Size {
                            filename: info.name.clone(),
                            provider: listing.provider,
                            recorded: record.size_bytes,
                            listed: info.size,
                        });
                    }
                    record.storages.insert(listing.provider);
                }
                None => {
                    if let Some(record) = BackupRecord::discovered(info, listing.provider) {
                        outcome.discovered.insert(info.name.clone());
                        outcome.records.insert(info.name.clone(), record);
                    }
                }
            }
        }
    }

    outcome
}

/// Sort records by creation time, newest first. Ties break on filename.
pub fn newest_first(records: impl IntoIterator<Item = BackupRecord>) -> Vec<BackupRecord> {
    let mut records: Vec<BackupRecord> = records.into_iter().collect();
    records.sort_by(|a, b| {
        b.created_timestamp
            .cmp(&a.created_timestamp)
            .then_with(|| a.filename.cmp(&b.filename))
    });
    records
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerEntry;
    use chrono::{TimeZone, Utc};
    use siberian_common::{derive_backup_id, BackupKind};

    const DB: &str = "siberian-backup-db-2024-01-01-00-00-00.zip";
    const FULL: &str = "siberian-backup-full-2024-02-01-00-00-00.zip";

    fn file(name: &str, size: u64) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            key: format!("backups/{}", name),
            size,
            modified: Utc.timestamp_opt(1_706_745_600, 0).unwrap(),
            remote_id: None,
        }
    }

    fn db_entry(storage: ProviderId) -> LedgerEntry {
        LedgerEntry {
            file: DB.to_string(),
            backup_type: BackupKind::Db,
            size: "100 B".to_string(),
            bytes: 100,
            storage,
            created: 1_704_067_200,
            locked: true,
            uploaded_to: vec![storage],
            scheduled: false,
        }
    }

    #[test]
    fn test_priority_prefers_remote() {
        let storages = BTreeSet::from([ProviderId::Local, ProviderId::Gdrive]);
        assert_eq!(primary_storage(&storages), Some(ProviderId::Gdrive));
        assert_eq!(primary_storage(&BTreeSet::new()), None);
    }

    #[test]
    fn test_local_and_external_copies_merge() {
        let listings = [
            Listing::new(ProviderId::Local, vec![file(FULL, 10)]),
            Listing::new(ProviderId::S3, vec![file(FULL, 10)]),
        ];
        let outcome = merge(&Ledger::new(), &listings);

        assert_eq!(outcome.records.len(), 1);
        let record = &outcome.records[FULL];
        assert_eq!(
            record.storages,
            BTreeSet::from([ProviderId::Local, ProviderId::S3])
        );
        assert_eq!(record.id, derive_backup_id(FULL, record.created_timestamp));
        assert!(outcome.discovered.contains(FULL));
    }

    #[test]
    fn test_ledger_entry_keeps_its_id_and_flags() {
        let mut ledger = Ledger::new();
        ledger.insert("backup-1", db_entry(ProviderId::Local));
        let outcome = merge(
            &ledger,
            &[Listing::new(ProviderId::Gcs, vec![file(DB, 100)])],
        );

        let record = &outcome.records[DB];
        assert_eq!(record.id, "backup-1");
        assert!(record.locked);
        assert_eq!(
            record.storages,
            BTreeSet::from([ProviderId::Local, ProviderId::Gcs])
        );
        assert!(outcome.discovered.is_empty());
        assert!(outcome.discrepancies.is_empty());
    }

    #[test]
    fn test_foreign_names_are_ignored() {
        let outcome = merge(
            &Ledger::new(),
            &[Listing::new(
                ProviderId::S3,
                vec![file("notes.txt", 3), file("siberian-backup-db-latest.zip", 3)],
            )],
        );
        assert!(outcome.records.is_empty());
    }

    #[test]
    fn test_metadata_disagreement_is_reported() {
        let mut entry = db_entry(ProviderId::S3);
        entry.created += 60;
        let mut ledger = Ledger::new();
        ledger.insert("backup-1", entry);

        let outcome = merge(&ledger, &[Listing::new(ProviderId::S3, vec![file(DB, 250)])]);

        assert_eq!(outcome.discrepancies.len(), 2);
        assert!(outcome.discrepancies.contains(&Discrepancy::Size {
            filename: DB.to_string(),
            provider: ProviderId::S3,
            recorded: 100,
            listed: 250,
        }));
        // Reported only; the ledger values stand.
        assert_eq!(outcome.records[DB].size_bytes, 100);
    }

    #[test]
    fn test_newest_first() {
        let outcome = merge(
            &Ledger::new(),
            &[Listing::new(ProviderId::Local, vec![file(DB, 1), file(FULL, 1)])],
        );
        let sorted = outcome.newest_first();
        assert_eq!(sorted[0].filename, FULL);
        assert_eq!(sorted[1].filename, DB);
    }
}
