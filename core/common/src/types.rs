//! Common types used throughout the backup storage engine.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::{Error, Result};

/// Identifier of a storage backend.
///
/// The set is closed: every persisted config key, ledger entry and
/// reconciliation pass refers to one of these four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Local,
    Gdrive,
    Gcs,
    S3,
}

impl ProviderId {
    /// All known providers.
    pub const ALL: [ProviderId; 4] = [
        ProviderId::Local,
        ProviderId::Gdrive,
        ProviderId::Gcs,
        ProviderId::S3,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Local => "local",
            ProviderId::Gdrive => "gdrive",
            ProviderId::Gcs => "gcs",
            ProviderId::S3 => "s3",
        }
    }

    /// Whether the provider stores data off this machine.
    pub fn is_remote(&self) -> bool {
        !matches!(self, ProviderId::Local)
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(ProviderId::Local),
            "gdrive" => Ok(ProviderId::Gdrive),
            "gcs" => Ok(ProviderId::Gcs),
            "s3" => Ok(ProviderId::S3),
            other => Err(Error::ProviderNotFound(other.to_string())),
        }
    }
}

/// Kind of archive encoded in a backup filename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Db,
    File,
    Files,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Db => "db",
            BackupKind::File => "file",
            BackupKind::Files => "files",
        }
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

static BACKUP_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^siberian-backup-(full|db|files|file)-(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2})\.zip$")
        .expect("backup name pattern is valid")
});

/// A filename that follows the backup naming pattern
/// `siberian-backup-<kind>-<YYYY-MM-DD-HH-MM-SS>.zip`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupName {
    pub kind: BackupKind,
    pub created: DateTime<Utc>,
}

impl BackupName {
    /// Parse a bare filename (no directory components).
    ///
    /// Returns `None` for anything that does not match the pattern,
    /// including impossible calendar dates.
    pub fn parse(filename: &str) -> Option<Self> {
        let caps = BACKUP_NAME.captures(filename)?;
        let kind = match &caps[1] {
            "full" => BackupKind::Full,
            "db" => BackupKind::Db,
            "file" => BackupKind::File,
            "files" => BackupKind::Files,
            _ => return None,
        };
        let naive = NaiveDateTime::parse_from_str(&caps[2], TIMESTAMP_FORMAT).ok()?;
        Some(Self {
            kind,
            created: Utc.from_utc_datetime(&naive),
        })
    }

    /// Build the filename for a backup of `kind` taken at `created`.
    pub fn filename(kind: BackupKind, created: DateTime<Utc>) -> String {
        format!(
            "siberian-backup-{}-{}.zip",
            kind,
            created.format(TIMESTAMP_FORMAT)
        )
    }
}

/// Check a bare filename against the backup naming pattern.
pub fn is_backup_filename(filename: &str) -> bool {
    BackupName::parse(filename).is_some()
}

/// Final path component of an object key.
pub fn key_basename(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Format a byte count with binary units (`6.00 MB`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Stable identifier for a backup discovered on a provider, derived from
/// its filename and creation timestamp.
pub fn derive_backup_id(filename: &str, created: i64) -> String {
    let digest = Sha256::digest(format!("{}:{}", filename, created).as_bytes());
    format!("auto-{}", &hex::encode(digest)[..16])
}

/// One object returned by a provider listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Bare filename.
    pub name: String,
    /// Full key on the provider (may carry a prefix).
    pub key: String,
    /// Size in bytes as reported by the provider.
    pub size: u64,
    /// Last modification time reported by the provider.
    pub modified: DateTime<Utc>,
    /// Provider-side object identifier, when the API has one.
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// Caller-supplied description of an upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    #[serde(default)]
    pub backup_type: Option<BackupKind>,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub locked: bool,
    #[serde(default)]
    pub description: Option<String>,
}

impl UploadMetadata {
    /// Flat string properties attached to remote objects.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        if let Some(kind) = self.backup_type {
            props.insert("backup_type".to_string(), kind.to_string());
        }
        if self.scheduled {
            props.insert("scheduled".to_string(), "true".to_string());
        }
        if self.locked {
            props.insert("locked".to_string(), "true".to_string());
        }
        if let Some(description) = &self.description {
            props.insert("description".to_string(), description.clone());
        }
        props
    }
}

/// Outcome of a successful upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    pub provider: ProviderId,
    pub key: String,
    pub size: u64,
    #[serde(default)]
    pub remote_id: Option<String>,
}

/// One backup artifact as seen across every provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub filename: String,
    pub backup_type: BackupKind,
    pub size_bytes: u64,
    pub size_display: String,
    pub created_timestamp: i64,
    pub storages: BTreeSet<ProviderId>,
    pub locked: bool,
    pub scheduled: bool,
}

impl BackupRecord {
    /// Build a record for a listed file, or `None` if the name does not
    /// follow the backup pattern.
    pub fn discovered(info: &FileInfo, provider: ProviderId) -> Option<Self> {
        let name = BackupName::parse(&info.name)?;
        let created = name.created.timestamp();
        Some(Self {
            id: derive_backup_id(&info.name, created),
            filename: info.name.clone(),
            backup_type: name.kind,
            size_bytes: info.size,
            size_display: format_size(info.size),
            created_timestamp: created,
            storages: BTreeSet::from([provider]),
            locked: false,
            scheduled: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use proptest::prelude::*;

    #[test]
    fn test_parse_backup_name() {
        let name = BackupName::parse("siberian-backup-db-2024-01-01-00-00-00.zip").unwrap();
        assert_eq!(name.kind, BackupKind::Db);
        assert_eq!(name.created.year(), 2024);
        assert_eq!(name.created.timestamp(), 1_704_067_200);

        let files = BackupName::parse("siberian-backup-files-2023-12-31-23-59-59.zip").unwrap();
        assert_eq!(files.kind, BackupKind::Files);
    }

    #[test]
    fn test_rejects_foreign_names() {
        for name in [
            "siberian-backup-db-2024-01-01-00-00-00.tar.gz",
            "siberian-backup-logs-2024-01-01-00-00-00.zip",
            "siberian-backup-db-2024-13-01-00-00-00.zip",
            "backup-db-2024-01-01-00-00-00.zip",
            "siberian-backup-db-2024-01-01-00-00-00.zip.meta.json",
            "notes.txt",
        ] {
            assert!(!is_backup_filename(name), "{} should not match", name);
        }
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(6 * 1024 * 1024), "6.00 MB");
    }

    #[test]
    fn test_provider_id_roundtrip() {
        for id in ProviderId::ALL {
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), id);
        }
        assert!("dropbox".parse::<ProviderId>().is_err());
        assert_eq!(serde_json::to_string(&ProviderId::Gdrive).unwrap(), "\"gdrive\"");
    }

    #[test]
    fn test_discovered_record_id_is_stable() {
        let info = FileInfo {
            name: "siberian-backup-full-2024-03-05-10-20-30.zip".into(),
            key: "backups/siberian-backup-full-2024-03-05-10-20-30.zip".into(),
            size: 2048,
            modified: Utc::now(),
            remote_id: None,
        };
        let a = BackupRecord::discovered(&info, ProviderId::S3).unwrap();
        let b = BackupRecord::discovered(&info, ProviderId::Local).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.size_display, "2.00 KB");
        assert!(a.storages.contains(&ProviderId::S3));
    }

    #[test]
    fn test_key_basename() {
        assert_eq!(key_basename("a/b/c.zip"), "c.zip");
        assert_eq!(key_basename("c.zip"), "c.zip");
    }

    #[test]
    fn test_metadata_properties_skip_defaults() {
        assert!(UploadMetadata::default().properties().is_empty());

        let metadata = UploadMetadata {
            backup_type: Some(BackupKind::Full),
            locked: true,
            ..Default::default()
        };
        let props = metadata.properties();
        assert_eq!(props.get("backup_type").map(String::as_str), Some("full"));
        assert_eq!(props.get("locked").map(String::as_str), Some("true"));
        assert!(!props.contains_key("scheduled"));
    }

    proptest! {
        #[test]
        fn generated_names_parse_back(
            kind in prop_oneof![
                Just(BackupKind::Full),
                Just(BackupKind::Db),
                Just(BackupKind::File),
                Just(BackupKind::Files),
            ],
            secs in 0i64..4_102_444_800,
        ) {
            let created = Utc.timestamp_opt(secs, 0).unwrap();
            let filename = BackupName::filename(kind, created);
            let parsed = BackupName::parse(&filename).unwrap();
            prop_assert_eq!(parsed.kind, kind);
            prop_assert_eq!(parsed.created, created);
        }

        #[test]
        fn arbitrary_suffixes_never_match(suffix in "[a-z.]{1,8}") {
            let name = format!("siberian-backup-db-2024-01-01-00-00-00.zip{}", suffix);
            prop_assert!(!is_backup_filename(&name));
        }
    }
}
