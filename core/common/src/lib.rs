//! Common utilities and types shared across the Siberian backup crates.
//!
//! This crate provides the error type, the backup naming rules, the record
//! types exchanged between providers and the manager, and the two
//! collaborator seams owned by the host application: the settings store and
//! the log sink.

pub mod error;
pub mod log;
pub mod settings;
pub mod types;

pub use error::{Error, Result};
pub use log::{LogLine, LogSink, MemorySink, TracingSink};
pub use settings::{JsonFileStore, MemoryStore, SettingsStore};
pub use types::{
    derive_backup_id, format_size, is_backup_filename, key_basename, BackupKind, BackupName,
    BackupRecord, FileInfo, ProviderId, UploadMetadata, UploadResult,
};
