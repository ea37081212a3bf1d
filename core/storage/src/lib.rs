//! Storage provider abstraction for Siberian backups.
//!
//! This module provides a trait-based interface for the backup backends
//! (local filesystem, Amazon S3 and compatibles, Google Cloud Storage and
//! Google Drive) and a provider registry for resolving them from persisted
//! configuration.
//!
//! # Design Principles
//! - Provider isolation: no provider-specific logic leaks into the manager
//! - Sequential transfers: chunked uploads are a loop of awaited round-trips
//! - Bounded memory: large files are streamed in fixed-size chunks
//! - Unified error semantics: consistent error types across providers

pub mod config;
pub mod gcs;
pub mod gdrive;
pub mod http;
pub mod local;
pub mod memory;
pub mod provider;
pub mod registry;
pub mod s3;
pub mod token;
pub mod transfer;

pub use config::{FieldKind, FieldSpec, ProviderConfig};
pub use gcs::{GcsConfig, GcsProvider};
pub use gdrive::{GDriveConfig, GDriveProvider};
pub use local::{LocalConfig, LocalProvider};
pub use memory::MemoryProvider;
pub use provider::StorageProvider;
pub use registry::{create_default_registry, ProviderContext, ProviderFactory, ProviderRegistry};
pub use s3::{S3Config, S3Provider};
pub use token::{AuthToken, Clock, ManualClock, SystemClock, TokenCache, TokenSource};
pub use transfer::{CHUNK_SIZE, MULTIPART_THRESHOLD};
