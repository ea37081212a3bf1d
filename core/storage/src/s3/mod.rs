//! S3 storage provider.
//!
//! Speaks the S3 REST API directly with SigV4-signed requests:
//! - Single PUT for small artifacts, multipart upload (with abort on
//!   failure) above the threshold
//! - Paginated ListObjectsV2
//! - Custom endpoints with path-style addressing for S3-compatible services

pub mod client;
pub mod provider;
pub mod signing;
pub mod xml;

pub use client::S3Client;
pub use provider::{S3Config, S3Provider, STORAGE_CLASSES};
pub use signing::{sign, Credentials, SignedHeaders, SigningRequest};
