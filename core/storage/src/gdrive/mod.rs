//! Google Drive storage provider.
//!
//! This module provides a storage backend using Google Drive with:
//! - OAuth through a proxy that keeps the client secret off this host
//! - Token refresh and a single retry when the API answers 401
//! - Resumable uploads for large artifacts
//! - A backup folder created on first use

pub mod auth;
pub mod client;
pub mod provider;
pub mod proxy;

pub use auth::DriveAuth;
pub use client::DriveClient;
pub use provider::{
    GDriveConfig, GDriveProvider, DEFAULT_FOLDER_NAME, DEFAULT_PROXY_URL, SIMPLE_UPLOAD_LIMIT,
};
pub use proxy::{consent_url, ProxyPayload, TokenBundle};
