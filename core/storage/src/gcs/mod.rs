//! Google Cloud Storage provider.
//!
//! Authenticates as a service account (RS256 JWT exchanged for a bearer
//! token) and talks to the JSON API. Large artifacts go through resumable
//! upload sessions.

pub mod auth;
pub mod client;
pub mod provider;

pub use auth::{ServiceAccountAuth, STORAGE_SCOPE};
pub use client::GcsClient;
pub use provider::{GcsConfig, GcsProvider, DEFAULT_API_BASE, DEFAULT_TOKEN_URI};
