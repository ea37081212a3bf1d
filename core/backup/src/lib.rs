//! Backup inventory management for Siberian.
//!
//! The [`StorageManager`] owns one storage provider per backend, guards
//! transfers behind configuration checks and reconciles the persisted
//! backup ledger against live provider listings.

pub mod ledger;
pub mod manager;
pub mod reconcile;
pub mod retry;

pub use ledger::{Ledger, LedgerEntry};
pub use manager::{ProviderSchema, StorageManager};
pub use reconcile::{merge, newest_first, primary_storage, Discrepancy, Listing, Reconciliation, PROVIDER_PRIORITY};
pub use retry::{is_transient, RetryConfig, RetryExecutor};
