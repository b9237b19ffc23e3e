//! State management module for the provisioning system.
//!
//! This module provides persistent storage of applied resources (provider
//! identifiers, outputs, attribute hashes) and the in-process ledger the
//! executor reads and writes while a plan runs.

mod store;
mod local;
mod s3;
mod lock;
mod ledger;
mod types;

pub use store::{StateStore, check_version};
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use ledger::{LedgerEntry, StateLedger};
pub use types::{AppliedState, ApplyHistoryEntry, ApplyOperation, ResourceState, STATE_VERSION};
