//! Playbook Storage - Atomic Persistence
//!
//! Owns the playbook file: validated atomic writes, timestamped backups
//! with corrupt-file fallback, snapshot/restore brackets for reflection,
//! content fingerprints for concurrent-update detection, and the
//! advisory file lock.

mod lock;
mod store;

pub use lock::{lock_path_for, LockMode, PlaybookLock};
pub use store::{Fingerprint, PlaybookStore, Snapshot};
