//! Transaction core: locking, snapshots, staging, commit/rollback
//!
//! The concurrency and consistency heart of the engine. All writers to one
//! subject serialize on that subject's lock; a commit either applies every
//! staged operation and advances the record version by exactly one, or
//! leaves the persisted record byte-for-byte unchanged.

mod lock;
mod manager;
mod snapshot;
mod staging;

pub use lock::LockManager;
pub use manager::{TransactionManager, TransactionResult, ValidationCallback};
pub use snapshot::{SnapshotManager, TransactionSnapshot};
pub use staging::{ChangeOperation, StagedChange, StagingArea};
