//! Storage abstractions
//!
//! The engine persists through two narrow interfaces: [`RecordStore`] for
//! the cumulative per-subject record document, and [`KeyValueStore`] for the
//! shared lock/snapshot entries (keyed `subject-id:purpose`, with explicit
//! TTLs). In-memory implementations back tests and single-process
//! deployments; multi-process deployments supply their own.

mod memory;
mod traits;

pub use memory::{InMemoryKeyValueStore, InMemoryRecordStore};
pub use traits::{KeyValueStore, RecordStore};
