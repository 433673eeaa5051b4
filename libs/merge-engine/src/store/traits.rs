//! Storage trait definitions

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::time::Duration;

use crate::Result;
use chronik_models::Record;

/// Persistence of the cumulative per-subject record.
///
/// `put` must be atomic: readers observe either the previous record or the
/// new one, never a partial write.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, subject_id: &str) -> Result<Option<Record>>;

    async fn put(&self, record: &Record) -> Result<()>;

    /// Remove a subject's record. Returns whether one existed.
    async fn delete(&self, subject_id: &str) -> Result<bool>;
}

/// Shared key-value store for lock and snapshot entries.
///
/// Keys follow the `subject-id:purpose` convention. Entries carry explicit
/// TTLs; an expired entry behaves as absent.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>>;

    async fn put(&self, key: &str, value: JsonValue, ttl: Option<Duration>) -> Result<()>;

    /// Atomically claim `key`: write only when no live entry exists.
    /// Returns whether the claim succeeded. Two concurrent callers must
    /// never both observe `true` for the same key.
    async fn put_if_absent(&self, key: &str, value: JsonValue, ttl: Option<Duration>)
        -> Result<bool>;

    /// Remove an entry. Returns whether a live entry existed.
    async fn remove(&self, key: &str) -> Result<bool>;
}
