//! Per-subject mutual exclusion
//!
//! Single writer per subject, agreed across processes: a local in-process
//! table backs fast-path checks, and a shared [`KeyValueStore`] entry
//! (`{subject}:lock`, TTL = lock timeout) makes separate worker processes
//! agree. A lock whose TTL elapsed counts as released even without an
//! explicit release call; `release` only succeeds for the current holder.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::KeyValueStore;
use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SharedLockEntry {
    operation_id: Uuid,
    acquired_at: chrono::DateTime<chrono::Utc>,
    timeout_seconds: u64,
}

struct LocalLockEntry {
    operation_id: Uuid,
    acquired_at: Instant,
}

#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn KeyValueStore>,
    local: Arc<Mutex<HashMap<String, LocalLockEntry>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        Self {
            store,
            local: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn lock_key(subject_id: &str) -> String {
        format!("{subject_id}:lock")
    }

    /// Acquire the subject's exclusive lock for `operation_id`.
    ///
    /// Fails immediately when a live lock is held by a different operation.
    /// Re-acquiring under the same operation id is idempotent. The shared
    /// entry is claimed with a single atomic `put_if_absent`, so two worker
    /// processes racing over one store cannot both win.
    pub async fn acquire(&self, subject_id: &str, operation_id: Uuid) -> Result<()> {
        let mut local = self.local.lock().await;

        if let Some(entry) = local.get(subject_id) {
            let expired = entry.acquired_at.elapsed() >= self.timeout;
            if !expired && entry.operation_id != operation_id {
                return Err(Error::LockAcquisition {
                    subject_id: subject_id.to_string(),
                    reason: format!("held by operation {}", entry.operation_id),
                });
            }
        }

        let key = Self::lock_key(subject_id);
        let shared = SharedLockEntry {
            operation_id,
            acquired_at: chrono::Utc::now(),
            timeout_seconds: self.timeout.as_secs(),
        };
        let value = serde_json::to_value(&shared)?;

        let claimed = self
            .store
            .put_if_absent(&key, value.clone(), Some(self.timeout))
            .await?;
        if !claimed {
            match self.store.get(&key).await? {
                Some(existing) => {
                    let existing: SharedLockEntry = serde_json::from_value(existing)?;
                    if existing.operation_id != operation_id {
                        return Err(Error::LockAcquisition {
                            subject_id: subject_id.to_string(),
                            reason: format!(
                                "held by operation {} in another process",
                                existing.operation_id
                            ),
                        });
                    }
                    // Re-acquire by the current holder refreshes the TTL.
                    self.store.put(&key, value, Some(self.timeout)).await?;
                }
                // The claim expired between the attempt and the read.
                None => {
                    if !self.store.put_if_absent(&key, value, Some(self.timeout)).await? {
                        return Err(Error::LockAcquisition {
                            subject_id: subject_id.to_string(),
                            reason: "lost the claim to a competing writer".to_string(),
                        });
                    }
                }
            }
        }

        local.insert(
            subject_id.to_string(),
            LocalLockEntry {
                operation_id,
                acquired_at: Instant::now(),
            },
        );

        tracing::debug!(subject_id, %operation_id, "subject lock acquired");
        Ok(())
    }

    /// Release the lock if `operation_id` is the current holder. A release
    /// by a stale holder is a no-op returning `false`.
    pub async fn release(&self, subject_id: &str, operation_id: Uuid) -> Result<bool> {
        let mut local = self.local.lock().await;
        let holds_locally = local
            .get(subject_id)
            .is_some_and(|entry| entry.operation_id == operation_id);

        let key = Self::lock_key(subject_id);
        let holds_shared = match self.store.get(&key).await? {
            Some(value) => {
                let shared: SharedLockEntry = serde_json::from_value(value)?;
                shared.operation_id == operation_id
            }
            None => false,
        };

        if !holds_locally && !holds_shared {
            return Ok(false);
        }

        if holds_locally {
            local.remove(subject_id);
        }
        if holds_shared {
            self.store.remove(&key).await?;
        }
        tracing::debug!(subject_id, %operation_id, "subject lock released");
        Ok(true)
    }

    /// Whether a live lock exists for the subject.
    pub async fn is_locked(&self, subject_id: &str) -> Result<bool> {
        let local = self.local.lock().await;
        if let Some(entry) = local.get(subject_id) {
            if entry.acquired_at.elapsed() < self.timeout {
                return Ok(true);
            }
        }
        drop(local);
        Ok(self.store.get(&Self::lock_key(subject_id)).await?.is_some())
    }

    /// Run `f` while holding the subject's lock. The lock is released on
    /// every exit path, success or error.
    pub async fn with_lock<T, F, Fut>(
        &self,
        subject_id: &str,
        operation_id: Uuid,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.acquire(subject_id, operation_id).await?;
        let result = f().await;
        if let Err(e) = self.release(subject_id, operation_id).await {
            tracing::warn!(subject_id, "failed to release subject lock: {}", e);
        }
        result
    }
}
