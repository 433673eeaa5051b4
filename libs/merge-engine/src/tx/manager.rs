//! Transaction orchestration: lock → snapshot → apply → version → persist → audit
//!
//! `commit` is all-or-nothing: any failure before persistence leaves the
//! stored record byte-for-byte unchanged, releases the lock if it was
//! acquired, and keeps the staging area registered until it is explicitly
//! rolled back or reclaimed by the background sweep.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::config::TransactionConfig;
use crate::store::{KeyValueStore, RecordStore};
use crate::tx::lock::LockManager;
use crate::tx::snapshot::SnapshotManager;
use crate::tx::staging::{ChangeOperation, StagedChange, StagingArea};
use crate::{Error, Result};
use chronik_models::{Fact, Record};

/// Pre-apply validation hook over the staged changes. Returning `Err` aborts
/// the commit before any mutation.
pub type ValidationCallback = dyn Fn(&[StagedChange]) -> std::result::Result<(), String> + Send + Sync;

/// Structured outcome of a commit or rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub success: bool,
    pub transaction_id: Uuid,
    pub staging_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<Uuid>,
    pub changes_applied: usize,
    pub rollback_performed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
    pub version_before: i64,
    pub version_after: i64,
}

#[derive(Clone)]
pub struct TransactionManager {
    records: Arc<dyn RecordStore>,
    locks: LockManager,
    snapshots: SnapshotManager,
    audit: Arc<dyn AuditSink>,
    staging: Arc<Mutex<HashMap<Uuid, StagingArea>>>,
    config: TransactionConfig,
}

impl TransactionManager {
    pub fn new(
        records: Arc<dyn RecordStore>,
        kv: Arc<dyn KeyValueStore>,
        audit: Arc<dyn AuditSink>,
        config: TransactionConfig,
    ) -> Self {
        let locks = LockManager::new(kv.clone(), Duration::from_secs(config.lock_timeout_seconds));
        let snapshots = SnapshotManager::new(
            kv,
            records.clone(),
            audit.clone(),
            locks.clone(),
            config.snapshot_cap,
            Duration::from_secs(config.snapshot_ttl_days * 24 * 3600),
        );
        Self {
            records,
            locks,
            snapshots,
            audit,
            staging: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// Open a staging area for one in-flight operation, using the currently
    /// persisted record (or a fresh one) as the immutable baseline.
    pub async fn create_staging(&self, subject_id: &str, operation_id: Uuid) -> Result<Uuid> {
        let baseline = match self.records.get(subject_id).await? {
            Some(record) => {
                record.validate_structure()?;
                record
            }
            None => Record::new(subject_id),
        };

        let area = StagingArea::new(subject_id, operation_id, baseline);
        let staging_id = area.staging_id;
        self.staging.lock().await.insert(staging_id, area);
        tracing::debug!(subject_id, %staging_id, "staging area created");
        Ok(staging_id)
    }

    /// Buffer a change into an open staging area.
    pub async fn add_change(
        &self,
        staging_id: Uuid,
        operation: ChangeOperation,
        fact: Fact,
        metadata: HashMap<String, JsonValue>,
    ) -> Result<Uuid> {
        let mut staging = self.staging.lock().await;
        let area = staging
            .get_mut(&staging_id)
            .ok_or(Error::UnknownStaging(staging_id))?;
        Ok(area.add_change(operation, fact, metadata))
    }

    /// Commit a staging area.
    ///
    /// 1. Acquire the subject's exclusive lock (fail fast if held).
    /// 2. Snapshot the currently persisted record.
    /// 3. Run the optional validation callback; abort on failure.
    /// 4. Apply staged operations, in order, to a copy of the baseline.
    /// 5. Advance the version by one and stamp `last_updated`.
    /// 6. Validate the resulting record's structure; reject, never repair.
    /// 7. Persist atomically and write an audit entry.
    /// 8. Release the lock and discard the staging area.
    ///
    /// On failure the staging area stays registered (roll it back or let the
    /// sweep reclaim it) and the error propagates.
    pub async fn commit(
        &self,
        staging_id: Uuid,
        user: &str,
        validate: Option<&ValidationCallback>,
    ) -> Result<TransactionResult> {
        let started = Instant::now();

        let area = {
            let staging = self.staging.lock().await;
            staging
                .get(&staging_id)
                .ok_or(Error::UnknownStaging(staging_id))?
                .clone()
        };

        self.locks.acquire(&area.subject_id, area.operation_id).await?;
        let outcome = self.commit_locked(&area, user, validate).await;
        if let Err(e) = self.locks.release(&area.subject_id, area.operation_id).await {
            tracing::warn!(subject_id = %area.subject_id, "failed to release lock after commit: {}", e);
        }

        let (snapshot_id, changes_applied, version_before, version_after) = outcome?;

        self.staging.lock().await.remove(&staging_id);
        self.audit
            .record(AuditEvent::new(
                AuditEventType::Commit,
                &area.subject_id,
                count_by_kind(area.changes()),
                user,
            ))
            .await;

        tracing::info!(
            subject_id = %area.subject_id,
            %staging_id,
            changes_applied,
            version_after,
            "transaction committed"
        );

        Ok(TransactionResult {
            success: true,
            transaction_id: Uuid::new_v4(),
            staging_id,
            snapshot_id: Some(snapshot_id),
            changes_applied,
            rollback_performed: false,
            error_message: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
            version_before,
            version_after,
        })
    }

    async fn commit_locked(
        &self,
        area: &StagingArea,
        user: &str,
        validate: Option<&ValidationCallback>,
    ) -> Result<(Uuid, usize, i64, i64)> {
        let current = match self.records.get(&area.subject_id).await? {
            Some(record) => {
                record.validate_structure()?;
                record
            }
            None => Record::new(&area.subject_id),
        };

        let snapshot = self
            .snapshots
            .create_snapshot(&current, user, "pre-commit backup")
            .await?;

        if let Some(callback) = validate {
            callback(area.changes()).map_err(Error::Validation)?;
        }

        let (mut applied, changes_applied) = area.apply_to_baseline();
        applied.version_id = current.version_id + 1;
        applied.last_updated = Utc::now();
        applied.validate_structure()?;

        self.records
            .put(&applied)
            .await
            .map_err(|e| Error::Commit(e.to_string()))?;

        Ok((
            snapshot.snapshot_id,
            changes_applied,
            current.version_id,
            applied.version_id,
        ))
    }

    /// Discard a staging area without touching the persisted record.
    pub async fn rollback(&self, staging_id: Uuid, user: &str) -> Result<TransactionResult> {
        let started = Instant::now();
        let area = self
            .staging
            .lock()
            .await
            .remove(&staging_id)
            .ok_or(Error::UnknownStaging(staging_id))?;

        self.audit
            .record(AuditEvent::new(
                AuditEventType::Rollback,
                &area.subject_id,
                count_by_kind(area.changes()),
                user,
            ))
            .await;

        tracing::info!(subject_id = %area.subject_id, %staging_id, "transaction rolled back");

        let version = area.original_record().version_id;
        Ok(TransactionResult {
            success: true,
            transaction_id: Uuid::new_v4(),
            staging_id,
            snapshot_id: None,
            changes_applied: 0,
            rollback_performed: true,
            error_message: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
            version_before: version,
            version_after: version,
        })
    }

    /// Scoped transaction: stage changes inside `f`, then commit (when
    /// `auto_commit`) or discard. The staging area is removed on every exit
    /// path; errors from `f` or from the commit propagate after rollback.
    pub async fn with_transaction<T, F>(
        &self,
        subject_id: &str,
        operation_id: Uuid,
        user: &str,
        auto_commit: bool,
        f: F,
    ) -> Result<(T, Option<TransactionResult>)>
    where
        F: FnOnce(&mut StagingArea) -> Result<T>,
    {
        let staging_id = self.create_staging(subject_id, operation_id).await?;

        let staged = {
            let mut staging = self.staging.lock().await;
            let area = staging
                .get_mut(&staging_id)
                .ok_or(Error::UnknownStaging(staging_id))?;
            f(area)
        };

        let value = match staged {
            Ok(value) => value,
            Err(e) => {
                if let Err(rollback_err) = self.rollback(staging_id, user).await {
                    tracing::warn!(%staging_id, "rollback after staging failure also failed: {}", rollback_err);
                }
                return Err(e);
            }
        };

        if !auto_commit {
            // Dry run: the staged changes are discarded, never applied.
            let result = self.rollback(staging_id, user).await?;
            return Ok((value, Some(result)));
        }

        match self.commit(staging_id, user, None).await {
            Ok(result) => Ok((value, Some(result))),
            Err(e) => {
                if let Err(rollback_err) = self.rollback(staging_id, user).await {
                    tracing::warn!(%staging_id, "rollback after commit failure also failed: {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    /// Background sweep: drop staging areas older than the configured
    /// lifetime. A safety net for abandoned operations, never part of the
    /// commit path.
    pub async fn reclaim_expired_staging(&self) -> usize {
        let lifetime = chrono::Duration::seconds(self.config.staging_lifetime_seconds as i64);
        let mut staging = self.staging.lock().await;
        let before = staging.len();
        staging.retain(|staging_id, area| {
            let keep = area.age() < lifetime;
            if !keep {
                tracing::info!(subject_id = %area.subject_id, %staging_id, "expired staging area reclaimed");
            }
            keep
        });
        before - staging.len()
    }

    pub async fn active_staging_count(&self) -> usize {
        self.staging.lock().await.len()
    }
}

fn count_by_kind(changes: &[StagedChange]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for change in changes {
        *counts.entry(change.fact.kind.to_string()).or_default() += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::store::{InMemoryKeyValueStore, InMemoryRecordStore};
    use async_trait::async_trait;
    use chronik_models::FactKind;

    fn fact(id: &str) -> Fact {
        let mut fact = Fact::new(FactKind::Condition);
        fact.id = Some(id.to_string());
        fact.status = Some("active".to_string());
        fact
    }

    fn manager() -> (TransactionManager, Arc<InMemoryRecordStore>, RecordingAuditSink) {
        let records = Arc::new(InMemoryRecordStore::new());
        let audit = RecordingAuditSink::new();
        let manager = TransactionManager::new(
            records.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(audit.clone()),
            TransactionConfig::default(),
        );
        (manager, records, audit)
    }

    #[tokio::test]
    async fn commit_applies_adds_and_advances_version() {
        let (manager, records, audit) = manager();
        let staging_id = manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        for id in ["c1", "c2", "c3"] {
            manager
                .add_change(staging_id, ChangeOperation::Add, fact(id), HashMap::new())
                .await
                .unwrap();
        }

        let result = manager.commit(staging_id, "tester", None).await.unwrap();
        assert!(result.success);
        assert_eq!(result.changes_applied, 3);
        assert_eq!(result.version_before, 1);
        assert_eq!(result.version_after, 2);
        assert!(result.snapshot_id.is_some());

        let stored = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(stored.facts.len(), 3);
        assert_eq!(stored.version_id, 2);
        assert_eq!(manager.active_staging_count().await, 0);

        let events = audit.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::Commit);
        assert_eq!(events[0].counts_by_kind.get("Condition"), Some(&3));
    }

    #[tokio::test]
    async fn validation_callback_failure_aborts_without_mutation() {
        let (manager, records, _) = manager();
        let staging_id = manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        manager
            .add_change(staging_id, ChangeOperation::Add, fact("c1"), HashMap::new())
            .await
            .unwrap();

        let reject: Box<ValidationCallback> = Box::new(|_| Err("rejected".to_string()));
        let result = manager.commit(staging_id, "tester", Some(&*reject)).await;
        assert!(matches!(result, Err(Error::Validation(_))));

        assert!(records.get("patient-1").await.unwrap().is_none());
        // Staging retained for explicit rollback or reclaim.
        assert_eq!(manager.active_staging_count().await, 1);
        // Lock released: a fresh commit succeeds.
        assert!(manager.commit(staging_id, "tester", None).await.is_ok());
    }

    #[tokio::test]
    async fn commit_fails_fast_when_lock_is_held() {
        let (manager, _, _) = manager();
        let other_op = Uuid::new_v4();
        manager.locks().acquire("patient-1", other_op).await.unwrap();

        let staging_id = manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        let result = manager.commit(staging_id, "tester", None).await;
        assert!(matches!(result, Err(Error::LockAcquisition { .. })));
    }

    #[tokio::test]
    async fn rollback_discards_without_touching_persisted_state() {
        let (manager, records, audit) = manager();
        let mut existing = Record::new("patient-1");
        existing.upsert(fact("c0"));
        records.put(&existing).await.unwrap();

        let staging_id = manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        manager
            .add_change(staging_id, ChangeOperation::Add, fact("c1"), HashMap::new())
            .await
            .unwrap();

        let result = manager.rollback(staging_id, "tester").await.unwrap();
        assert!(result.rollback_performed);
        assert_eq!(result.version_before, result.version_after);

        let stored = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(stored.facts.len(), 1);
        assert_eq!(manager.active_staging_count().await, 0);
        assert_eq!(audit.events().await[0].event_type, AuditEventType::Rollback);
    }

    struct FailingRecordStore {
        inner: InMemoryRecordStore,
    }

    #[async_trait]
    impl RecordStore for FailingRecordStore {
        async fn get(&self, subject_id: &str) -> Result<Option<Record>> {
            self.inner.get(subject_id).await
        }

        async fn put(&self, _record: &Record) -> Result<()> {
            Err(Error::Store("disk full".to_string()))
        }

        async fn delete(&self, subject_id: &str) -> Result<bool> {
            self.inner.delete(subject_id).await
        }
    }

    #[tokio::test]
    async fn persistence_failure_leaves_no_trace_and_releases_lock() {
        let records = Arc::new(FailingRecordStore {
            inner: InMemoryRecordStore::new(),
        });
        let manager = TransactionManager::new(
            records,
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(RecordingAuditSink::new()),
            TransactionConfig::default(),
        );

        let staging_id = manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        manager
            .add_change(staging_id, ChangeOperation::Add, fact("c1"), HashMap::new())
            .await
            .unwrap();

        let result = manager.commit(staging_id, "tester", None).await;
        assert!(matches!(result, Err(Error::Commit(_))));
        assert!(!manager.locks().is_locked("patient-1").await.unwrap());
        assert_eq!(manager.active_staging_count().await, 1);
    }

    #[tokio::test]
    async fn with_transaction_commits_on_success() {
        let (manager, records, _) = manager();
        let (staged, result) = manager
            .with_transaction("patient-1", Uuid::new_v4(), "tester", true, |area| {
                area.add_change(ChangeOperation::Add, fact("c1"), HashMap::new());
                Ok(area.changes().len())
            })
            .await
            .unwrap();

        assert_eq!(staged, 1);
        assert!(result.unwrap().success);
        assert_eq!(records.get("patient-1").await.unwrap().unwrap().facts.len(), 1);
        assert_eq!(manager.active_staging_count().await, 0);
    }

    #[tokio::test]
    async fn with_transaction_rolls_back_on_closure_error() {
        let (manager, records, audit) = manager();
        let result: Result<((), _)> = manager
            .with_transaction("patient-1", Uuid::new_v4(), "tester", true, |area| {
                area.add_change(ChangeOperation::Add, fact("c1"), HashMap::new());
                Err(Error::Validation("bad fact".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(records.get("patient-1").await.unwrap().is_none());
        assert_eq!(manager.active_staging_count().await, 0);
        assert_eq!(audit.events().await[0].event_type, AuditEventType::Rollback);
    }

    #[tokio::test]
    async fn with_transaction_without_auto_commit_is_a_dry_run() {
        let (manager, records, _) = manager();
        let (_, result) = manager
            .with_transaction("patient-1", Uuid::new_v4(), "tester", false, |area| {
                area.add_change(ChangeOperation::Add, fact("c1"), HashMap::new());
                Ok(())
            })
            .await
            .unwrap();

        assert!(result.unwrap().rollback_performed);
        assert!(records.get("patient-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_removes_only_expired_areas() {
        let records = Arc::new(InMemoryRecordStore::new());
        let manager = TransactionManager::new(
            records,
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(RecordingAuditSink::new()),
            TransactionConfig {
                staging_lifetime_seconds: 0,
                ..TransactionConfig::default()
            },
        );

        manager
            .create_staging("patient-1", Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(manager.reclaim_expired_staging().await, 1);
        assert_eq!(manager.active_staging_count().await, 0);
    }
}
