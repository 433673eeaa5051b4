//! Point-in-time record snapshots
//!
//! Snapshots back two things: the automatic backup taken before every
//! commit, and manual restore. They live in the shared key-value store
//! (`{subject}:snapshot:{id}`, TTL 30 days by default) with a per-subject
//! most-recent-first index capped at a configurable count; the oldest entry
//! is evicted beyond the cap. A restore first snapshots the current state,
//! so the restore itself is reversible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::audit::{AuditEvent, AuditEventType, AuditSink};
use crate::store::{KeyValueStore, RecordStore};
use crate::tx::lock::LockManager;
use crate::{Error, Result};
use chronik_models::Record;

/// Immutable point-in-time copy of a subject's record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSnapshot {
    pub snapshot_id: Uuid,
    pub subject_id: String,
    pub record: Record,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub reason: String,
    pub record_version: i64,
}

#[derive(Clone)]
pub struct SnapshotManager {
    kv: Arc<dyn KeyValueStore>,
    records: Arc<dyn RecordStore>,
    audit: Arc<dyn AuditSink>,
    locks: LockManager,
    cap: usize,
    ttl: Duration,
}

impl SnapshotManager {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        records: Arc<dyn RecordStore>,
        audit: Arc<dyn AuditSink>,
        locks: LockManager,
        cap: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            kv,
            records,
            audit,
            locks,
            cap,
            ttl,
        }
    }

    fn snapshot_key(subject_id: &str, snapshot_id: Uuid) -> String {
        format!("{subject_id}:snapshot:{snapshot_id}")
    }

    fn index_key(subject_id: &str) -> String {
        format!("{subject_id}:snapshots")
    }

    /// Store a deep copy of `record`, evicting the oldest snapshot beyond
    /// the per-subject cap.
    pub async fn create_snapshot(
        &self,
        record: &Record,
        created_by: &str,
        reason: &str,
    ) -> Result<TransactionSnapshot> {
        let snapshot = TransactionSnapshot {
            snapshot_id: Uuid::new_v4(),
            subject_id: record.subject_id.clone(),
            record: record.clone(),
            created_at: Utc::now(),
            created_by: created_by.to_string(),
            reason: reason.to_string(),
            record_version: record.version_id,
        };

        self.kv
            .put(
                &Self::snapshot_key(&snapshot.subject_id, snapshot.snapshot_id),
                serde_json::to_value(&snapshot)?,
                Some(self.ttl),
            )
            .await?;

        // Maintain the most-recent-first index and evict beyond the cap.
        let mut index = self.load_index(&snapshot.subject_id).await?;
        index.insert(0, snapshot.snapshot_id);
        while index.len() > self.cap {
            let Some(evicted) = index.pop() else { break };
            self.kv
                .remove(&Self::snapshot_key(&snapshot.subject_id, evicted))
                .await?;
            tracing::debug!(subject_id = %snapshot.subject_id, %evicted, "snapshot evicted");
        }
        self.store_index(&snapshot.subject_id, &index).await?;

        Ok(snapshot)
    }

    pub async fn get_snapshot(
        &self,
        subject_id: &str,
        snapshot_id: Uuid,
    ) -> Result<Option<TransactionSnapshot>> {
        let value = self
            .kv
            .get(&Self::snapshot_key(subject_id, snapshot_id))
            .await?;
        Ok(match value {
            Some(v) => Some(serde_json::from_value(v)?),
            None => None,
        })
    }

    /// Snapshot ids, most recent first.
    pub async fn list_snapshots(&self, subject_id: &str) -> Result<Vec<Uuid>> {
        self.load_index(subject_id).await
    }

    /// Overwrite the live record with a snapshot's copy.
    ///
    /// Runs under the subject's exclusive lock: a restore never interleaves
    /// with a commit. The current state is snapshotted first so the restore
    /// can itself be undone. The restored record continues the subject's
    /// version sequence rather than reverting it.
    pub async fn restore(
        &self,
        subject_id: &str,
        snapshot_id: Uuid,
        user: &str,
    ) -> Result<Record> {
        let operation_id = Uuid::new_v4();
        self.locks
            .with_lock(subject_id, operation_id, || {
                self.restore_locked(subject_id, snapshot_id, user)
            })
            .await
    }

    async fn restore_locked(
        &self,
        subject_id: &str,
        snapshot_id: Uuid,
        user: &str,
    ) -> Result<Record> {
        let snapshot = self
            .get_snapshot(subject_id, snapshot_id)
            .await?
            .ok_or_else(|| {
                Error::Store(format!("snapshot {snapshot_id} not found for {subject_id}"))
            })?;

        let current = self
            .records
            .get(subject_id)
            .await?
            .unwrap_or_else(|| Record::new(subject_id));
        current.validate_structure()?;

        self.create_snapshot(&current, user, "pre-restore backup")
            .await?;

        let mut restored = snapshot.record;
        restored.version_id = current.version_id + 1;
        restored.last_updated = Utc::now();
        restored.validate_structure()?;
        self.records.put(&restored).await?;

        let mut counts: HashMap<String, usize> = HashMap::new();
        for fact in &restored.facts {
            *counts.entry(fact.kind.to_string()).or_default() += 1;
        }
        self.audit
            .record(AuditEvent::new(
                AuditEventType::Restore,
                subject_id,
                counts,
                user,
            ))
            .await;

        tracing::info!(subject_id, %snapshot_id, "record restored from snapshot");
        Ok(restored)
    }

    async fn load_index(&self, subject_id: &str) -> Result<Vec<Uuid>> {
        let value = self.kv.get(&Self::index_key(subject_id)).await?;
        Ok(match value {
            Some(v) => serde_json::from_value(v)?,
            None => Vec::new(),
        })
    }

    async fn store_index(&self, subject_id: &str, index: &[Uuid]) -> Result<()> {
        self.kv
            .put(
                &Self::index_key(subject_id),
                serde_json::to_value(index)?,
                Some(self.ttl),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::store::{InMemoryKeyValueStore, InMemoryRecordStore};
    use chronik_models::{Fact, FactKind};

    fn setup(cap: usize) -> (SnapshotManager, Arc<InMemoryRecordStore>, RecordingAuditSink) {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let audit = RecordingAuditSink::new();
        let locks = LockManager::new(kv.clone(), Duration::from_secs(300));
        let manager = SnapshotManager::new(
            kv,
            records.clone(),
            Arc::new(audit.clone()),
            locks,
            cap,
            Duration::from_secs(30 * 24 * 3600),
        );
        (manager, records, audit)
    }

    fn record_with_fact(subject: &str, fact_id: &str) -> Record {
        let mut record = Record::new(subject);
        let mut fact = Fact::new(FactKind::Condition);
        fact.id = Some(fact_id.to_string());
        fact.status = Some("active".to_string());
        record.upsert(fact);
        record
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let (manager, _, _) = setup(10);
        let record = record_with_fact("patient-1", "c1");
        let snapshot = manager
            .create_snapshot(&record, "tester", "pre-commit")
            .await
            .unwrap();

        let loaded = manager
            .get_snapshot("patient-1", snapshot.snapshot_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.record, record);
        assert_eq!(loaded.record_version, 1);
        assert_eq!(loaded.reason, "pre-commit");
    }

    #[tokio::test]
    async fn cap_evicts_oldest() {
        let (manager, _, _) = setup(2);
        let record = record_with_fact("patient-1", "c1");

        let first = manager.create_snapshot(&record, "t", "1").await.unwrap();
        let second = manager.create_snapshot(&record, "t", "2").await.unwrap();
        let third = manager.create_snapshot(&record, "t", "3").await.unwrap();

        let ids = manager.list_snapshots("patient-1").await.unwrap();
        assert_eq!(ids, vec![third.snapshot_id, second.snapshot_id]);
        assert!(manager
            .get_snapshot("patient-1", first.snapshot_id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn restore_is_denied_while_a_writer_holds_the_lock() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let records = Arc::new(InMemoryRecordStore::new());
        let locks = LockManager::new(kv.clone(), Duration::from_secs(300));
        let manager = SnapshotManager::new(
            kv,
            records.clone(),
            Arc::new(RecordingAuditSink::new()),
            locks.clone(),
            10,
            Duration::from_secs(30 * 24 * 3600),
        );

        let original = record_with_fact("patient-1", "c1");
        records.put(&original).await.unwrap();
        let snapshot = manager
            .create_snapshot(&original, "t", "before")
            .await
            .unwrap();

        let writer = Uuid::new_v4();
        locks.acquire("patient-1", writer).await.unwrap();

        let denied = manager
            .restore("patient-1", snapshot.snapshot_id, "tester")
            .await;
        assert!(matches!(denied, Err(Error::LockAcquisition { .. })));
        assert_eq!(records.get("patient-1").await.unwrap().unwrap(), original);

        locks.release("patient-1", writer).await.unwrap();
        assert!(manager
            .restore("patient-1", snapshot.snapshot_id, "tester")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn restore_is_reversible_and_audited() {
        let (manager, records, audit) = setup(10);

        let original = record_with_fact("patient-1", "c1");
        records.put(&original).await.unwrap();
        let snapshot = manager
            .create_snapshot(&original, "t", "before changes")
            .await
            .unwrap();

        // The live record moves on.
        let mut evolved = record_with_fact("patient-1", "c2");
        evolved.version_id = 5;
        records.put(&evolved).await.unwrap();

        let restored = manager
            .restore("patient-1", snapshot.snapshot_id, "tester")
            .await
            .unwrap();
        assert_eq!(restored.version_id, 6);
        assert_eq!(restored.facts[0].id.as_deref(), Some("c1"));

        // A backup of the evolved state exists, so the restore can be undone.
        let ids = manager.list_snapshots("patient-1").await.unwrap();
        assert_eq!(ids.len(), 2);

        let events = audit.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::Restore);
    }
}
