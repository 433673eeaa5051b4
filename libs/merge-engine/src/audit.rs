//! Audit trail for record mutations
//!
//! Every commit, rollback, and restore emits a structured entry. Entries
//! carry event type, per-kind counts, and attribution only — clinical field
//! values never appear in the audit stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventType {
    Commit,
    Rollback,
    Restore,
}

/// One audit entry. Counts and types only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub subject_id: String,
    /// Number of changes per fact kind.
    pub counts_by_kind: HashMap<String, usize>,
    pub total_changes: usize,
    /// Clinical records always involve personal health information.
    pub phi_involved: bool,
    pub performed_by: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        subject_id: impl Into<String>,
        counts_by_kind: HashMap<String, usize>,
        performed_by: impl Into<String>,
    ) -> Self {
        let total_changes = counts_by_kind.values().sum();
        Self {
            event_type,
            subject_id: subject_id.into(),
            counts_by_kind,
            total_changes,
            phi_involved: true,
            performed_by: performed_by.into(),
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for audit entries.
///
/// Sinks are best-effort from the transaction manager's point of view: a
/// failing sink is logged, never allowed to fail a commit that already
/// persisted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent);
}

/// Emits audit entries as structured tracing events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuditEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            subject_id = %event.subject_id,
            total_changes = event.total_changes,
            performed_by = %event.performed_by,
            phi_involved = event.phi_involved,
            "record mutation audited"
        );
    }
}

/// Captures audit entries in memory. Test support.
#[derive(Default, Clone)]
pub struct RecordingAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl AuditSink for RecordingAuditSink {
    async fn record(&self, event: AuditEvent) {
        self.events.lock().await.push(event);
    }
}
