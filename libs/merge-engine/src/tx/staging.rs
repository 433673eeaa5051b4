//! Staging areas: buffered, not-yet-applied changes
//!
//! A staging area belongs to exactly one in-flight operation. It captures an
//! immutable copy of the record at creation time (the baseline) and an
//! ordered list of changes. Nothing here touches persisted state; the
//! transaction manager applies staged changes at commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use uuid::Uuid;

use chronik_models::{Fact, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Add,
    Update,
    Delete,
}

/// One buffered change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedChange {
    pub change_id: Uuid,
    pub operation: ChangeOperation,
    pub fact: Fact,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, JsonValue>,
    pub staged_at: DateTime<Utc>,
}

/// The ordered buffer of changes for one in-flight operation.
#[derive(Debug, Clone)]
pub struct StagingArea {
    pub staging_id: Uuid,
    pub subject_id: String,
    pub operation_id: Uuid,
    pub created_at: DateTime<Utc>,
    original_record: Record,
    changes: Vec<StagedChange>,
}

impl StagingArea {
    pub fn new(subject_id: impl Into<String>, operation_id: Uuid, original_record: Record) -> Self {
        Self {
            staging_id: Uuid::new_v4(),
            subject_id: subject_id.into(),
            operation_id,
            created_at: Utc::now(),
            original_record,
            changes: Vec::new(),
        }
    }

    /// The record as it was when this staging area was created. Immutable
    /// for the lifetime of the area.
    pub fn original_record(&self) -> &Record {
        &self.original_record
    }

    pub fn changes(&self) -> &[StagedChange] {
        &self.changes
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Buffer a change. Returns its change id.
    pub fn add_change(
        &mut self,
        operation: ChangeOperation,
        fact: Fact,
        metadata: HashMap<String, JsonValue>,
    ) -> Uuid {
        let change_id = Uuid::new_v4();
        self.changes.push(StagedChange {
            change_id,
            operation,
            fact,
            metadata,
            staged_at: Utc::now(),
        });
        change_id
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Apply the buffered changes, in order, to a fresh copy of the
    /// baseline. Returns the would-be record and the number of operations
    /// that took effect (a delete of an absent fact is a no-op, not an
    /// error).
    pub(crate) fn apply_to_baseline(&self) -> (Record, usize) {
        let mut record = self.original_record.clone();
        let mut applied = 0;

        for change in &self.changes {
            match change.operation {
                ChangeOperation::Add => {
                    record.facts.push(change.fact.clone());
                    applied += 1;
                }
                ChangeOperation::Update => {
                    // Replace the matching identity, or append if absent.
                    record.upsert(change.fact.clone());
                    applied += 1;
                }
                ChangeOperation::Delete => {
                    if record.remove(&change.fact.identity()) {
                        applied += 1;
                    }
                }
            }
        }

        (record, applied)
    }
}
