//! The cumulative per-subject record
//!
//! A [`Record`] is the one shared mutable document per subject: every merge
//! folds new facts into it. Versioning is a single monotonic counter bumped
//! exactly once per committed transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::fact::{Fact, FactIdentity};

/// Structural invariant violations of a persisted record.
///
/// Raised instead of silently repairing: a malformed stored record means a
/// writer bypassed the transaction manager and needs investigation.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record has no subject id")]
    MissingSubject,

    #[error("record version {0} is invalid (must be >= 1)")]
    InvalidVersion(i64),

    #[error("duplicate fact identity in record: {0}")]
    DuplicateIdentity(FactIdentity),
}

/// A subject's cumulative fact collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub subject_id: String,

    /// Monotonically increasing, starting at 1 for a fresh record.
    pub version_id: i64,

    pub last_updated: DateTime<Utc>,

    #[serde(default)]
    pub facts: Vec<Fact>,
}

impl Record {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            version_id: 1,
            last_updated: Utc::now(),
            facts: Vec::new(),
        }
    }

    pub fn find(&self, identity: &FactIdentity) -> Option<&Fact> {
        self.facts.iter().find(|f| &f.identity() == identity)
    }

    pub fn position(&self, identity: &FactIdentity) -> Option<usize> {
        self.facts.iter().position(|f| &f.identity() == identity)
    }

    /// Replace the fact with the same identity, or append if absent.
    pub fn upsert(&mut self, fact: Fact) {
        match self.position(&fact.identity()) {
            Some(index) => self.facts[index] = fact,
            None => self.facts.push(fact),
        }
    }

    /// Remove the fact with the given identity. Returns whether one existed.
    pub fn remove(&mut self, identity: &FactIdentity) -> bool {
        match self.position(identity) {
            Some(index) => {
                self.facts.remove(index);
                true
            }
            None => false,
        }
    }

    /// The returned references borrow only the record, not `kind`.
    pub fn facts_of_kind<'a>(&'a self, kind: &crate::FactKind) -> impl Iterator<Item = &'a Fact> {
        let kind = kind.clone();
        self.facts.iter().filter(move |f| f.kind == kind)
    }

    /// Check structural invariants: subject present, version >= 1, fact
    /// identities unique. Returns the first violation found.
    pub fn validate_structure(&self) -> Result<(), RecordError> {
        if self.subject_id.is_empty() {
            return Err(RecordError::MissingSubject);
        }
        if self.version_id < 1 {
            return Err(RecordError::InvalidVersion(self.version_id));
        }
        let mut seen = HashSet::new();
        for fact in &self.facts {
            let identity = fact.identity();
            if !seen.insert(identity.clone()) {
                return Err(RecordError::DuplicateIdentity(identity));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::FactKind;

    fn condition(id: &str, status: &str) -> Fact {
        let mut fact = Fact::new(FactKind::Condition);
        fact.id = Some(id.to_string());
        fact.status = Some(status.to_string());
        fact
    }

    #[test]
    fn upsert_replaces_matching_identity() {
        let mut record = Record::new("patient-1");
        record.upsert(condition("c1", "active"));
        record.upsert(condition("c1", "resolved"));
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.facts[0].status.as_deref(), Some("resolved"));
    }

    #[test]
    fn remove_reports_absence() {
        let mut record = Record::new("patient-1");
        record.upsert(condition("c1", "active"));
        let identity = condition("c1", "active").identity();
        assert!(record.remove(&identity));
        assert!(!record.remove(&identity));
    }

    #[test]
    fn validate_rejects_duplicate_identities() {
        let mut record = Record::new("patient-1");
        record.facts.push(condition("c1", "active"));
        record.facts.push(condition("c1", "active"));
        assert!(matches!(
            record.validate_structure(),
            Err(RecordError::DuplicateIdentity(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_version() {
        let mut record = Record::new("patient-1");
        record.version_id = 0;
        assert!(matches!(
            record.validate_structure(),
            Err(RecordError::InvalidVersion(0))
        ));
    }

    #[test]
    fn record_serde_round_trip() {
        let mut record = Record::new("patient-1");
        record.upsert(condition("c1", "active"));
        let json = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
