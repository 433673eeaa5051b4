//! Merge orchestration
//!
//! One `merge` call drives the whole pipeline: validate the candidate
//! facts, stamp batch provenance, deduplicate, conflict-check each survivor
//! against the current record, resolve conflicts by policy, stage the net
//! add/update operations, and commit them atomically under the subject's
//! lock. The returned [`MergeResult`] carries everything the caller needs
//! to distinguish hard failure from partial success.

mod result;

pub use result::{KindBreakdown, MergeResult, MergeState, ValidationIssue};

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::config::MergeConfig;
use crate::conflict::{
    ConflictDetector, ConflictResolver, ResolutionAction, Severity,
};
use crate::dedup::Deduplicator;
use crate::store::{KeyValueStore, RecordStore};
use crate::tx::{ChangeOperation, TransactionManager};
use crate::{Error, Result};
use chronik_models::{Fact, Record};

/// Per-batch metadata handed in by the extraction boundary.
#[derive(Debug, Clone)]
pub struct MergeContext {
    pub source_document_id: Option<String>,
    pub source_system: Option<String>,
    /// Batch-level extraction confidence, applied to facts that carry none
    /// of their own.
    pub confidence: Option<f64>,
    /// Acting user, for audit attribution.
    pub user: String,
    pub operation_id: Uuid,
}

impl MergeContext {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            source_document_id: None,
            source_system: None,
            confidence: None,
            user: user.into(),
            operation_id: Uuid::new_v4(),
        }
    }
}

pub struct MergeEngine {
    records: Arc<dyn RecordStore>,
    tx: TransactionManager,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    deduplicator: Deduplicator,
    /// Facts of the same code pair up only within this window; beyond it
    /// they are separate measurements.
    pairing_window: chrono::Duration,
}

impl MergeEngine {
    pub fn new(
        records: Arc<dyn RecordStore>,
        kv: Arc<dyn KeyValueStore>,
        audit: Arc<dyn AuditSink>,
        config: MergeConfig,
    ) -> Self {
        let tx = TransactionManager::new(
            records.clone(),
            kv,
            audit,
            config.transaction.clone(),
        );
        let pairing_window = chrono::Duration::seconds(config.conflict.temporal_tolerance_seconds);
        Self {
            records,
            tx,
            detector: ConflictDetector::new(config.conflict.clone()),
            resolver: ConflictResolver::new(config.resolution.clone()),
            deduplicator: Deduplicator::new(config.dedup.clone()),
            pairing_window,
        }
    }

    /// The underlying transaction manager, for snapshot restore and the
    /// background staging sweep.
    pub fn transactions(&self) -> &TransactionManager {
        &self.tx
    }

    /// Merge a batch of candidate facts into the subject's record.
    ///
    /// Never returns `Err`: every failure mode lands in the result object
    /// with `success == false` and a terminal state explaining how far the
    /// operation got.
    pub async fn merge(
        &self,
        subject_id: &str,
        facts: Vec<Fact>,
        context: &MergeContext,
    ) -> MergeResult {
        let mut result = MergeResult::begin(subject_id);
        result.candidates = facts.len();

        result.state = MergeState::Validating;
        if let Err(e) = self.validate_input(subject_id, &facts, context, &mut result) {
            result.error_message = Some(e.to_string());
            result.finish(MergeState::Failed);
            return result;
        }

        result.state = MergeState::Converting;
        let facts = stamp_provenance(facts, context);

        let record = match self.load_record(subject_id).await {
            Ok(record) => record,
            Err(e) => {
                result.error_message = Some(e.to_string());
                result.finish(MergeState::Failed);
                return result;
            }
        };

        result.state = MergeState::Deduplicating;
        let survivors = match self.deduplicator.deduplicate(facts.clone()) {
            Ok(outcome) => {
                result.duplicates_removed = outcome.result.facts_removed;
                result.dedup_result = Some(outcome.result);
                outcome.survivors
            }
            Err(e) => {
                // Deduplication never aborts an otherwise-valid merge; the
                // batch proceeds uncollapsed.
                tracing::warn!(subject_id, "deduplication failed, continuing: {}", e);
                result.warnings.push(format!("deduplication skipped: {e}"));
                facts
            }
        };

        result.state = MergeState::ConflictChecking;
        let mut staged: Vec<(ChangeOperation, Fact)> = Vec::new();
        for fact in survivors {
            let kind_label = fact.kind.to_string();
            match self.plan_fact(&record, fact, &mut result) {
                PlannedAction::Add(fact) => {
                    result.added += 1;
                    result.record_kind(&kind_label, |k| k.added += 1);
                    staged.push((ChangeOperation::Add, fact));
                }
                PlannedAction::Update(fact) => {
                    result.updated += 1;
                    result.record_kind(&kind_label, |k| k.updated += 1);
                    staged.push((ChangeOperation::Update, fact));
                }
                PlannedAction::Skip => {
                    result.skipped += 1;
                    result.record_kind(&kind_label, |k| k.skipped += 1);
                }
            }
        }

        self.finish_with_staged(result, staged, context).await
    }

    async fn finish_with_staged(
        &self,
        mut result: MergeResult,
        staged: Vec<(ChangeOperation, Fact)>,
        context: &MergeContext,
    ) -> MergeResult {
        if staged.is_empty() {
            // Nothing to persist; the record is already in the target state.
            result.finish(MergeState::Committed);
            return result;
        }

        result.state = MergeState::Staging;
        let subject_id = result.subject_id.clone();
        let metadata = change_metadata(context);

        result.state = MergeState::Committing;
        let committed = self
            .tx
            .with_transaction(
                &subject_id,
                context.operation_id,
                &context.user,
                true,
                move |area| {
                    for (operation, fact) in staged {
                        area.add_change(operation, fact, metadata.clone());
                    }
                    Ok(())
                },
            )
            .await;

        match committed {
            Ok((_, transaction)) => {
                result.transaction = transaction;
                result.finish(MergeState::Committed);
            }
            Err(e) => {
                if e.is_retryable() {
                    result.warnings.push(
                        "subject is locked by another operation; retry after it completes"
                            .to_string(),
                    );
                }
                result.error_message = Some(e.to_string());
                // Staged changes were discarded; persisted state unchanged.
                result.finish(MergeState::RolledBack);
            }
        }
        result
    }

    /// Two facts belong to the same measurement context when their clinical
    /// timestamps fall within the pairing window. Facts without timestamps
    /// on both sides cannot be separated temporally and count as matching.
    fn same_measurement_context(&self, a: &Fact, b: &Fact) -> bool {
        match (a.clinical_timestamp(), b.clinical_timestamp()) {
            (Some(ta), Some(tb)) => (ta - tb).abs() <= self.pairing_window,
            _ => true,
        }
    }

    fn validate_input(
        &self,
        subject_id: &str,
        facts: &[Fact],
        context: &MergeContext,
        result: &mut MergeResult,
    ) -> Result<()> {
        if subject_id.is_empty() {
            return Err(Error::Validation("subject id must not be empty".to_string()));
        }
        if context.user.is_empty() {
            return Err(Error::Validation(
                "acting user must not be empty".to_string(),
            ));
        }

        for (index, fact) in facts.iter().enumerate() {
            if fact.id.as_deref() == Some("") {
                return Err(Error::Validation(format!(
                    "fact {index} has an empty id"
                )));
            }
            if let Some(confidence) = fact.confidence {
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(Error::Validation(format!(
                        "fact {index} has confidence {confidence} outside [0,1]"
                    )));
                }
            }
            if fact.code.is_none()
                && fact.value.is_none()
                && fact.status.is_none()
                && fact.dosage.is_none()
            {
                result.validation_issues.push(ValidationIssue {
                    severity: Severity::Medium,
                    message: format!("fact {index} has no comparable clinical content"),
                });
            }
        }
        Ok(())
    }

    async fn load_record(&self, subject_id: &str) -> Result<Record> {
        match self.records.get(subject_id).await? {
            Some(record) => {
                record.validate_structure()?;
                Ok(record)
            }
            None => Ok(Record::new(subject_id)),
        }
    }

    /// Decide what one surviving fact does to the record: add it, update the
    /// existing fact it matched, or skip it.
    ///
    /// Pairing is by identity first, then by code concept — but a code match
    /// outside the pairing window is a separate measurement, not a
    /// candidate for comparison.
    fn plan_fact(&self, record: &Record, fact: Fact, result: &mut MergeResult) -> PlannedAction {
        let existing = record.find(&fact.identity()).or_else(|| {
            record.facts_of_kind(&fact.kind).find(|candidate| {
                let same_code = match (&candidate.code, &fact.code) {
                    (Some(a), Some(b)) => a.same_concept(b),
                    _ => false,
                };
                same_code && self.same_measurement_context(candidate, &fact)
            })
        });

        let Some(existing) = existing else {
            return PlannedAction::Add(fact);
        };

        // A structural duplicate of something already on record adds nothing.
        if self.detector.check_duplicate(&fact, existing) {
            return PlannedAction::Skip;
        }

        let conflicts = self.detector.detect(&fact, existing);
        if conflicts.is_empty() {
            // Same entity, newer information, no disagreement: replace.
            let mut merged = fact;
            merged.id = existing.id.clone().or(merged.id);
            return PlannedAction::Update(merged);
        }

        let outcome = self.resolver.resolve(conflicts, &fact, existing);
        result.conflicts_detected += outcome.details.len();
        result.conflicts_resolved += outcome.resolved;

        let mut merged = existing.clone();
        let mut changed = false;
        let mut pending_review = false;

        for detail in &outcome.details {
            match detail.resolution.as_ref() {
                Some(resolution) => match resolution.action {
                    ResolutionAction::KeepNew => {
                        apply_field(&mut merged, &detail.field_name, &fact);
                        changed = true;
                    }
                    ResolutionAction::PreserveBoth => {
                        apply_field(&mut merged, &detail.field_name, &fact);
                        if let Some(pair) = &resolution.resolved_value {
                            merged.extensions.insert(
                                format!("{}History", detail.field_name),
                                pair.clone(),
                            );
                        }
                        changed = true;
                    }
                    ResolutionAction::KeepExisting => {}
                    ResolutionAction::ManualReview => pending_review = true,
                },
                None => pending_review = true,
            }
        }

        for detail in outcome.details {
            result.conflict_result.push(detail);
        }

        if pending_review {
            merged
                .extensions
                .insert("reviewPending".to_string(), json!(true));
            changed = true;
        }

        if changed {
            // The new fact's origin is worth keeping on the updated entry.
            if merged.source_document_id.is_none() {
                merged.source_document_id = fact.source_document_id;
            }
            PlannedAction::Update(merged)
        } else {
            PlannedAction::Skip
        }
    }
}

enum PlannedAction {
    Add(Fact),
    Update(Fact),
    Skip,
}

fn stamp_provenance(facts: Vec<Fact>, context: &MergeContext) -> Vec<Fact> {
    facts
        .into_iter()
        .map(|mut fact| {
            if fact.source_document_id.is_none() {
                fact.source_document_id = context.source_document_id.clone();
            }
            if fact.confidence.is_none() {
                fact.confidence = context.confidence;
            }
            fact
        })
        .collect()
}

fn change_metadata(context: &MergeContext) -> HashMap<String, serde_json::Value> {
    let mut metadata = HashMap::new();
    if let Some(document) = &context.source_document_id {
        metadata.insert("sourceDocumentId".to_string(), json!(document));
    }
    if let Some(system) = &context.source_system {
        metadata.insert("sourceSystem".to_string(), json!(system));
    }
    metadata
}

fn apply_field(merged: &mut Fact, field_name: &str, new: &Fact) {
    match field_name {
        "value" => merged.value = new.value.clone(),
        "unit" => {
            if let (Some(target), Some(source)) = (merged.value.as_mut(), new.value.as_ref()) {
                target.unit = source.unit.clone();
            }
        }
        "status" => merged.status = new.status.clone(),
        "effective" => merged.effective = new.effective,
        "dosage" => merged.dosage = new.dosage.clone(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::RecordingAuditSink;
    use crate::conflict::StrategyKind;
    use crate::store::{InMemoryKeyValueStore, InMemoryRecordStore};
    use chronik_models::{Coding, FactKind, Quantity};
    use chrono::{TimeZone, Utc};

    fn engine_with(
        config: MergeConfig,
    ) -> (MergeEngine, Arc<InMemoryRecordStore>, RecordingAuditSink) {
        let records = Arc::new(InMemoryRecordStore::new());
        let audit = RecordingAuditSink::new();
        let engine = MergeEngine::new(
            records.clone(),
            Arc::new(InMemoryKeyValueStore::new()),
            Arc::new(audit.clone()),
            config,
        );
        (engine, records, audit)
    }

    fn engine() -> (MergeEngine, Arc<InMemoryRecordStore>, RecordingAuditSink) {
        engine_with(MergeConfig::default())
    }

    fn observation(id: &str, value: f64, hour: u32) -> Fact {
        let mut fact = Fact::new(FactKind::Observation);
        fact.id = Some(id.to_string());
        fact.code = Some(Coding {
            system: Some("http://loinc.org".to_string()),
            code: Some("8480-6".to_string()),
            display: None,
        });
        fact.value = Some(Quantity {
            value,
            unit: Some("mm[Hg]".to_string()),
        });
        fact.effective = Some(Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap());
        fact
    }

    fn condition(id: &str, status: &str) -> Fact {
        let mut fact = Fact::new(FactKind::Condition);
        fact.id = Some(id.to_string());
        fact.code = Some(Coding {
            system: Some("http://snomed.info/sct".to_string()),
            code: Some("44054006".to_string()),
            display: None,
        });
        fact.status = Some(status.to_string());
        fact
    }

    #[tokio::test]
    async fn merge_into_empty_record_adds_everything() {
        let (engine, records, _) = engine();
        let context = MergeContext::new("merge-worker");

        let result = engine
            .merge(
                "patient-1",
                vec![observation("o1", 120.0, 8), condition("c1", "active")],
                &context,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.state, MergeState::Committed);
        assert_eq!(result.added, 2);
        assert_eq!(result.by_kind["Observation"].added, 1);

        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts.len(), 2);
        assert_eq!(record.version_id, 2);
    }

    #[tokio::test]
    async fn duplicate_of_record_is_skipped_without_version_bump() {
        let (engine, records, _) = engine();
        let context = MergeContext::new("merge-worker");

        engine
            .merge("patient-1", vec![observation("o1", 120.0, 8)], &context)
            .await;
        let version = records.get("patient-1").await.unwrap().unwrap().version_id;

        let mut duplicate = observation("o9", 120.0, 8);
        duplicate.source_document_id = Some("another-doc".to_string());
        let result = engine
            .merge("patient-1", vec![duplicate], &MergeContext::new("merge-worker"))
            .await;

        assert!(result.success);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.added, 0);
        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.version_id, version);
    }

    #[tokio::test]
    async fn batch_duplicates_collapse_before_staging() {
        let (engine, records, _) = engine();
        let result = engine
            .merge(
                "patient-1",
                vec![observation("o1", 120.0, 8), observation("o2", 120.0, 8)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        assert_eq!(result.duplicates_removed, 1);
        assert_eq!(result.added, 1);
        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.facts[0].merged_from, vec!["o2"]);
    }

    #[tokio::test]
    async fn conflicting_value_resolves_newest_wins() {
        let (engine, records, _) = engine();
        engine
            .merge(
                "patient-1",
                vec![observation("o1", 95.0, 8)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        // Later measurement with a conflicting value: newest wins by default.
        let result = engine
            .merge(
                "patient-1",
                vec![observation("o1", 120.0, 9)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        assert!(result.success);
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 1);
        assert_eq!(result.updated, 1);

        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts[0].value.as_ref().unwrap().value, 120.0);
    }

    #[tokio::test]
    async fn manual_review_leaves_existing_value_and_flags_fact() {
        let mut config = MergeConfig::default();
        config.resolution.default_strategy = StrategyKind::ManualReview;
        let (engine, records, _) = engine_with(config);

        engine
            .merge(
                "patient-1",
                vec![condition("c1", "active")],
                &MergeContext::new("merge-worker"),
            )
            .await;
        let mut newer = condition("c1", "resolved");
        newer.effective = Some(Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap());

        let result = engine
            .merge("patient-1", vec![newer], &MergeContext::new("merge-worker"))
            .await;

        assert!(result.success);
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.conflicts_resolved, 0);

        let record = records.get("patient-1").await.unwrap().unwrap();
        let fact = &record.facts[0];
        assert_eq!(fact.status.as_deref(), Some("active"));
        assert_eq!(fact.extensions.get("reviewPending"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn empty_subject_fails_before_any_mutation() {
        let (engine, records, _) = engine();
        let result = engine
            .merge("", vec![condition("c1", "active")], &MergeContext::new("u"))
            .await;

        assert!(!result.success);
        assert_eq!(result.state, MergeState::Failed);
        assert!(result.error_message.is_some());
        assert!(records.get("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_batch_commits_nothing_and_succeeds() {
        let (engine, records, audit) = engine();
        let result = engine
            .merge("patient-1", Vec::new(), &MergeContext::new("merge-worker"))
            .await;

        assert!(result.success);
        assert_eq!(result.candidates, 0);
        assert!(records.get("patient-1").await.unwrap().is_none());
        assert!(audit.events().await.is_empty());
    }

    #[tokio::test]
    async fn batch_confidence_is_stamped_onto_facts() {
        let (engine, records, _) = engine();
        let mut context = MergeContext::new("merge-worker");
        context.source_document_id = Some("doc-42".to_string());
        context.confidence = Some(0.85);

        engine
            .merge("patient-1", vec![condition("c1", "active")], &context)
            .await;

        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts[0].source_document_id.as_deref(), Some("doc-42"));
        assert_eq!(record.facts[0].confidence, Some(0.85));
    }

    #[tokio::test]
    async fn preserve_both_keeps_pair_in_extensions() {
        let mut config = MergeConfig::default();
        config.resolution.default_strategy = StrategyKind::PreserveBoth;
        let (engine, records, _) = engine_with(config);

        engine
            .merge(
                "patient-1",
                vec![observation("o1", 95.0, 8)],
                &MergeContext::new("merge-worker"),
            )
            .await;
        let result = engine
            .merge(
                "patient-1",
                vec![observation("o1", 130.0, 9)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        assert!(result.success);
        let record = records.get("patient-1").await.unwrap().unwrap();
        let fact = &record.facts[0];
        assert_eq!(fact.value.as_ref().unwrap().value, 130.0);
        assert_eq!(
            fact.extensions.get("valueHistory"),
            Some(&json!([95.0, 130.0]))
        );
    }

    #[tokio::test]
    async fn merge_survives_held_lock_with_rolled_back_state() {
        let (engine, records, _) = engine();
        engine
            .transactions()
            .locks()
            .acquire("patient-1", Uuid::new_v4())
            .await
            .unwrap();

        let result = engine
            .merge(
                "patient-1",
                vec![condition("c1", "active")],
                &MergeContext::new("merge-worker"),
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.state, MergeState::RolledBack);
        // A lock failure is retryable, and the result says so.
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("retry after it completes")));
        assert!(records.get("patient-1").await.unwrap().is_none());
        assert_eq!(engine.transactions().active_staging_count().await, 0);
    }

    #[tokio::test]
    async fn same_code_reading_outside_window_is_added_not_merged() {
        let (engine, records, _) = engine();
        engine
            .merge(
                "patient-1",
                vec![observation("o1", 95.0, 8)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        // Same code, months later, different id: a new measurement.
        let mut later = observation("o2", 120.0, 8);
        later.effective = Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap());
        let result = engine
            .merge("patient-1", vec![later], &MergeContext::new("merge-worker"))
            .await;

        assert!(result.success);
        assert_eq!(result.added, 1);
        assert_eq!(result.conflicts_detected, 0);

        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts.len(), 2);
        assert_eq!(record.facts[0].value.as_ref().unwrap().value, 95.0);
    }

    #[tokio::test]
    async fn same_code_reading_within_window_pairs_without_id_match() {
        let (engine, records, _) = engine();
        engine
            .merge(
                "patient-1",
                vec![observation("o1", 95.0, 8)],
                &MergeContext::new("merge-worker"),
            )
            .await;

        let mut close = observation("o2", 120.0, 8);
        close.effective = Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap());
        let result = engine
            .merge("patient-1", vec![close], &MergeContext::new("merge-worker"))
            .await;

        assert!(result.success);
        assert_eq!(result.conflicts_detected, 1);
        assert_eq!(result.updated, 1);

        let record = records.get("patient-1").await.unwrap().unwrap();
        assert_eq!(record.facts.len(), 1);
        assert_eq!(record.facts[0].id.as_deref(), Some("o1"));
        assert_eq!(record.facts[0].value.as_ref().unwrap().value, 120.0);
    }
}
