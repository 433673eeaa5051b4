//! Conflict value types and aggregation

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

use chronik_models::FactKind;

/// How severe a detected disagreement is.
///
/// Ordered: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// The kind of semantic disagreement detected between two facts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ValueMismatch,
    UnitMismatch,
    TemporalConflict,
    StatusConflict,
    DosageConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ValueMismatch => "value_mismatch",
            ConflictType::UnitMismatch => "unit_mismatch",
            ConflictType::TemporalConflict => "temporal_conflict",
            ConflictType::StatusConflict => "status_conflict",
            ConflictType::DosageConflict => "dosage_conflict",
        }
    }
}

/// Resolution policy identifier. The closed set of policies the resolver
/// implements; selection precedence lives in
/// [`ResolutionConfig`](crate::config::ResolutionConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    NewestWins,
    PreserveBoth,
    ConfidenceBased,
    ManualReview,
}

/// What the chosen strategy decided to do with the conflicting pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    KeepNew,
    KeepExisting,
    PreserveBoth,
    ManualReview,
}

/// Queue priority for conflicts routed to human review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Review routing attached to a resolution that needs (or may need) a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewMetadata {
    pub priority: ReviewPriority,
    #[serde(default)]
    pub clinical_review_required: bool,
    #[serde(default)]
    pub escalation_required: bool,
    #[serde(default)]
    pub safety_issue: bool,
}

/// The outcome a strategy produced for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: ResolutionAction,

    /// The value the record should carry. `None` when the conflict was
    /// routed to manual review.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_value: Option<JsonValue>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewMetadata>,

    /// Set when a strategy could not decide and fell back to another
    /// (confidence ties fall back to newest-wins).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<StrategyKind>,

    /// Whether the disagreement is considered corrected in the record.
    /// Manual-review resolutions leave this false.
    #[serde(default)]
    pub corrected: bool,
}

/// One detected disagreement between an incoming and an existing fact.
///
/// Created by the detector; the resolver fills in `resolution_strategy` and
/// `resolution` in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictDetail {
    pub conflict_type: ConflictType,
    pub fact_kind: FactKind,
    pub field_name: String,
    pub existing_value: JsonValue,
    pub new_value: JsonValue,
    pub severity: Severity,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_strategy: Option<StrategyKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,

    /// Populated when the chosen strategy itself failed for this conflict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_error: Option<String>,
}

impl ConflictDetail {
    pub fn new(
        conflict_type: ConflictType,
        fact_kind: FactKind,
        field_name: impl Into<String>,
        existing_value: JsonValue,
        new_value: JsonValue,
        severity: Severity,
    ) -> Self {
        Self {
            conflict_type,
            fact_kind,
            field_name: field_name.into(),
            existing_value,
            new_value,
            severity,
            resolution_strategy: None,
            resolution: None,
            resolution_error: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution.as_ref().is_some_and(|r| r.corrected)
    }
}

/// Aggregate of all conflicts seen during one merge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictResult {
    pub details: Vec<ConflictDetail>,
    pub by_type: HashMap<String, usize>,
    pub by_kind: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
}

impl ConflictResult {
    pub fn push(&mut self, detail: ConflictDetail) {
        *self
            .by_type
            .entry(detail.conflict_type.as_str().to_string())
            .or_default() += 1;
        *self
            .by_kind
            .entry(detail.fact_kind.to_string())
            .or_default() += 1;
        *self
            .by_severity
            .entry(severity_label(detail.severity).to_string())
            .or_default() += 1;
        self.details.push(detail);
    }

    pub fn extend(&mut self, details: impl IntoIterator<Item = ConflictDetail>) {
        for detail in details {
            self.push(detail);
        }
    }

    pub fn total(&self) -> usize {
        self.details.len()
    }

    pub fn resolved_count(&self) -> usize {
        self.details.iter().filter(|d| d.is_resolved()).count()
    }

    /// True until every critical conflict has been marked corrected.
    pub fn has_critical_conflicts(&self) -> bool {
        self.details
            .iter()
            .any(|d| d.severity == Severity::Critical && !d.is_resolved())
    }
}

fn severity_label(severity: Severity) -> &'static str {
    match severity {
        Severity::Low => "low",
        Severity::Medium => "medium",
        Severity::High => "high",
        Severity::Critical => "critical",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detail(severity: Severity) -> ConflictDetail {
        ConflictDetail::new(
            ConflictType::ValueMismatch,
            FactKind::Observation,
            "value",
            json!(95.0),
            json!(120.0),
            severity,
        )
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn counts_accumulate_by_dimension() {
        let mut result = ConflictResult::default();
        result.push(detail(Severity::High));
        result.push(detail(Severity::Critical));
        assert_eq!(result.by_type.get("value_mismatch"), Some(&2));
        assert_eq!(result.by_kind.get("Observation"), Some(&2));
        assert_eq!(result.by_severity.get("critical"), Some(&1));
    }

    #[test]
    fn critical_flag_clears_when_corrected() {
        let mut result = ConflictResult::default();
        result.push(detail(Severity::Critical));
        assert!(result.has_critical_conflicts());

        result.details[0].resolution = Some(Resolution {
            action: ResolutionAction::KeepNew,
            resolved_value: Some(json!(120.0)),
            review: None,
            fallback_used: None,
            corrected: true,
        });
        assert!(!result.has_critical_conflicts());
    }
}
