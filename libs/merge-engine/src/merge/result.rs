//! Merge outcome accumulation and projections

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

use crate::conflict::{ConflictResult, Severity};
use crate::dedup::DeduplicationResult;
use crate::tx::TransactionResult;

/// Lifecycle of one merge operation, declared in traversal order:
/// duplicates collapse before the survivors are conflict-checked. Terminal
/// states are mutually exclusive: `Committed` persisted, `RolledBack` undid
/// without touching persisted state, `Failed` could not even stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeState {
    Pending,
    Validating,
    Converting,
    Deduplicating,
    ConflictChecking,
    Staging,
    Committing,
    Committed,
    RolledBack,
    Failed,
}

impl MergeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MergeState::Committed | MergeState::RolledBack | MergeState::Failed
        )
    }
}

/// An input-quality finding from the validation stage. Deducted from the
/// merge's validation score by severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn deduction(&self) -> f64 {
        match self.severity {
            Severity::Critical => 25.0,
            Severity::High => 10.0,
            Severity::Medium => 5.0,
            Severity::Low => 2.0,
        }
    }
}

/// Per-kind add/update/skip breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindBreakdown {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
}

/// Structured outcome of one merge, returned to callers.
///
/// Callers distinguish hard failure (`success == false`, nothing persisted)
/// from partial success (persisted, but conflicts queued for manual review)
/// through these fields. Serializes round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub subject_id: String,
    pub state: MergeState,
    pub success: bool,

    /// Facts handed to the merge before deduplication.
    pub candidates: usize,
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,

    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    pub duplicates_removed: usize,

    pub validation_issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    pub by_kind: HashMap<String, KindBreakdown>,
    pub conflict_result: ConflictResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_result: Option<DeduplicationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionResult>,

    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: u64,
}

impl MergeResult {
    pub fn begin(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            state: MergeState::Pending,
            success: false,
            candidates: 0,
            added: 0,
            updated: 0,
            skipped: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            duplicates_removed: 0,
            validation_issues: Vec::new(),
            warnings: Vec::new(),
            error_message: None,
            by_kind: HashMap::new(),
            conflict_result: ConflictResult::default(),
            dedup_result: None,
            transaction: None,
            started_at: Utc::now(),
            completed_at: None,
            processing_time_ms: 0,
        }
    }

    pub(crate) fn finish(&mut self, state: MergeState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        self.success = state == MergeState::Committed;
        let completed = Utc::now();
        self.processing_time_ms = (completed - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(completed);
    }

    pub(crate) fn record_kind(&mut self, kind: &str, f: impl FnOnce(&mut KindBreakdown)) {
        f(self.by_kind.entry(kind.to_string()).or_default());
    }

    /// Share of candidate facts that were handled (added, updated, or
    /// deliberately skipped), as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.candidates == 0 {
            return 100.0;
        }
        let handled = self.added + self.updated + self.skipped + self.duplicates_removed;
        100.0 * handled.min(self.candidates) as f64 / self.candidates as f64
    }

    /// Share of detected conflicts that were resolved, as a percentage.
    pub fn conflict_resolution_rate(&self) -> f64 {
        if self.conflicts_detected == 0 {
            return 100.0;
        }
        100.0 * self.conflicts_resolved as f64 / self.conflicts_detected as f64
    }

    /// 100 minus weighted deductions per validation issue, floored at 0.
    pub fn validation_score(&self) -> f64 {
        let deductions: f64 = self.validation_issues.iter().map(|i| i.deduction()).sum();
        (100.0 - deductions).max(0.0)
    }

    /// Multi-section human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Merge for subject {} — {:?} ({})\n",
            self.subject_id,
            self.state,
            if self.success { "success" } else { "failure" }
        ));

        out.push_str("\n== Facts ==\n");
        out.push_str(&format!(
            "candidates: {}, added: {}, updated: {}, skipped: {}, duplicates removed: {}\n",
            self.candidates, self.added, self.updated, self.skipped, self.duplicates_removed
        ));
        let mut kinds: Vec<_> = self.by_kind.iter().collect();
        kinds.sort_by(|a, b| a.0.cmp(b.0));
        for (kind, breakdown) in kinds {
            out.push_str(&format!(
                "  {kind}: +{} ~{} ={}\n",
                breakdown.added, breakdown.updated, breakdown.skipped
            ));
        }

        out.push_str("\n== Conflicts ==\n");
        out.push_str(&format!(
            "detected: {}, resolved: {} ({:.1}%)\n",
            self.conflicts_detected,
            self.conflicts_resolved,
            self.conflict_resolution_rate()
        ));
        if self.conflict_result.has_critical_conflicts() {
            out.push_str("critical conflicts pending review\n");
        }

        out.push_str("\n== Quality ==\n");
        out.push_str(&format!(
            "validation score: {:.1}, success rate: {:.1}%\n",
            self.validation_score(),
            self.success_rate()
        ));
        for warning in &self.warnings {
            out.push_str(&format!("warning: {warning}\n"));
        }
        if let Some(error) = &self.error_message {
            out.push_str(&format!("error: {error}\n"));
        }

        if let Some(tx) = &self.transaction {
            out.push_str("\n== Transaction ==\n");
            out.push_str(&format!(
                "version {} -> {}, changes applied: {}\n",
                tx.version_before, tx.version_after, tx.changes_applied
            ));
        }

        out
    }

    /// Nested projection for UI consumption.
    pub fn to_ui_view(&self) -> serde_json::Value {
        json!({
            "subject": self.subject_id,
            "state": self.state,
            "success": self.success,
            "facts": {
                "candidates": self.candidates,
                "added": self.added,
                "updated": self.updated,
                "skipped": self.skipped,
                "duplicatesRemoved": self.duplicates_removed,
                "byKind": self.by_kind,
            },
            "conflicts": {
                "detected": self.conflicts_detected,
                "resolved": self.conflicts_resolved,
                "resolutionRate": self.conflict_resolution_rate(),
                "criticalPending": self.conflict_result.has_critical_conflicts(),
            },
            "quality": {
                "validationScore": self.validation_score(),
                "successRate": self.success_rate(),
                "warnings": self.warnings,
            },
            "timing": {
                "startedAt": self.started_at,
                "completedAt": self.completed_at,
                "processingTimeMs": self.processing_time_ms,
            },
        })
    }
}
