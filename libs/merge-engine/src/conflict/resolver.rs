//! Policy-driven conflict resolution
//!
//! Four policies, selected per conflict through the precedence configured in
//! [`ResolutionConfig`](crate::config::ResolutionConfig). Each conflict is
//! resolved independently: a failing strategy marks that one conflict
//! unresolved and processing continues for the rest.

use serde_json::json;

use crate::config::ResolutionConfig;
use crate::conflict::types::{
    ConflictDetail, ConflictType, Resolution, ResolutionAction, ReviewMetadata, ReviewPriority,
    Severity, StrategyKind,
};
use crate::{Error, Result};
use chronik_models::Fact;

/// Outcome of resolving one batch of conflicts between a fact pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub overall_action: OverallAction,
    pub resolved: usize,
    pub unresolved: usize,
    pub details: Vec<ConflictDetail>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallAction {
    NoConflicts,
    Resolved,
    CriticalConflictsRequireReview,
}

pub struct ConflictResolver {
    config: ResolutionConfig,
}

impl ConflictResolver {
    pub fn new(config: ResolutionConfig) -> Self {
        Self { config }
    }

    /// Resolve each conflict independently and return the aggregate.
    ///
    /// Strategy errors are captured on the individual detail; they never
    /// abort the batch.
    pub fn resolve(
        &self,
        conflicts: Vec<ConflictDetail>,
        new: &Fact,
        existing: &Fact,
    ) -> ResolutionOutcome {
        if conflicts.is_empty() {
            return ResolutionOutcome {
                overall_action: OverallAction::NoConflicts,
                resolved: 0,
                unresolved: 0,
                details: Vec::new(),
            };
        }

        let mut details = conflicts;
        let mut resolved = 0;
        let mut unresolved = 0;

        for detail in &mut details {
            let strategy =
                self.config
                    .strategy_for(&detail.conflict_type, &detail.fact_kind, detail.severity);
            detail.resolution_strategy = Some(strategy);

            match apply_strategy(strategy, detail, new, existing) {
                Ok(resolution) => {
                    if resolution.corrected {
                        resolved += 1;
                    } else {
                        unresolved += 1;
                    }
                    detail.resolution = Some(resolution);
                }
                Err(e) => {
                    tracing::warn!(
                        conflict_type = detail.conflict_type.as_str(),
                        "conflict resolution strategy failed: {}",
                        e
                    );
                    detail.resolution_error = Some(e.to_string());
                    unresolved += 1;
                }
            }
        }

        let has_unresolved_critical = details
            .iter()
            .any(|d| d.severity == Severity::Critical && !d.is_resolved());

        ResolutionOutcome {
            overall_action: if has_unresolved_critical {
                OverallAction::CriticalConflictsRequireReview
            } else {
                OverallAction::Resolved
            },
            resolved,
            unresolved,
            details,
        }
    }
}

fn apply_strategy(
    strategy: StrategyKind,
    detail: &ConflictDetail,
    new: &Fact,
    existing: &Fact,
) -> Result<Resolution> {
    match strategy {
        StrategyKind::NewestWins => Ok(newest_wins(detail, new, existing, None)),
        StrategyKind::PreserveBoth => Ok(preserve_both(detail, new, existing)),
        StrategyKind::ConfidenceBased => confidence_based(detail, new, existing),
        StrategyKind::ManualReview => Ok(manual_review(detail)),
    }
}

/// Keep the side with the later-or-equal clinical timestamp. With no
/// timestamp on either side, the new fact wins.
fn newest_wins(
    detail: &ConflictDetail,
    new: &Fact,
    existing: &Fact,
    fallback_used: Option<StrategyKind>,
) -> Resolution {
    let keep_new = match (new.clinical_timestamp(), existing.clinical_timestamp()) {
        (Some(n), Some(e)) => n >= e,
        (Some(_), None) => true,
        (None, Some(_)) => false,
        (None, None) => true,
    };

    let (action, resolved_value) = if keep_new {
        (ResolutionAction::KeepNew, detail.new_value.clone())
    } else {
        (ResolutionAction::KeepExisting, detail.existing_value.clone())
    };

    Resolution {
        action,
        resolved_value: Some(resolved_value),
        review: None,
        fallback_used,
        corrected: true,
    }
}

/// Keep both values as an ordered temporal pair; attach review metadata
/// whose weight scales with severity.
fn preserve_both(detail: &ConflictDetail, new: &Fact, existing: &Fact) -> Resolution {
    // Existing first unless the new fact is clinically earlier.
    let new_first = match (new.clinical_timestamp(), existing.clinical_timestamp()) {
        (Some(n), Some(e)) => n < e,
        _ => false,
    };
    let pair = if new_first {
        json!([detail.new_value, detail.existing_value])
    } else {
        json!([detail.existing_value, detail.new_value])
    };

    let review = match detail.severity {
        Severity::Critical => Some(ReviewMetadata {
            priority: ReviewPriority::High,
            clinical_review_required: true,
            escalation_required: false,
            safety_issue: true,
        }),
        Severity::High => Some(ReviewMetadata {
            priority: ReviewPriority::Medium,
            clinical_review_required: true,
            escalation_required: false,
            safety_issue: false,
        }),
        _ => None,
    };

    Resolution {
        action: ResolutionAction::PreserveBoth,
        resolved_value: Some(pair),
        review,
        fallback_used: None,
        corrected: true,
    }
}

/// Higher extraction confidence wins; ties and missing scores fall back to
/// newest-wins, with the fallback recorded on the resolution.
fn confidence_based(detail: &ConflictDetail, new: &Fact, existing: &Fact) -> Result<Resolution> {
    let scores = (new.confidence, existing.confidence);
    if let (Some(n), Some(e)) = scores {
        if !n.is_finite() || !e.is_finite() {
            return Err(Error::ConflictResolution(
                "confidence score is not a finite number".to_string(),
            ));
        }
        if n > e {
            return Ok(Resolution {
                action: ResolutionAction::KeepNew,
                resolved_value: Some(detail.new_value.clone()),
                review: None,
                fallback_used: None,
                corrected: true,
            });
        }
        if e > n {
            return Ok(Resolution {
                action: ResolutionAction::KeepExisting,
                resolved_value: Some(detail.existing_value.clone()),
                review: None,
                fallback_used: None,
                corrected: true,
            });
        }
    }

    Ok(newest_wins(
        detail,
        new,
        existing,
        Some(StrategyKind::NewestWins),
    ))
}

/// Never resolves automatically: routes the conflict to a human with a
/// priority derived from severity. Value and dosage mismatches are floored
/// at medium priority regardless of severity.
fn manual_review(detail: &ConflictDetail) -> Resolution {
    let mut priority = match detail.severity {
        Severity::Critical => ReviewPriority::Urgent,
        Severity::High => ReviewPriority::High,
        _ => ReviewPriority::Low,
    };

    if matches!(
        detail.conflict_type,
        ConflictType::ValueMismatch | ConflictType::DosageConflict
    ) && priority < ReviewPriority::Medium
    {
        priority = ReviewPriority::Medium;
    }

    let critical = detail.severity == Severity::Critical;

    Resolution {
        action: ResolutionAction::ManualReview,
        resolved_value: None,
        review: Some(ReviewMetadata {
            priority,
            clinical_review_required: true,
            escalation_required: critical,
            safety_issue: critical,
        }),
        fallback_used: None,
        corrected: false,
    }
}
