//! Kind-specific conflict detection
//!
//! Compares an incoming fact against the existing fact it matched and emits
//! zero or more typed [`ConflictDetail`]s. Only facts of the same kind are
//! ever compared; callers pair facts by identity or time window before
//! calling in here.

use serde_json::json;

use crate::config::ConflictConfig;
use crate::conflict::types::{ConflictDetail, ConflictType, Severity};
use chronik_models::{Fact, FactKind};

pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Detect semantic disagreements between `new` and `existing`.
    ///
    /// Returns an empty vector when the facts are of different kinds — they
    /// are simply not comparable, which is not itself a conflict.
    pub fn detect(&self, new: &Fact, existing: &Fact) -> Vec<ConflictDetail> {
        if new.kind != existing.kind {
            return Vec::new();
        }

        match new.kind {
            FactKind::Observation => self.detect_observation(new, existing),
            FactKind::Condition => self.detect_condition(new, existing),
            FactKind::MedicationStatement => self.detect_medication(new, existing),
            _ => Vec::new(),
        }
    }

    /// Kind-specific structural equality ignoring identity and bookkeeping
    /// fields. Used upstream to short-circuit true duplicates before any
    /// conflict comparison runs.
    pub fn check_duplicate(&self, a: &Fact, b: &Fact) -> bool {
        if a.kind != b.kind {
            return false;
        }

        let codes_match = match (&a.code, &b.code) {
            (Some(ca), Some(cb)) => ca.same_concept(cb),
            (None, None) => true,
            _ => false,
        };
        if !codes_match {
            return false;
        }

        match a.kind {
            FactKind::Observation => {
                a.value == b.value && a.effective == b.effective && a.status == b.status
            }
            FactKind::Condition => a.status == b.status && a.effective == b.effective,
            FactKind::MedicationStatement => {
                normalize_dosage(a.dosage.as_deref()) == normalize_dosage(b.dosage.as_deref())
                    && a.status == b.status
            }
            _ => a.content_hash() == b.content_hash(),
        }
    }

    fn detect_observation(&self, new: &Fact, existing: &Fact) -> Vec<ConflictDetail> {
        let mut conflicts = Vec::new();

        if let (Some(new_value), Some(existing_value)) = (&new.value, &existing.value) {
            if new_value.value != existing_value.value {
                // Relative difference against the existing (on-record) value.
                let base = existing_value.value.abs();
                let relative = if base > f64::EPSILON {
                    (new_value.value - existing_value.value).abs() / base
                } else {
                    1.0
                };
                let severity = if relative > self.config.value_high_band {
                    Severity::High
                } else if relative >= self.config.value_medium_band {
                    Severity::Medium
                } else {
                    Severity::Low
                };
                conflicts.push(ConflictDetail::new(
                    ConflictType::ValueMismatch,
                    FactKind::Observation,
                    "value",
                    json!(existing_value.value),
                    json!(new_value.value),
                    severity,
                ));
            } else if new_value.unit != existing_value.unit {
                // Same numeric value reported under a different unit.
                conflicts.push(ConflictDetail::new(
                    ConflictType::UnitMismatch,
                    FactKind::Observation,
                    "unit",
                    json!(existing_value.unit),
                    json!(new_value.unit),
                    Severity::High,
                ));
            }
        }

        if let (Some(new_time), Some(existing_time)) = (new.effective, existing.effective) {
            let delta = (new_time - existing_time).num_seconds().abs();
            if delta > self.config.temporal_tolerance_seconds {
                conflicts.push(ConflictDetail::new(
                    ConflictType::TemporalConflict,
                    FactKind::Observation,
                    "effective",
                    json!(existing_time),
                    json!(new_time),
                    Severity::Medium,
                ));
            }
        }

        conflicts
    }

    fn detect_condition(&self, new: &Fact, existing: &Fact) -> Vec<ConflictDetail> {
        let (Some(new_status), Some(existing_status)) = (&new.status, &existing.status) else {
            return Vec::new();
        };
        if new_status == existing_status {
            return Vec::new();
        }

        // active vs resolved is the clinically dangerous disagreement.
        let pair = (existing_status.as_str(), new_status.as_str());
        let severity = if pair == ("active", "resolved") || pair == ("resolved", "active") {
            Severity::High
        } else {
            Severity::Medium
        };

        vec![ConflictDetail::new(
            ConflictType::StatusConflict,
            FactKind::Condition,
            "status",
            json!(existing_status),
            json!(new_status),
            severity,
        )]
    }

    fn detect_medication(&self, new: &Fact, existing: &Fact) -> Vec<ConflictDetail> {
        let new_dosage = normalize_dosage(new.dosage.as_deref());
        let existing_dosage = normalize_dosage(existing.dosage.as_deref());
        match (new_dosage, existing_dosage) {
            (Some(n), Some(e)) if n != e => vec![ConflictDetail::new(
                ConflictType::DosageConflict,
                FactKind::MedicationStatement,
                "dosage",
                json!(existing.dosage),
                json!(new.dosage),
                Severity::High,
            )],
            _ => Vec::new(),
        }
    }
}

/// Normalize dose text for comparison: lowercase, collapsed whitespace.
fn normalize_dosage(dosage: Option<&str>) -> Option<String> {
    let dosage = dosage?;
    let normalized = dosage.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        None
    } else {
        Some(normalized.to_lowercase())
    }
}
