//! Fuzzy similarity scoring between same-kind facts
//!
//! Weighted field agreement in [0,1]. Coded concept equality dominates;
//! quantities compare within a relative tolerance and timestamps within a
//! tolerance window. Facts of differing kinds always score 0.

use chrono::Duration;

use crate::config::DedupConfig;
use chronik_models::Fact;

// Relative weights. Only fields present on both sides participate; the
// score is normalized over the participating weight.
const WEIGHT_CODE: f64 = 0.5;
const WEIGHT_VALUE: f64 = 0.2;
const WEIGHT_UNIT: f64 = 0.05;
const WEIGHT_TIME: f64 = 0.15;
const WEIGHT_STATUS: f64 = 0.05;
const WEIGHT_DOSAGE: f64 = 0.05;

pub struct FuzzyMatcher {
    config: DedupConfig,
}

impl FuzzyMatcher {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Similarity between two facts in [0,1]. 0 for differing kinds.
    pub fn similarity(&self, a: &Fact, b: &Fact) -> f64 {
        if a.kind != b.kind {
            return 0.0;
        }

        let mut score = 0.0;
        let mut total = 0.0;

        if let (Some(ca), Some(cb)) = (&a.code, &b.code) {
            total += WEIGHT_CODE;
            if ca.same_concept(cb) {
                score += WEIGHT_CODE;
            } else {
                // Different concepts are not the same real-world event no
                // matter how close the rest looks.
                return 0.0;
            }
        }

        if let (Some(va), Some(vb)) = (&a.value, &b.value) {
            total += WEIGHT_VALUE;
            if self.quantities_match(va.value, vb.value) {
                score += WEIGHT_VALUE;
            }
            total += WEIGHT_UNIT;
            if va.unit == vb.unit {
                score += WEIGHT_UNIT;
            }
        }

        if let (Some(ta), Some(tb)) = (a.clinical_timestamp(), b.clinical_timestamp()) {
            total += WEIGHT_TIME;
            let window = Duration::hours(self.config.time_tolerance_hours);
            if (ta - tb).abs() <= window {
                score += WEIGHT_TIME;
            }
        }

        if let (Some(sa), Some(sb)) = (&a.status, &b.status) {
            total += WEIGHT_STATUS;
            if sa == sb {
                score += WEIGHT_STATUS;
            }
        }

        if let (Some(da), Some(db)) = (&a.dosage, &b.dosage) {
            total += WEIGHT_DOSAGE;
            if da.eq_ignore_ascii_case(db) {
                score += WEIGHT_DOSAGE;
            }
        }

        if total == 0.0 {
            return 0.0;
        }
        score / total
    }

    /// Names of the fields that agree between the pair, for duplicate
    /// reporting.
    pub fn matching_fields(&self, a: &Fact, b: &Fact) -> Vec<String> {
        let mut fields = Vec::new();
        if let (Some(ca), Some(cb)) = (&a.code, &b.code) {
            if ca.same_concept(cb) {
                fields.push("code".to_string());
            }
        }
        if let (Some(va), Some(vb)) = (&a.value, &b.value) {
            if self.quantities_match(va.value, vb.value) {
                fields.push("value".to_string());
            }
            if va.unit == vb.unit {
                fields.push("unit".to_string());
            }
        }
        if let (Some(ta), Some(tb)) = (a.clinical_timestamp(), b.clinical_timestamp()) {
            if (ta - tb).abs() <= Duration::hours(self.config.time_tolerance_hours) {
                fields.push("effective".to_string());
            }
        }
        if a.status.is_some() && a.status == b.status {
            fields.push("status".to_string());
        }
        if let (Some(da), Some(db)) = (&a.dosage, &b.dosage) {
            if da.eq_ignore_ascii_case(db) {
                fields.push("dosage".to_string());
            }
        }
        fields
    }

    fn quantities_match(&self, a: f64, b: f64) -> bool {
        let base = a.abs().max(b.abs());
        if base == 0.0 {
            return true;
        }
        (a - b).abs() / base <= self.config.quantity_tolerance
    }
}
