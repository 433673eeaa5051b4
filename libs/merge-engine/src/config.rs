//! Engine configuration
//!
//! Every threshold the comparison and transaction logic uses is an
//! operational default here, not a fixed contract. Deployments that need
//! parity with previously stored data should pin these explicitly.

use serde::Deserialize;
use std::collections::HashMap;

use crate::conflict::{ConflictType, Severity, StrategyKind};
use chronik_models::FactKind;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MergeConfig {
    #[serde(default)]
    pub conflict: ConflictConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub transaction: TransactionConfig,
    #[serde(default)]
    pub resolution: ResolutionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConflictConfig {
    /// Relative value difference above which a value mismatch is `high`
    /// severity. Default: 0.5 (50%)
    #[serde(default = "default_value_high_band")]
    pub value_high_band: f64,
    /// Relative value difference above which a value mismatch is `medium`
    /// severity. Default: 0.2 (20%)
    #[serde(default = "default_value_medium_band")]
    pub value_medium_band: f64,
    /// Window within which two effective timestamps count as the same
    /// measurement context. Default: 3600 seconds
    #[serde(default = "default_temporal_tolerance")]
    pub temporal_tolerance_seconds: i64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            value_high_band: default_value_high_band(),
            value_medium_band: default_value_medium_band(),
            temporal_tolerance_seconds: default_temporal_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Similarity at or above which two facts are `near` duplicates.
    /// Default: 0.9
    #[serde(default = "default_near_threshold")]
    pub near_threshold: f64,
    /// Similarity at or above which two facts are `fuzzy` duplicates.
    /// Default: 0.7
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
    /// Relative tolerance for quantity comparison. Default: 0.1 (10%)
    #[serde(default = "default_quantity_tolerance")]
    pub quantity_tolerance: f64,
    /// Window within which timestamps still count as matching.
    /// Default: 24 hours
    #[serde(default = "default_time_tolerance")]
    pub time_tolerance_hours: i64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            near_threshold: default_near_threshold(),
            fuzzy_threshold: default_fuzzy_threshold(),
            quantity_tolerance: default_quantity_tolerance(),
            time_tolerance_hours: default_time_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    /// A lock not explicitly released is considered released after this many
    /// seconds. Default: 300 (5 minutes)
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_seconds: u64,
    /// Staging areas older than this are removed by the background sweep.
    /// Default: 1800 (30 minutes)
    #[serde(default = "default_staging_lifetime")]
    pub staging_lifetime_seconds: u64,
    /// Snapshots retained per subject; oldest evicted beyond the cap.
    /// Default: 10
    #[serde(default = "default_snapshot_cap")]
    pub snapshot_cap: usize,
    /// TTL for snapshot entries in the shared store. Default: 30 days
    #[serde(default = "default_snapshot_ttl_days")]
    pub snapshot_ttl_days: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            lock_timeout_seconds: default_lock_timeout(),
            staging_lifetime_seconds: default_staging_lifetime(),
            snapshot_cap: default_snapshot_cap(),
            snapshot_ttl_days: default_snapshot_ttl_days(),
        }
    }
}

/// Strategy selection precedence: per-conflict-type mapping, else per-kind
/// mapping, else per-severity mapping, else the default strategy.
#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionConfig {
    #[serde(default)]
    pub by_conflict_type: HashMap<ConflictType, StrategyKind>,
    #[serde(default)]
    pub by_kind: HashMap<FactKind, StrategyKind>,
    #[serde(default)]
    pub by_severity: HashMap<Severity, StrategyKind>,
    #[serde(default = "default_strategy")]
    pub default_strategy: StrategyKind,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            by_conflict_type: HashMap::new(),
            by_kind: HashMap::new(),
            by_severity: HashMap::new(),
            default_strategy: default_strategy(),
        }
    }
}

impl ResolutionConfig {
    pub fn strategy_for(
        &self,
        conflict_type: &ConflictType,
        kind: &FactKind,
        severity: Severity,
    ) -> StrategyKind {
        if let Some(s) = self.by_conflict_type.get(conflict_type) {
            return *s;
        }
        if let Some(s) = self.by_kind.get(kind) {
            return *s;
        }
        if let Some(s) = self.by_severity.get(&severity) {
            return *s;
        }
        self.default_strategy
    }
}

fn default_value_high_band() -> f64 {
    0.5
}

fn default_value_medium_band() -> f64 {
    0.2
}

fn default_temporal_tolerance() -> i64 {
    3600
}

fn default_near_threshold() -> f64 {
    0.9
}

fn default_fuzzy_threshold() -> f64 {
    0.7
}

fn default_quantity_tolerance() -> f64 {
    0.1
}

fn default_time_tolerance() -> i64 {
    24
}

fn default_lock_timeout() -> u64 {
    300
}

fn default_staging_lifetime() -> u64 {
    1800
}

fn default_snapshot_cap() -> usize {
    10
}

fn default_snapshot_ttl_days() -> u64 {
    30
}

fn default_strategy() -> StrategyKind {
    StrategyKind::NewestWins
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = MergeConfig::default();
        assert_eq!(config.conflict.value_high_band, 0.5);
        assert_eq!(config.conflict.value_medium_band, 0.2);
        assert_eq!(config.dedup.near_threshold, 0.9);
        assert_eq!(config.dedup.fuzzy_threshold, 0.7);
        assert_eq!(config.transaction.lock_timeout_seconds, 300);
        assert_eq!(config.transaction.snapshot_cap, 10);
    }

    #[test]
    fn precedence_prefers_conflict_type_mapping() {
        let mut resolution = ResolutionConfig::default();
        resolution
            .by_conflict_type
            .insert(ConflictType::DosageConflict, StrategyKind::ManualReview);
        resolution
            .by_kind
            .insert(FactKind::MedicationStatement, StrategyKind::PreserveBoth);

        let chosen = resolution.strategy_for(
            &ConflictType::DosageConflict,
            &FactKind::MedicationStatement,
            Severity::High,
        );
        assert_eq!(chosen, StrategyKind::ManualReview);

        let fallback = resolution.strategy_for(
            &ConflictType::StatusConflict,
            &FactKind::MedicationStatement,
            Severity::High,
        );
        assert_eq!(fallback, StrategyKind::PreserveBoth);
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: MergeConfig = serde_json::from_str(
            r#"{"dedup": {"near_threshold": 0.95}, "transaction": {"snapshot_cap": 3}}"#,
        )
        .unwrap();
        assert_eq!(config.dedup.near_threshold, 0.95);
        assert_eq!(config.dedup.fuzzy_threshold, 0.7);
        assert_eq!(config.transaction.snapshot_cap, 3);
    }
}
