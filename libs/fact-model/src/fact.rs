//! Typed clinical fact entries
//!
//! A [`Fact`] is one clinical statement extracted from a source document.
//! Facts are identified by `(kind, id)`; when the extractor supplied no id,
//! a deterministic content hash stands in so the fact still has a stable
//! identity within a record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// The kind of clinical statement a fact represents.
///
/// Mirrors the FHIR resource types the extraction layer emits. `Other`
/// carries kinds the engine handles generically (compared only for equality,
/// no kind-specific conflict rules).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FactKind {
    Condition,
    Observation,
    MedicationStatement,
    Procedure,
    AllergyIntolerance,
    Immunization,
    Other(String),
}

impl FactKind {
    pub fn as_str(&self) -> &str {
        match self {
            FactKind::Condition => "Condition",
            FactKind::Observation => "Observation",
            FactKind::MedicationStatement => "MedicationStatement",
            FactKind::Procedure => "Procedure",
            FactKind::AllergyIntolerance => "AllergyIntolerance",
            FactKind::Immunization => "Immunization",
            FactKind::Other(name) => name,
        }
    }
}

impl From<String> for FactKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "Condition" => FactKind::Condition,
            "Observation" => FactKind::Observation,
            "MedicationStatement" => FactKind::MedicationStatement,
            "Procedure" => FactKind::Procedure,
            "AllergyIntolerance" => FactKind::AllergyIntolerance,
            "Immunization" => FactKind::Immunization,
            _ => FactKind::Other(value),
        }
    }
}

impl From<FactKind> for String {
    fn from(value: FactKind) -> Self {
        value.as_str().to_string()
    }
}

impl std::fmt::Display for FactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coding - a reference to a code defined by a terminology system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    /// Two codings refer to the same concept when system and code match.
    /// Display text is presentation only and never participates in equality.
    pub fn same_concept(&self, other: &Coding) -> bool {
        self.system == other.system && self.code == other.code
    }
}

/// A measured or stated quantity with an optional unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

/// One typed clinical entry extracted from a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fact {
    pub kind: FactKind,

    /// Identity within the record. Optional: facts without an id are
    /// identified by their content hash instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Coding>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Quantity>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// When the stated event was clinically effective.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effective: Option<DateTime<Utc>>,

    /// When the statement was recorded at the source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dosage: Option<String>,

    /// Extraction confidence in [0,1], when the extractor reported one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Origin tag: the document this fact was extracted from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_document_id: Option<String>,

    /// Provenance pointers to facts merged away as duplicates of this one.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<String>,

    /// Fields beyond the comparable attributes are carried opaquely.
    #[serde(flatten)]
    pub extensions: HashMap<String, serde_json::Value>,
}

impl Fact {
    pub fn new(kind: FactKind) -> Self {
        Self {
            kind,
            id: None,
            code: None,
            value: None,
            status: None,
            effective: None,
            recorded: None,
            dosage: None,
            confidence: None,
            source_document_id: None,
            merged_from: Vec::new(),
            extensions: HashMap::new(),
        }
    }

    /// Stable identity of this fact within a record: the supplied id, or a
    /// deterministic content hash when the extractor supplied none.
    pub fn identity(&self) -> FactIdentity {
        let key = match &self.id {
            Some(id) => id.clone(),
            None => self.content_hash(),
        };
        FactIdentity {
            kind: self.kind.clone(),
            key,
        }
    }

    /// Deterministic digest over the clinically meaningful fields.
    ///
    /// Identity and bookkeeping fields (`id`, `source_document_id`,
    /// `merged_from`, `confidence`, extensions) are excluded, so two facts
    /// describing the same clinical content hash identically regardless of
    /// where they came from.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(b"|");
        if let Some(code) = &self.code {
            hasher.update(code.system.as_deref().unwrap_or("").as_bytes());
            hasher.update(b"^");
            hasher.update(code.code.as_deref().unwrap_or("").as_bytes());
        }
        hasher.update(b"|");
        if let Some(value) = &self.value {
            // Canonical float formatting keeps 1.0 and 1 identical.
            hasher.update(format!("{}", value.value).as_bytes());
            hasher.update(b"^");
            hasher.update(value.unit.as_deref().unwrap_or("").as_bytes());
        }
        hasher.update(b"|");
        hasher.update(self.status.as_deref().unwrap_or("").as_bytes());
        hasher.update(b"|");
        if let Some(effective) = &self.effective {
            hasher.update(
                effective
                    .to_rfc3339_opts(SecondsFormat::Secs, true)
                    .as_bytes(),
            );
        }
        hasher.update(b"|");
        hasher.update(self.dosage.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Best available clinical timestamp: effective time, else recorded time.
    pub fn clinical_timestamp(&self) -> Option<DateTime<Utc>> {
        self.effective.or(self.recorded)
    }
}

/// The `(kind, key)` pair a fact is addressed by within a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FactIdentity {
    pub kind: FactKind,
    pub key: String,
}

impl std::fmt::Display for FactIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation(id: Option<&str>, value: f64) -> Fact {
        let mut fact = Fact::new(FactKind::Observation);
        fact.id = id.map(|s| s.to_string());
        fact.code = Some(Coding {
            system: Some("http://loinc.org".to_string()),
            code: Some("8480-6".to_string()),
            display: Some("Systolic blood pressure".to_string()),
        });
        fact.value = Some(Quantity {
            value,
            unit: Some("mm[Hg]".to_string()),
        });
        fact.effective = Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 0).unwrap());
        fact
    }

    #[test]
    fn kind_round_trips_through_strings() {
        let kinds = [
            FactKind::Condition,
            FactKind::MedicationStatement,
            FactKind::Other("FamilyMemberHistory".to_string()),
        ];
        for kind in kinds {
            let s: String = kind.clone().into();
            assert_eq!(FactKind::from(s), kind);
        }
    }

    #[test]
    fn content_hash_ignores_identity_and_bookkeeping() {
        let mut a = observation(Some("obs-1"), 120.0);
        let mut b = observation(Some("obs-2"), 120.0);
        a.source_document_id = Some("doc-a".to_string());
        b.source_document_id = Some("doc-b".to_string());
        b.confidence = Some(0.8);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn content_hash_differs_on_clinical_fields() {
        let a = observation(None, 120.0);
        let b = observation(None, 121.0);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn identity_falls_back_to_content_hash() {
        let with_id = observation(Some("obs-1"), 120.0);
        let without_id = observation(None, 120.0);
        assert_eq!(with_id.identity().key, "obs-1");
        assert_eq!(without_id.identity().key, without_id.content_hash());
    }

    #[test]
    fn fact_serde_round_trip() {
        let mut fact = observation(Some("obs-1"), 95.0);
        fact.extensions.insert(
            "note".to_string(),
            serde_json::json!({"text": "taken supine"}),
        );
        let json = serde_json::to_string(&fact).unwrap();
        let back: Fact = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fact);
    }
}
