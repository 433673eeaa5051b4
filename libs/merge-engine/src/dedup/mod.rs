//! Resource deduplication
//!
//! Finds exact and near-duplicate facts within a candidate set and collapses
//! each duplicate cluster to one survivor. Exact duplicates are detected by
//! content hash (see [`Fact::content_hash`](chronik_models::Fact::content_hash));
//! the remainder are scored by the [`FuzzyMatcher`] against configurable
//! thresholds. Survivors carry provenance pointers to every fact merged away.
//!
//! Deduplication never aborts a merge: the engine catches failures from this
//! stage and downgrades them to warnings on the merge result.

mod matcher;

pub use matcher::FuzzyMatcher;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

use crate::config::DedupConfig;
use crate::{Error, Result};
use chronik_models::{Fact, FactKind};

/// How a duplicate pair was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateType {
    Exact,
    Near,
    Fuzzy,
}

/// One collapsed duplicate: which fact survived and which was merged away.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateDetail {
    pub fact_kind: FactKind,
    pub survivor_id: String,
    pub duplicate_id: String,
    /// Similarity in [0,1]; 1.0 for exact hash matches.
    pub similarity_score: f64,
    pub duplicate_type: DuplicateType,
    /// Field names that matched between the pair.
    pub matching_fields: Vec<String>,
}

/// Aggregate outcome of one deduplication pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    pub duplicates: Vec<DuplicateDetail>,
    /// Clusters that collapsed (survivors that absorbed at least one fact).
    pub facts_merged: usize,
    /// Facts removed as duplicates.
    pub facts_removed: usize,
    pub success: bool,
    pub elapsed_ms: u64,
}

/// Survivors plus the structured result of the pass.
#[derive(Debug, Clone)]
pub struct DeduplicationOutcome {
    pub survivors: Vec<Fact>,
    pub result: DeduplicationResult,
}

pub struct Deduplicator {
    config: DedupConfig,
    matcher: FuzzyMatcher,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        let matcher = FuzzyMatcher::new(config.clone());
        Self { config, matcher }
    }

    /// Collapse duplicates within `facts`, preserving input order among
    /// survivors.
    pub fn deduplicate(&self, facts: Vec<Fact>) -> Result<DeduplicationOutcome> {
        let started = Instant::now();
        self.validate_thresholds()?;

        let n = facts.len();
        // Union-find over fact indices: each cluster collapses to the
        // earliest index as survivor.
        let mut parent: Vec<usize> = (0..n).collect();
        // (duplicate index -> (survivor index, score, type, fields))
        let mut pair_info: HashMap<usize, (usize, f64, DuplicateType, Vec<String>)> =
            HashMap::new();

        let mut by_kind: HashMap<FactKind, Vec<usize>> = HashMap::new();
        for (i, fact) in facts.iter().enumerate() {
            by_kind.entry(fact.kind.clone()).or_default().push(i);
        }

        for indices in by_kind.values() {
            for (pos, &i) in indices.iter().enumerate() {
                for &j in &indices[pos + 1..] {
                    if find(&mut parent, i) == find(&mut parent, j) {
                        continue;
                    }
                    let (a, b) = (&facts[i], &facts[j]);

                    let classified = if a.content_hash() == b.content_hash() {
                        Some((1.0, DuplicateType::Exact, self.matcher.matching_fields(a, b)))
                    } else {
                        let score = self.matcher.similarity(a, b);
                        if score >= self.config.near_threshold {
                            Some((score, DuplicateType::Near, self.matcher.matching_fields(a, b)))
                        } else if score >= self.config.fuzzy_threshold {
                            Some((score, DuplicateType::Fuzzy, self.matcher.matching_fields(a, b)))
                        } else {
                            None
                        }
                    };

                    if let Some((score, duplicate_type, fields)) = classified {
                        union(&mut parent, i, j);
                        pair_info.insert(j, (i, score, duplicate_type, fields));
                    }
                }
            }
        }

        // Resolve cluster roots and build survivors in input order.
        let mut survivors: Vec<Fact> = Vec::with_capacity(n);
        let mut root_to_survivor: HashMap<usize, usize> = HashMap::new();
        let mut duplicates = Vec::new();
        let mut merged_roots = std::collections::HashSet::new();

        for i in 0..n {
            let root = find(&mut parent, i);
            if root == i {
                root_to_survivor.insert(root, survivors.len());
                survivors.push(facts[i].clone());
            }
        }

        for j in 0..n {
            let root = find(&mut parent, j);
            if root == j {
                continue;
            }
            let survivor_index = root_to_survivor[&root];
            let duplicate_identity = facts[j].identity();

            let (_, score, duplicate_type, fields) = pair_info
                .remove(&j)
                .unwrap_or((root, 1.0, DuplicateType::Exact, Vec::new()));

            duplicates.push(DuplicateDetail {
                fact_kind: facts[j].kind.clone(),
                survivor_id: survivors[survivor_index].identity().key,
                duplicate_id: duplicate_identity.key.clone(),
                similarity_score: score,
                duplicate_type,
                matching_fields: fields,
            });

            // Provenance pointer from the survivor to the merged-away fact.
            survivors[survivor_index]
                .merged_from
                .push(duplicate_identity.key);
            merged_roots.insert(root);
        }

        let facts_removed = duplicates.len();
        tracing::debug!(
            candidates = n,
            removed = facts_removed,
            "deduplication pass complete"
        );

        Ok(DeduplicationOutcome {
            survivors,
            result: DeduplicationResult {
                duplicates,
                facts_merged: merged_roots.len(),
                facts_removed,
                success: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
        })
    }

    fn validate_thresholds(&self) -> Result<()> {
        let near = self.config.near_threshold;
        let fuzzy = self.config.fuzzy_threshold;
        if !(0.0..=1.0).contains(&near) || !(0.0..=1.0).contains(&fuzzy) || fuzzy > near {
            return Err(Error::Deduplication(format!(
                "invalid thresholds: near={near}, fuzzy={fuzzy}"
            )));
        }
        Ok(())
    }
}

fn find(parent: &mut [usize], i: usize) -> usize {
    let mut root = i;
    while parent[root] != root {
        root = parent[root];
    }
    // Path compression.
    let mut current = i;
    while parent[current] != root {
        let next = parent[current];
        parent[current] = root;
        current = next;
    }
    root
}

fn union(parent: &mut [usize], i: usize, j: usize) {
    let (ri, rj) = (find(parent, i), find(parent, j));
    // The smaller index wins so the earliest fact is always the survivor.
    if ri < rj {
        parent[rj] = ri;
    } else {
        parent[ri] = rj;
    }
}
