//! Duplicate detection: partition a chunk into NEW / UPDATE / SKIP before
//! any LLM work happens.
//!
//! The detector issues exactly two batched store lookups per chunk (by
//! upstream id, by title) and decides each record from the in-memory index.
//! Store failures degrade: the chunk continues with whatever was fetched,
//! and downstream idempotent writes absorb any mis-classified NEW.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::pipeline::freshness::{decide_freshness, titles_match, FreshnessDecision};
use crate::traits::store::OpportunityStore;
use crate::types::config::TOKENS_PER_OPPORTUNITY;
use crate::types::opportunity::{Opportunity, PersistedOpportunity};

pub const METHOD_NO_MATCH: &str = "no_match";
pub const METHOD_ID_VALIDATION: &str = "id_validation";
pub const METHOD_TITLE_ONLY: &str = "title_only";

/// A record matched to a persisted row that warrants a field-level update.
#[derive(Debug, Clone)]
pub struct UpdateCandidate {
    pub api_record: Opportunity,
    pub db_record: PersistedOpportunity,
    pub reason: &'static str,
    pub raw_response_id: Option<Uuid>,
}

/// A record that terminates at detection.
#[derive(Debug, Clone)]
pub struct SkippedRecord {
    pub record: Opportunity,
    pub reason: &'static str,
}

/// How often each detection method fired.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodCounts {
    pub no_match: u64,
    pub id_validation: u64,
    pub title_only: u64,
}

/// Confidence distribution over the chunk. ID-validated matches and clean
/// no-matches are high; title-only matches are medium; an id hit that
/// failed title validation is low.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceCounts {
    pub high: u64,
    pub medium: u64,
    pub low: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionMetrics {
    pub total_records: u64,
    pub method_counts: MethodCounts,
    pub confidence: ConfidenceCounts,
    /// Bypassed records times the fixed per-opportunity token budget
    pub estimated_tokens_saved: u64,
    pub database_queries: u32,
    pub detection_ms: u64,
}

/// Chunk partition produced by the detector.
///
/// The three sets are disjoint and their sizes sum to the input size.
#[derive(Debug, Default)]
pub struct DetectionOutcome {
    pub new_opportunities: Vec<Opportunity>,
    pub to_update: Vec<UpdateCandidate>,
    pub to_skip: Vec<SkippedRecord>,
    pub metrics: DetectionMetrics,
}

pub struct DuplicateDetector {
    store: Arc<dyn OpportunityStore>,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self { store }
    }

    /// Partition `records` into NEW / UPDATE / SKIP for one source.
    ///
    /// Never fails: lookup errors are logged and the affected records fall
    /// through as NEW.
    pub async fn detect(
        &self,
        funding_source_id: Uuid,
        records: &[Opportunity],
        raw_response_id: Option<Uuid>,
    ) -> DetectionOutcome {
        let started = Instant::now();
        let mut outcome = DetectionOutcome::default();
        outcome.metrics.total_records = records.len() as u64;

        if records.is_empty() {
            return outcome;
        }

        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        let titles: Vec<String> = records
            .iter()
            .filter(|r| r.has_matchable_title())
            .map(|r| r.title.trim().to_string())
            .collect();

        let by_id = match self.store.find_by_api_ids(funding_source_id, &ids).await {
            Ok(rows) => {
                outcome.metrics.database_queries += 1;
                rows
            }
            Err(e) => {
                warn!(error = %e, "id lookup failed; treating chunk as unmatched");
                outcome.metrics.database_queries += 1;
                Vec::new()
            }
        };

        let by_title = if titles.is_empty() {
            Vec::new()
        } else {
            match self.store.find_by_titles(funding_source_id, &titles).await {
                Ok(rows) => {
                    outcome.metrics.database_queries += 1;
                    rows
                }
                Err(e) => {
                    warn!(error = %e, "title lookup failed; continuing with id matches only");
                    outcome.metrics.database_queries += 1;
                    Vec::new()
                }
            }
        };

        let id_index: HashMap<&str, &PersistedOpportunity> = by_id
            .iter()
            .map(|row| (row.api_opportunity_id.as_str(), row))
            .collect();

        // Candidate pool for title matching: both result sets
        let title_candidates: Vec<&PersistedOpportunity> =
            by_id.iter().chain(by_title.iter()).collect();

        let now = Utc::now();
        for record in records {
            let id_hit = id_index.get(record.id.as_str()).copied();
            let mut low_confidence = false;

            let matched = match id_hit {
                Some(row) if titles_match(&record.title, &row.title) => {
                    outcome.metrics.method_counts.id_validation += 1;
                    outcome.metrics.confidence.high += 1;
                    Some(row)
                }
                Some(_) => {
                    // Id collision with a dissimilar title; fall through to
                    // title matching
                    low_confidence = true;
                    self.title_match(record, &title_candidates, &mut outcome.metrics)
                }
                None => self.title_match(record, &title_candidates, &mut outcome.metrics),
            };

            match matched {
                Some(row) => {
                    let decision =
                        decide_freshness(record.api_updated_at, row.api_updated_at, row.updated_at, now);
                    debug!(
                        api_opportunity_id = %record.id,
                        reason = decision.reason(),
                        "matched persisted opportunity"
                    );
                    match decision {
                        FreshnessDecision::Update { reason } => {
                            outcome.to_update.push(UpdateCandidate {
                                api_record: record.clone(),
                                db_record: (*row).clone(),
                                reason,
                                raw_response_id,
                            });
                        }
                        FreshnessDecision::Skip { reason } => {
                            outcome.to_skip.push(SkippedRecord {
                                record: record.clone(),
                                reason,
                            });
                        }
                    }
                }
                None => {
                    outcome.metrics.method_counts.no_match += 1;
                    if low_confidence {
                        outcome.metrics.confidence.low += 1;
                    } else {
                        outcome.metrics.confidence.high += 1;
                    }
                    outcome.new_opportunities.push(record.clone());
                }
            }
        }

        let bypassed = (outcome.to_update.len() + outcome.to_skip.len()) as u64;
        outcome.metrics.estimated_tokens_saved = bypassed * TOKENS_PER_OPPORTUNITY;
        outcome.metrics.detection_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    fn title_match<'a>(
        &self,
        record: &Opportunity,
        candidates: &[&'a PersistedOpportunity],
        metrics: &mut DetectionMetrics,
    ) -> Option<&'a PersistedOpportunity> {
        if !record.has_matchable_title() {
            return None;
        }
        let hit = candidates
            .iter()
            .find(|row| titles_match(&record.title, &row.title))
            .copied();
        if hit.is_some() {
            metrics.method_counts.title_only += 1;
            metrics.confidence.medium += 1;
        }
        hit
    }
}
