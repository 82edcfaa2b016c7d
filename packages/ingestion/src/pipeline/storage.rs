//! Storage stage: idempotent per-item writes for new opportunities.
//!
//! One bad item never sinks the chunk: constraint races count as
//! duplicates, other per-item errors are recorded and the loop moves on.
//! The stage itself never returns an error; invalid input surfaces as an
//! error-shaped metrics block.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::sanitize::{extract_state_codes, sanitize_for_storage};
use crate::traits::store::{OpportunityStore, WriteMode, WriteOutcome};
use crate::types::analysis::AnalyzedOpportunity;
use crate::types::opportunity::SourceDescriptor;

/// A row the stage inserted during this call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredOpportunity {
    pub id: Uuid,
    pub api_opportunity_id: String,
    pub title: String,
}

/// Immutable results block: the newly stored rows.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageResults {
    pub new_opportunities: Vec<StoredOpportunity>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMetrics {
    pub total_processed: u64,
    pub new_opportunities: u64,
    pub updated_opportunities: u64,
    pub ignored_opportunities: u64,
    pub duplicates_found: u64,
    pub failures: u64,
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Default)]
pub struct StorageOutcome {
    pub results: StorageResults,
    pub metrics: StorageMetrics,
    /// Upstream ids that raced an existing row
    pub duplicate_ids: Vec<String>,
    /// Upstream ids whose write failed
    pub failed_ids: Vec<String>,
    pub execution_ms: u64,
}

impl StorageOutcome {
    fn error_shaped(message: String, execution_ms: u64) -> Self {
        Self {
            metrics: StorageMetrics {
                error: true,
                error_message: Some(message),
                ..Default::default()
            },
            execution_ms,
            ..Default::default()
        }
    }
}

pub struct StorageStage {
    store: Arc<dyn OpportunityStore>,
}

impl StorageStage {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self { store }
    }

    /// Store a chunk of analyzed, filtered opportunities.
    ///
    /// `force_full_processing` switches the write from insert to upsert so
    /// a full re-run can refresh existing rows.
    pub async fn store(
        &self,
        opps: &[AnalyzedOpportunity],
        source: &SourceDescriptor,
        raw_response_id: Option<Uuid>,
        force_full_processing: bool,
    ) -> StorageOutcome {
        let started = Instant::now();

        if source.id.is_nil() || source.name.trim().is_empty() {
            return StorageOutcome::error_shaped(
                "source descriptor must have an id and name".to_string(),
                elapsed_ms(&started),
            );
        }

        let funding_source_id = match self.store.resolve_funding_source(source).await {
            Ok(id) => id,
            Err(e) => {
                warn!(source = %source.name, error = %e, "funding source resolution failed");
                return StorageOutcome::error_shaped(
                    format!("failed to resolve funding source: {e}"),
                    elapsed_ms(&started),
                );
            }
        };

        let mode = if force_full_processing {
            WriteMode::Upsert
        } else {
            WriteMode::Insert
        };

        let mut outcome = StorageOutcome::default();
        let mut results = StorageResults::default();
        let mut metrics = StorageMetrics {
            total_processed: opps.len() as u64,
            ..Default::default()
        };

        for opp in opps {
            let row = sanitize_for_storage(opp, funding_source_id, raw_response_id);

            match self.store.insert_opportunity(&row, mode).await {
                Ok(WriteOutcome::Inserted { id }) => {
                    metrics.new_opportunities += 1;
                    results.new_opportunities.push(StoredOpportunity {
                        id,
                        api_opportunity_id: row.api_opportunity_id.clone(),
                        title: row.title.clone(),
                    });
                    self.process_geography(id, &row.eligible_applicants).await;
                }
                Ok(WriteOutcome::Updated { id }) => {
                    metrics.updated_opportunities += 1;
                    self.process_geography(id, &row.eligible_applicants).await;
                }
                Ok(WriteOutcome::Duplicate) => {
                    metrics.duplicates_found += 1;
                    outcome.duplicate_ids.push(row.api_opportunity_id.clone());
                    info!(
                        api_opportunity_id = %row.api_opportunity_id,
                        "insert raced an existing row; counted as duplicate"
                    );
                }
                Err(e) => {
                    metrics.failures += 1;
                    outcome.failed_ids.push(row.api_opportunity_id.clone());
                    warn!(
                        api_opportunity_id = %row.api_opportunity_id,
                        error = %e,
                        "opportunity write failed; continuing"
                    );
                }
            }
        }

        outcome.results = results;
        outcome.metrics = metrics;
        outcome.execution_ms = elapsed_ms(&started);
        outcome
    }

    /// State-eligibility processing for a stored row. Failures here are
    /// logged and never fail the opportunity.
    async fn process_geography(&self, opportunity_id: Uuid, eligible: &[String]) {
        let states = extract_state_codes(eligible);
        if states.is_empty() {
            return;
        }
        if let Err(e) = self
            .store
            .replace_state_eligibility(opportunity_id, &states)
            .await
        {
            warn!(
                opportunity_id = %opportunity_id,
                error = %e,
                "state eligibility processing failed"
            );
        }
    }
}

fn elapsed_ms(started: &Instant) -> u64 {
    // Execution time is reported strictly positive
    (started.elapsed().as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::testing::analyzed_with_scores;

    fn stage() -> (StorageStage, Arc<MemoryStore>, SourceDescriptor) {
        let store = Arc::new(MemoryStore::new());
        let stage = StorageStage::new(store.clone());
        let source = SourceDescriptor::new(Uuid::new_v4(), "Test Grants Portal");
        (stage, store, source)
    }

    #[tokio::test]
    async fn test_store_new_opportunities() {
        let (stage, _store, source) = stage();
        let opps = vec![
            analyzed_with_scores("ST-1", Some(1.0), Some(2.0), Some(3.0)),
            analyzed_with_scores("ST-2", Some(2.0), Some(2.0), Some(2.0)),
        ];

        let outcome = stage.store(&opps, &source, None, false).await;

        assert!(!outcome.metrics.error);
        assert_eq!(outcome.metrics.new_opportunities, 2);
        assert_eq!(outcome.results.new_opportunities.len(), 2);
        assert!(outcome.execution_ms >= 1);
    }

    #[tokio::test]
    async fn test_duplicate_counted_not_failed() {
        let (stage, _store, source) = stage();
        let opp = analyzed_with_scores("ST-DUP", Some(1.0), Some(1.0), Some(1.0));

        let first = stage.store(&[opp.clone()], &source, None, false).await;
        assert_eq!(first.metrics.new_opportunities, 1);

        let second = stage.store(&[opp], &source, None, false).await;
        assert_eq!(second.metrics.new_opportunities, 0);
        assert_eq!(second.metrics.duplicates_found, 1);
        assert_eq!(second.metrics.failures, 0);
    }

    #[tokio::test]
    async fn test_upsert_counts_updated() {
        let (stage, _store, source) = stage();
        let opp = analyzed_with_scores("ST-UP", Some(1.0), Some(1.0), Some(1.0));

        stage.store(&[opp.clone()], &source, None, false).await;
        let outcome = stage.store(&[opp], &source, None, true).await;

        assert_eq!(outcome.metrics.updated_opportunities, 1);
        assert_eq!(outcome.metrics.duplicates_found, 0);
    }

    #[tokio::test]
    async fn test_accounting_invariant() {
        let (stage, _store, source) = stage();
        let opps = vec![
            analyzed_with_scores("AC-1", Some(1.0), Some(1.0), Some(1.0)),
            analyzed_with_scores("AC-1", Some(1.0), Some(1.0), Some(1.0)),
            analyzed_with_scores("AC-2", Some(1.0), Some(1.0), Some(1.0)),
        ];

        let outcome = stage.store(&opps, &source, None, false).await;
        assert_eq!(
            outcome.metrics.new_opportunities
                + outcome.metrics.duplicates_found
                + outcome.metrics.failures,
            outcome.metrics.total_processed
        );
    }

    #[tokio::test]
    async fn test_invalid_source_is_error_shaped() {
        let (stage, _store, _source) = stage();
        let bad_source = SourceDescriptor::new(Uuid::nil(), "Bad");

        let outcome = stage.store(&[], &bad_source, None, false).await;
        assert!(outcome.metrics.error);
        assert!(outcome.metrics.error_message.is_some());
    }

    #[tokio::test]
    async fn test_geography_rows_written() {
        let (stage, store, source) = stage();
        let mut opp = analyzed_with_scores("GEO-1", Some(1.0), Some(1.0), Some(1.0));
        opp.opportunity.eligible_applicants =
            vec!["Minnesota".to_string(), "Wisconsin".to_string()];

        let outcome = stage.store(&[opp], &source, None, false).await;
        let id = outcome.results.new_opportunities[0].id;
        assert_eq!(store.state_eligibility(id), vec!["MN", "WI"]);
    }
}
