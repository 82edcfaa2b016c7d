//! Direct updates for records matched as duplicates with newer upstream
//! data.
//!
//! Only the six critical fields are updatable; everything else on the row
//! (enhanced content, admin notes, ratings, custom fields) is protected by
//! construction - the payload type has no slot for it. Each item's update
//! is isolated; an accounting mismatch across the batch is an integrity
//! violation and aborts.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::pipeline::change::normalize_date;
use crate::pipeline::dedupe::UpdateCandidate;
use crate::traits::store::{CriticalField, OpportunityStore, UpdatePayload};
use crate::types::opportunity::{Opportunity, PersistedOpportunity};

pub const REASON_NO_VALID_UPDATES: &str = "no_valid_updates";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedItem {
    pub internal_id: Uuid,
    pub api_opportunity_id: String,
    pub updated_fields: Vec<CriticalField>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub api_opportunity_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedItem {
    pub api_opportunity_id: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMetrics {
    pub total_processed: u64,
    pub successful: u64,
    pub failed: u64,
    pub skipped: u64,
    pub execution_ms: u64,
}

#[derive(Debug, Default)]
pub struct UpdateOutcome {
    pub successful: Vec<UpdatedItem>,
    pub failed: Vec<FailedItem>,
    pub skipped: Vec<SkippedItem>,
    pub metrics: UpdateMetrics,
}

/// Terminal status of one item inside the batch.
enum ItemStatus {
    Updated(UpdatedItem),
    Skipped(SkippedItem),
    Failed(FailedItem),
}

pub struct DirectUpdateHandler {
    store: Arc<dyn OpportunityStore>,
}

impl DirectUpdateHandler {
    pub fn new(store: Arc<dyn OpportunityStore>) -> Self {
        Self { store }
    }

    /// Apply field-level updates for a batch of matched records.
    pub async fn process(&self, batch: &[UpdateCandidate]) -> Result<UpdateOutcome> {
        let started = Instant::now();
        let mut outcome = UpdateOutcome::default();

        for candidate in batch {
            match self.process_one(candidate).await {
                ItemStatus::Updated(item) => outcome.successful.push(item),
                ItemStatus::Skipped(item) => outcome.skipped.push(item),
                ItemStatus::Failed(item) => outcome.failed.push(item),
            }
        }

        let processed =
            outcome.successful.len() + outcome.failed.len() + outcome.skipped.len();
        if processed != batch.len() {
            return Err(PipelineError::Integrity(format!(
                "DirectUpdate failed to process all opportunities: {} in, {} processed",
                batch.len(),
                processed
            )));
        }

        outcome.metrics = UpdateMetrics {
            total_processed: processed as u64,
            successful: outcome.successful.len() as u64,
            failed: outcome.failed.len() as u64,
            skipped: outcome.skipped.len() as u64,
            execution_ms: started.elapsed().as_millis() as u64,
        };
        Ok(outcome)
    }

    async fn process_one(&self, candidate: &UpdateCandidate) -> ItemStatus {
        let payload = build_update_payload(
            &candidate.api_record,
            &candidate.db_record,
            candidate.raw_response_id,
        );

        if !payload.has_critical_changes() {
            debug!(
                api_opportunity_id = %candidate.api_record.id,
                "no critical field qualified for update"
            );
            return ItemStatus::Skipped(SkippedItem {
                api_opportunity_id: candidate.api_record.id.clone(),
                reason: REASON_NO_VALID_UPDATES,
            });
        }

        match self
            .store
            .update_opportunity(candidate.db_record.id, &payload)
            .await
        {
            Ok(()) => ItemStatus::Updated(UpdatedItem {
                internal_id: candidate.db_record.id,
                api_opportunity_id: candidate.api_record.id.clone(),
                updated_fields: payload.critical_fields(),
            }),
            Err(e) => {
                warn!(
                    api_opportunity_id = %candidate.api_record.id,
                    error = %e,
                    "direct update failed for one item"
                );
                ItemStatus::Failed(FailedItem {
                    api_opportunity_id: candidate.api_record.id.clone(),
                    error: e.to_string(),
                })
            }
        }
    }
}

/// Build the update payload for one matched pair.
///
/// A critical field is included only when the upstream value is present,
/// non-empty, and differs from the persisted value after normalization
/// (dates by calendar day, amounts by numeric equality, strings by exact
/// equality).
pub fn build_update_payload(
    api: &Opportunity,
    db: &PersistedOpportunity,
    raw_response_id: Option<Uuid>,
) -> UpdatePayload {
    let mut payload = UpdatePayload {
        title: None,
        minimum_award: None,
        maximum_award: None,
        total_funding_available: None,
        open_date: None,
        close_date: None,
        updated_at: Utc::now(),
        api_updated_at: api.api_updated_at,
        raw_response_id,
    };

    let title = api.title.as_str();
    if !title.is_empty() && title != db.title {
        payload.title = Some(title.to_string());
    }

    if let Some(value) = api.minimum_award {
        if db.minimum_award != Some(value) {
            payload.minimum_award = Some(value);
        }
    }
    if let Some(value) = api.maximum_award {
        if db.maximum_award != Some(value) {
            payload.maximum_award = Some(value);
        }
    }
    if let Some(value) = api.total_funding_available {
        if db.total_funding_available != Some(value) {
            payload.total_funding_available = Some(value);
        }
    }

    if let Some(date) = api.open_date.as_deref().and_then(normalize_date) {
        if db.open_date != Some(date) {
            payload.open_date = Some(date);
        }
    }
    if let Some(date) = api.close_date.as_deref().and_then(normalize_date) {
        if db.close_date != Some(date) {
            payload.close_date = Some(date);
        }
    }

    payload
}
