//! Chunk job model and status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;
use uuid::Uuid;

use ingestion::types::config::ProcessingConfig;
use ingestion::Opportunity;

/// Lifecycle status of a chunk job.
///
/// `pending → processing → (completed | failed)`, with `failed → pending`
/// via the retrying transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "chunk_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

/// Requested status transition for `update_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTransition {
    Processing,
    Completed,
    Failed,
    /// Resets a failed job back to pending and bumps `retry_count`
    Retrying,
}

/// Whether the lifecycle permits `via` from `current`.
pub fn transition_allowed(current: JobStatus, via: JobTransition) -> bool {
    matches!(
        (current, via),
        (JobStatus::Pending, JobTransition::Processing)
            | (JobStatus::Processing, JobTransition::Completed)
            | (JobStatus::Processing, JobTransition::Failed)
            | (JobStatus::Failed, JobTransition::Retrying)
    )
}

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum JobQueueError {
    /// Foreign-key, range, or unique constraint violated
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("illegal transition: {current:?} via {via:?}")]
    IllegalTransition {
        current: JobStatus,
        via: JobTransition,
    },

    #[error("job not found: {0}")]
    NotFound(Uuid),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("invalid chunk payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JobQueueError>;

/// One durable chunk job.
///
/// `raw_data` preserves the upstream payload verbatim as a JSON array; only
/// the worker decodes the structured view, which keeps the queue generic
/// across upstream APIs.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct ChunkJob {
    pub id: Uuid,
    pub source_id: Uuid,
    pub master_run_id: Uuid,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub raw_data: serde_json::Value,
    pub processing_config: serde_json::Value,
    pub status: JobStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub error_details: Option<serde_json::Value>,
}

impl ChunkJob {
    /// Decode the raw upstream payload.
    pub fn opportunities(&self) -> Result<Vec<Opportunity>> {
        Ok(serde_json::from_value(self.raw_data.clone())?)
    }

    /// Decode the processing configuration, tolerating unknown keys.
    pub fn config(&self) -> ProcessingConfig {
        serde_json::from_value(self.processing_config.clone()).unwrap_or_default()
    }

    /// Number of records in the chunk without a full decode.
    pub fn item_count(&self) -> usize {
        self.raw_data.as_array().map_or(0, Vec::len)
    }
}

/// Parameters for creating a chunk job.
#[derive(Debug, Clone)]
pub struct NewChunkJob {
    pub source_id: Uuid,
    pub master_run_id: Uuid,
    pub chunk_index: i32,
    pub total_chunks: i32,
    pub raw_data: serde_json::Value,
    pub processing_config: serde_json::Value,
    pub max_retries: i32,
}

impl NewChunkJob {
    pub fn validate(&self) -> Result<()> {
        if self.chunk_index < 0 {
            return Err(JobQueueError::Constraint(format!(
                "chunk_index must be non-negative, got {}",
                self.chunk_index
            )));
        }
        if self.total_chunks <= 0 {
            return Err(JobQueueError::Constraint(format!(
                "total_chunks must be positive, got {}",
                self.total_chunks
            )));
        }
        if self.chunk_index >= self.total_chunks {
            return Err(JobQueueError::Constraint(format!(
                "chunk_index {} out of range for {} chunks",
                self.chunk_index, self.total_chunks
            )));
        }
        if !self.raw_data.is_array() {
            return Err(JobQueueError::Constraint(
                "raw_data must be a JSON array".to_string(),
            ));
        }
        Ok(())
    }
}

/// Metric options carried on a status update.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusUpdate {
    pub processing_time_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub estimated_cost_usd: Option<f64>,
    pub error_details: Option<serde_json::Value>,
}

/// Queue-wide counts by status.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Aggregated metrics over one master run.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub processing_time_ms: i64,
    pub tokens_used: i64,
    pub estimated_cost_usd: f64,
}

/// Derived progress for one master run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRunProgress {
    pub total_jobs: u64,
    pub status_counts: StatusCounts,
    pub completion_pct: f64,
    pub is_complete: bool,
    pub has_failures: bool,
    pub aggregated_metrics: AggregatedMetrics,
}

/// Pure aggregation over a master run's jobs.
pub fn aggregate_progress(jobs: &[ChunkJob]) -> MasterRunProgress {
    let mut counts = StatusCounts::default();
    let mut metrics = AggregatedMetrics::default();

    for job in jobs {
        match job.status {
            JobStatus::Pending => counts.pending += 1,
            JobStatus::Processing => counts.processing += 1,
            JobStatus::Completed => counts.completed += 1,
            JobStatus::Failed => counts.failed += 1,
        }
        metrics.processing_time_ms += job.processing_time_ms.unwrap_or(0);
        metrics.tokens_used += job.tokens_used.unwrap_or(0);
        metrics.estimated_cost_usd += job.estimated_cost_usd.unwrap_or(0.0);
    }

    let total = jobs.len() as u64;
    let completion_pct = if total == 0 {
        0.0
    } else {
        (counts.completed as f64 / total as f64) * 100.0
    };

    MasterRunProgress {
        total_jobs: total,
        status_counts: counts,
        completion_pct,
        is_complete: total > 0 && counts.pending == 0 && counts.processing == 0,
        has_failures: counts.failed > 0,
        aggregated_metrics: metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(status: JobStatus) -> ChunkJob {
        ChunkJob {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            master_run_id: Uuid::new_v4(),
            chunk_index: 0,
            total_chunks: 1,
            raw_data: serde_json::json!([]),
            processing_config: serde_json::json!({}),
            status,
            retry_count: 0,
            max_retries: 3,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time_ms: Some(100),
            tokens_used: Some(1_000),
            estimated_cost_usd: Some(0.01),
            error_details: None,
        }
    }

    #[test]
    fn test_lifecycle_legality() {
        assert!(transition_allowed(JobStatus::Pending, JobTransition::Processing));
        assert!(transition_allowed(JobStatus::Processing, JobTransition::Completed));
        assert!(transition_allowed(JobStatus::Processing, JobTransition::Failed));
        assert!(transition_allowed(JobStatus::Failed, JobTransition::Retrying));

        assert!(!transition_allowed(JobStatus::Pending, JobTransition::Completed));
        assert!(!transition_allowed(JobStatus::Completed, JobTransition::Processing));
        assert!(!transition_allowed(JobStatus::Failed, JobTransition::Processing));
        assert!(!transition_allowed(JobStatus::Pending, JobTransition::Retrying));
    }

    #[test]
    fn test_new_job_validation() {
        let mut spec = NewChunkJob {
            source_id: Uuid::new_v4(),
            master_run_id: Uuid::new_v4(),
            chunk_index: 0,
            total_chunks: 3,
            raw_data: serde_json::json!([{"id": "a", "title": "T"}]),
            processing_config: serde_json::json!({}),
            max_retries: 3,
        };
        assert!(spec.validate().is_ok());

        spec.chunk_index = 3;
        assert!(matches!(
            spec.validate(),
            Err(JobQueueError::Constraint(_))
        ));

        spec.chunk_index = -1;
        assert!(spec.validate().is_err());

        spec.chunk_index = 0;
        spec.total_chunks = 0;
        assert!(spec.validate().is_err());

        spec.total_chunks = 1;
        spec.raw_data = serde_json::json!({"not": "an array"});
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_progress_aggregation() {
        let jobs = vec![
            job(JobStatus::Completed),
            job(JobStatus::Completed),
            job(JobStatus::Failed),
            job(JobStatus::Pending),
        ];
        let progress = aggregate_progress(&jobs);

        assert_eq!(progress.total_jobs, 4);
        assert_eq!(progress.status_counts.completed, 2);
        assert_eq!(progress.completion_pct, 50.0);
        assert!(!progress.is_complete);
        assert!(progress.has_failures);
        assert_eq!(progress.aggregated_metrics.tokens_used, 4_000);
    }

    #[test]
    fn test_progress_complete_when_all_terminal() {
        let jobs = vec![job(JobStatus::Completed), job(JobStatus::Failed)];
        let progress = aggregate_progress(&jobs);
        assert!(progress.is_complete);
        assert_eq!(progress.completion_pct, 50.0);
    }

    #[test]
    fn test_empty_progress() {
        let progress = aggregate_progress(&[]);
        assert_eq!(progress.total_jobs, 0);
        assert!(!progress.is_complete);
        assert_eq!(progress.completion_pct, 0.0);
    }

    #[test]
    fn test_chunk_payload_decoding() {
        let mut j = job(JobStatus::Pending);
        j.raw_data = serde_json::json!([
            {"id": "A-1", "title": "First Program", "maximumAward": 1000}
        ]);
        let opps = j.opportunities().unwrap();
        assert_eq!(opps.len(), 1);
        assert_eq!(opps[0].id, "A-1");
        assert_eq!(j.item_count(), 1);

        j.processing_config = serde_json::json!({"chunkProcessing": {"chunkSize": 7}});
        assert_eq!(j.config().chunk_processing.chunk_size, 7);
    }
}
