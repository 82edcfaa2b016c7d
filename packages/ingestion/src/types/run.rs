//! Run-tracking records: per-run, per-stage, and per-opportunity telemetry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Started,
    Processing,
    Completed,
    Failed,
}

/// Aggregate totals for one pipeline run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub opportunities_processed: u64,
    pub opportunities_bypassed_llm: u64,
    pub tokens_used: u64,
    pub api_calls: u64,
    pub estimated_cost_usd: f64,
}

/// One pipeline run, aggregating every chunk that shares a master run id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    pub id: Uuid,
    pub source_id: Uuid,
    pub status: RunStatus,
    pub pipeline_version: String,
    pub configuration: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_execution_ms: u64,
    pub totals: RunTotals,
    pub success_count: u64,
    pub failure_count: u64,
}

impl PipelineRun {
    pub fn new(source_id: Uuid, pipeline_version: &str, configuration: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id,
            status: RunStatus::Started,
            pipeline_version: pipeline_version.to_string(),
            configuration,
            started_at: Utc::now(),
            completed_at: None,
            total_execution_ms: 0,
            totals: RunTotals::default(),
            success_count: 0,
            failure_count: 0,
        }
    }

    /// Throughput in opportunities per minute over the run's wall clock.
    pub fn opportunities_per_minute(&self) -> f64 {
        if self.total_execution_ms == 0 {
            return 0.0;
        }
        self.totals.opportunities_processed as f64 / (self.total_execution_ms as f64 / 60_000.0)
    }

    pub fn tokens_per_opportunity(&self) -> f64 {
        if self.totals.opportunities_processed == 0 {
            return 0.0;
        }
        self.totals.tokens_used as f64 / self.totals.opportunities_processed as f64
    }

    pub fn cost_per_opportunity(&self) -> f64 {
        if self.totals.opportunities_processed == 0 {
            return 0.0;
        }
        self.totals.estimated_cost_usd / self.totals.opportunities_processed as f64
    }

    /// Fraction of processed opportunities that reached a terminal outcome
    /// without failing.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.success_count + self.failure_count;
        if attempted == 0 {
            return 0.0;
        }
        self.success_count as f64 / attempted as f64
    }
}

/// Status of a single stage execution inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    Failed,
}

/// One stage execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStage {
    pub id: Uuid,
    pub run_id: Uuid,
    pub name: String,
    pub stage_order: i32,
    pub status: StageStatus,
    pub input_count: u64,
    pub output_count: u64,
    pub tokens_used: u64,
    pub api_calls: u64,
    pub results: serde_json::Value,
    pub performance: serde_json::Value,
    pub execution_ms: u64,
}

/// The route an opportunity took through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PathType {
    New,
    Update,
    Skip,
}

/// Terminal outcome for an opportunity within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalOutcome {
    Stored,
    Updated,
    Skipped,
    FilteredOut,
    Failed,
}

/// Per-opportunity processing-path record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityPath {
    pub id: Uuid,
    pub run_id: Uuid,
    pub api_opportunity_id: String,
    pub path_type: PathType,
    pub reason: Option<String>,
    pub stages_processed: Vec<String>,
    pub final_outcome: FinalOutcome,
    pub tokens_used: u64,
    pub processing_ms: u64,
    pub cost_usd: f64,
    pub duplicate_detected: bool,
    pub changes_detected: Option<bool>,
    pub detection_method: Option<String>,
    pub quality_score: Option<f64>,
}

impl OpportunityPath {
    pub fn new(
        run_id: Uuid,
        api_opportunity_id: &str,
        path_type: PathType,
        final_outcome: FinalOutcome,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            api_opportunity_id: api_opportunity_id.to_string(),
            path_type,
            reason: None,
            stages_processed: Vec::new(),
            final_outcome,
            tokens_used: 0,
            processing_ms: 0,
            cost_usd: 0.0,
            duplicate_detected: false,
            changes_detected: None,
            detection_method: None,
            quality_score: None,
        }
    }
}

/// Summary counts for one duplicate-detector invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateSession {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source_id: Uuid,
    pub total_records: u64,
    pub new_count: u64,
    pub update_count: u64,
    pub skip_count: u64,
    pub method_counts: serde_json::Value,
    pub estimated_tokens_saved: u64,
    pub query_count: u32,
    pub detection_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_run_metrics() {
        let mut run = PipelineRun::new(Uuid::new_v4(), "1.0", serde_json::json!({}));
        run.totals.opportunities_processed = 30;
        run.totals.tokens_used = 60_000;
        run.totals.estimated_cost_usd = 0.90;
        run.total_execution_ms = 120_000;
        run.success_count = 27;
        run.failure_count = 3;

        assert_eq!(run.opportunities_per_minute(), 15.0);
        assert_eq!(run.tokens_per_opportunity(), 2_000.0);
        assert!((run.cost_per_opportunity() - 0.03).abs() < 1e-9);
        assert_eq!(run.success_rate(), 0.9);
    }

    #[test]
    fn test_empty_run_metrics_are_zero() {
        let run = PipelineRun::new(Uuid::new_v4(), "1.0", serde_json::json!({}));
        assert_eq!(run.opportunities_per_minute(), 0.0);
        assert_eq!(run.tokens_per_opportunity(), 0.0);
        assert_eq!(run.success_rate(), 0.0);
    }
}
