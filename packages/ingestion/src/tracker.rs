//! Best-effort run tracking.
//!
//! Every write here is telemetry: failures are logged and swallowed so the
//! pipeline never blocks on its own bookkeeping.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::traits::store::RunStore;
use crate::types::run::{
    DuplicateSession, FinalOutcome, OpportunityPath, PipelineRun, PipelineStage, RunStatus,
    StageStatus,
};

/// Version stamp recorded on every run.
pub const PIPELINE_VERSION: &str = "2.0";

pub struct RunTracker {
    store: Arc<dyn RunStore>,
    run: Mutex<PipelineRun>,
    stage_order: Mutex<i32>,
}

impl RunTracker {
    /// Start a new run and record it.
    pub async fn start(
        store: Arc<dyn RunStore>,
        source_id: Uuid,
        configuration: serde_json::Value,
    ) -> Self {
        let run = PipelineRun::new(source_id, PIPELINE_VERSION, configuration);
        if let Err(e) = store.insert_run(&run).await {
            warn!(run_id = %run.id, error = %e, "failed to record pipeline run start");
        }
        Self {
            store,
            run: Mutex::new(run),
            stage_order: Mutex::new(0),
        }
    }

    /// Attach to an existing run (chunk jobs share their master run id).
    pub fn attach(store: Arc<dyn RunStore>, run_id: Uuid, source_id: Uuid) -> Self {
        let mut run = PipelineRun::new(source_id, PIPELINE_VERSION, serde_json::Value::Null);
        run.id = run_id;
        run.status = RunStatus::Processing;
        Self {
            store,
            run: Mutex::new(run),
            stage_order: Mutex::new(0),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.lock().unwrap().id
    }

    /// Record one stage execution.
    pub async fn record_stage(
        &self,
        name: &str,
        status: StageStatus,
        input_count: u64,
        output_count: u64,
        tokens_used: u64,
        api_calls: u64,
        results: serde_json::Value,
        execution_ms: u64,
    ) {
        let stage = {
            let order = {
                let mut order = self.stage_order.lock().unwrap();
                *order += 1;
                *order
            };
            PipelineStage {
                id: Uuid::new_v4(),
                run_id: self.run_id(),
                name: name.to_string(),
                stage_order: order,
                status,
                input_count,
                output_count,
                tokens_used,
                api_calls,
                results,
                performance: serde_json::json!({ "executionMs": execution_ms }),
                execution_ms,
            }
        };
        if let Err(e) = self.store.insert_stage(&stage).await {
            warn!(stage = name, error = %e, "failed to record pipeline stage");
        }
    }

    /// Record the path one opportunity took.
    pub async fn record_path(&self, path: OpportunityPath) {
        let outcome = path.final_outcome;
        if let Err(e) = self.store.insert_path(&path).await {
            warn!(
                api_opportunity_id = %path.api_opportunity_id,
                error = %e,
                "failed to record opportunity path"
            );
        }
        let mut run = self.run.lock().unwrap();
        match outcome {
            FinalOutcome::Failed => run.failure_count += 1,
            _ => run.success_count += 1,
        }
    }

    /// Record one duplicate-detector invocation.
    pub async fn record_duplicate_session(&self, session: DuplicateSession) {
        if let Err(e) = self.store.insert_duplicate_session(&session).await {
            warn!(run_id = %session.run_id, error = %e, "failed to record duplicate session");
        }
    }

    /// Fold chunk-level totals into the run.
    pub fn add_totals(
        &self,
        opportunities_processed: u64,
        bypassed_llm: u64,
        tokens_used: u64,
        api_calls: u64,
        estimated_cost_usd: f64,
        execution_ms: u64,
    ) {
        let mut run = self.run.lock().unwrap();
        run.totals.opportunities_processed += opportunities_processed;
        run.totals.opportunities_bypassed_llm += bypassed_llm;
        run.totals.tokens_used += tokens_used;
        run.totals.api_calls += api_calls;
        run.totals.estimated_cost_usd += estimated_cost_usd;
        run.total_execution_ms += execution_ms;
    }

    /// Mark the run terminal and push the final record.
    pub async fn finish(&self, status: RunStatus) {
        let run = {
            let mut run = self.run.lock().unwrap();
            run.status = status;
            run.completed_at = Some(Utc::now());
            run.clone()
        };
        if let Err(e) = self.store.update_run(&run).await {
            warn!(run_id = %run.id, error = %e, "failed to record pipeline run completion");
        }
    }

    /// Snapshot of the current run record.
    pub fn snapshot(&self) -> PipelineRun {
        self.run.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use crate::types::run::PathType;

    #[tokio::test]
    async fn test_tracker_records_run_and_paths() {
        let store = Arc::new(MemoryStore::new());
        let tracker = RunTracker::start(store.clone(), Uuid::new_v4(), serde_json::json!({})).await;

        tracker
            .record_path(OpportunityPath::new(
                tracker.run_id(),
                "T-1",
                PathType::New,
                FinalOutcome::Stored,
            ))
            .await;
        tracker
            .record_path(OpportunityPath::new(
                tracker.run_id(),
                "T-2",
                PathType::New,
                FinalOutcome::Failed,
            ))
            .await;
        tracker.finish(RunStatus::Completed).await;

        let run = tracker.snapshot();
        assert_eq!(run.success_count, 1);
        assert_eq!(run.failure_count, 1);
        assert_eq!(store.path_count(), 2);
        assert!(store.get_run(run.id).is_some());
    }

    #[tokio::test]
    async fn test_tracker_failures_do_not_block() {
        let store = Arc::new(MemoryStore::new());
        store.set_fail_run_writes(true);
        let tracker = RunTracker::start(store.clone(), Uuid::new_v4(), serde_json::json!({})).await;

        // Writes fail inside the store; the tracker carries on
        tracker
            .record_path(OpportunityPath::new(
                tracker.run_id(),
                "T-3",
                PathType::Skip,
                FinalOutcome::Skipped,
            ))
            .await;
        tracker.finish(RunStatus::Completed).await;
        assert_eq!(tracker.snapshot().success_count, 1);
    }

    #[tokio::test]
    async fn test_stage_order_increments() {
        let store = Arc::new(MemoryStore::new());
        let tracker = RunTracker::start(store.clone(), Uuid::new_v4(), serde_json::json!({})).await;

        tracker
            .record_stage(
                "duplicate_detection",
                StageStatus::Completed,
                5,
                5,
                0,
                0,
                serde_json::json!({}),
                3,
            )
            .await;
        tracker
            .record_stage(
                "analysis",
                StageStatus::Completed,
                2,
                2,
                5000,
                2,
                serde_json::json!({}),
                900,
            )
            .await;

        let stages = store.stages_for_run(tracker.run_id());
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].stage_order, 1);
        assert_eq!(stages[1].stage_order, 2);
    }
}
