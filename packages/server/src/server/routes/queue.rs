//! Operator surface for the chunk job queue.

use std::sync::Arc;

use axum::{extract::Path, extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::error;
use uuid::Uuid;

use ingestion::{OpportunityStore, RunStore, RunTracker, SourceDescriptor};

use crate::jobs::{
    master_run_progress, ChunkJobStore, MasterRunProgress, NewChunkJob, ProcessNextResult,
    StatusCounts,
};
use crate::server::app::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestJobsRequest {
    #[serde(default = "default_num_jobs")]
    pub num_jobs: usize,
}

fn default_num_jobs() -> usize {
    3
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestJobsResponse {
    pub master_run_id: Uuid,
    pub source_id: Uuid,
    pub job_ids: Vec<Uuid>,
    pub queue_status: StatusCounts,
}

type HandlerError = (StatusCode, String);

fn internal_error(err: impl std::fmt::Display) -> HandlerError {
    error!(error = %err, "queue route failed");
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Seed `num_jobs` pending jobs from synthetic chunks.
///
/// Creates the backing funding source and pipeline run so the jobs satisfy
/// their foreign keys, then enqueues one chunk per job.
pub async fn seed_test_jobs(
    jobs: &dyn ChunkJobStore,
    opportunity_store: &Arc<dyn OpportunityStore>,
    run_store: &Arc<dyn RunStore>,
    num_jobs: usize,
) -> anyhow::Result<(Uuid, Uuid, Vec<Uuid>)> {
    let source = SourceDescriptor::new(Uuid::new_v4(), "Synthetic Test Source");
    let source_id = opportunity_store.resolve_funding_source(&source).await?;

    let tracker = RunTracker::start(
        run_store.clone(),
        source_id,
        serde_json::json!({"synthetic": true, "numJobs": num_jobs}),
    )
    .await;
    let master_run_id = tracker.run_id();

    let total_chunks = num_jobs.max(1) as i32;
    let mut job_ids = Vec::with_capacity(num_jobs);
    for index in 0..total_chunks {
        let suffix = Uuid::new_v4().simple().to_string();
        let raw_data = serde_json::json!([
            {
                "id": format!("TEST-{index}-A-{suffix}"),
                "title": format!("Synthetic Research Grant {index}-A"),
                "description": "Synthetic opportunity used for queue verification",
                "minimumAward": 10_000,
                "maximumAward": 250_000,
            },
            {
                "id": format!("TEST-{index}-B-{suffix}"),
                "title": format!("Synthetic Infrastructure Grant {index}-B"),
                "maximumAward": 1_000_000,
            }
        ]);

        let job = jobs
            .create_job(NewChunkJob {
                source_id,
                master_run_id,
                chunk_index: index,
                total_chunks,
                raw_data,
                processing_config: serde_json::json!({
                    "chunkProcessing": {"chunkSize": 5, "timeoutMs": 300_000}
                }),
                max_retries: 3,
            })
            .await?;
        job_ids.push(job.id);
    }

    Ok((master_run_id, source_id, job_ids))
}

/// POST /jobs/test
pub async fn create_test_jobs_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateTestJobsRequest>,
) -> Result<Json<CreateTestJobsResponse>, HandlerError> {
    let (master_run_id, source_id, job_ids) = seed_test_jobs(
        state.jobs.as_ref(),
        &state.opportunity_store,
        &state.run_store,
        request.num_jobs,
    )
    .await
    .map_err(internal_error)?;

    let queue_status = state.jobs.queue_counts().await.map_err(internal_error)?;

    Ok(Json(CreateTestJobsResponse {
        master_run_id,
        source_id,
        job_ids,
        queue_status,
    }))
}

/// POST /jobs/process-next
pub async fn process_next_handler(
    State(state): State<AppState>,
) -> Result<Json<ProcessNextResult>, HandlerError> {
    let result = state.worker.process_next().await.map_err(internal_error)?;
    Ok(Json(result))
}

/// GET /jobs/runs/{master_run_id}/progress
pub async fn master_run_progress_handler(
    State(state): State<AppState>,
    Path(master_run_id): Path<Uuid>,
) -> Result<Json<MasterRunProgress>, HandlerError> {
    let progress = master_run_progress(state.jobs.as_ref(), master_run_id)
        .await
        .map_err(internal_error)?;
    Ok(Json(progress))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::testing::MemoryJobQueue;
    use ingestion::MemoryStore;

    #[tokio::test]
    async fn test_seed_test_jobs_creates_pending_chunks() {
        let jobs = MemoryJobQueue::new();
        let store = Arc::new(MemoryStore::new());
        let opportunity_store: Arc<dyn OpportunityStore> = store.clone();
        let run_store: Arc<dyn RunStore> = store.clone();

        let (master_run_id, _source_id, job_ids) =
            seed_test_jobs(&jobs, &opportunity_store, &run_store, 3)
                .await
                .unwrap();

        assert_eq!(job_ids.len(), 3);
        assert!(store.get_run(master_run_id).is_some());

        let run_jobs = jobs.get_jobs_by_master_run(master_run_id).await.unwrap();
        assert_eq!(run_jobs.len(), 3);
        for (index, job) in run_jobs.iter().enumerate() {
            assert_eq!(job.chunk_index, index as i32);
            assert_eq!(job.total_chunks, 3);
            assert_eq!(job.item_count(), 2);
        }

        let counts = jobs.queue_counts().await.unwrap();
        assert_eq!(counts.pending, 3);
    }
}
