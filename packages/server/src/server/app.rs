//! Application setup and router configuration.

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use ingestion::{OpportunityStore, RunStore};

use crate::jobs::{ChunkJobStore, JobWorker};
use crate::server::routes::{
    create_test_jobs_handler, health_handler, master_run_progress_handler, process_next_handler,
};

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: PgPool,
    pub jobs: Arc<dyn ChunkJobStore>,
    pub worker: Arc<JobWorker>,
    pub opportunity_store: Arc<dyn OpportunityStore>,
    pub run_store: Arc<dyn RunStore>,
}

/// Build the operator router.
pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/jobs/test", post(create_test_jobs_handler))
        .route("/jobs/process-next", post(process_next_handler))
        .route(
            "/jobs/runs/:master_run_id/progress",
            get(master_run_progress_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
