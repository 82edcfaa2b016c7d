// Main entry point for the ingestion server

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ingestion::testing::MockLlmClient;
use ingestion::{LlmClient, OpportunityStore, PostgresStore, RunStore};
use server_core::jobs::{
    run_maintenance, ChunkJobStore, JobWorker, JobWorkerConfig, PipelineChunkHandler,
    PostgresJobQueue,
};
use server_core::server::{build_app, AppState};
use server_core::Config;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,ingestion=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting funding-opportunity ingestion server");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    // Pipeline tables first; the queue references funding_sources and
    // pipeline_runs
    let pipeline_store = Arc::new(
        PostgresStore::from_pool(pool.clone())
            .await
            .context("Failed to bootstrap pipeline schema")?,
    );
    let job_queue: Arc<dyn ChunkJobStore> = Arc::new(
        PostgresJobQueue::from_pool(pool.clone())
            .await
            .context("Failed to bootstrap queue schema")?,
    );
    tracing::info!("Database ready");

    let opportunity_store: Arc<dyn OpportunityStore> = pipeline_store.clone();
    let run_store: Arc<dyn RunStore> = pipeline_store.clone();

    // The real provider client plugs in here; until one is configured the
    // deterministic stub keeps the pipeline drivable end to end
    if config.llm_api_key.is_none() {
        tracing::warn!("LLM_API_KEY not set; using the deterministic stub client");
    }
    let llm: Arc<dyn LlmClient> = Arc::new(MockLlmClient::auto());

    let handler = Arc::new(PipelineChunkHandler::new(
        opportunity_store.clone(),
        run_store.clone(),
        llm,
    ));

    let shutdown = CancellationToken::new();
    let mut worker_handles = Vec::with_capacity(config.worker_count);
    for index in 0..config.worker_count {
        let worker = JobWorker::with_config(
            job_queue.clone(),
            handler.clone(),
            JobWorkerConfig::with_worker_id(format!("worker-{index}")),
        );
        worker_handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }
    tracing::info!(worker_count = config.worker_count, "worker pool started");

    tokio::spawn(run_maintenance(
        job_queue.clone(),
        3,
        config.job_retention_days,
        std::time::Duration::from_secs(300),
        shutdown.clone(),
    ));

    // One shared worker instance backs the operator endpoint
    let operator_worker = Arc::new(JobWorker::with_config(
        job_queue.clone(),
        handler,
        JobWorkerConfig::with_worker_id("operator"),
    ));

    let app = build_app(AppState {
        db_pool: pool,
        jobs: job_queue,
        worker: operator_worker,
        opportunity_store,
        run_store,
    });

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {addr}");
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutdown signal received");
                shutdown.cancel();
            }
        })
        .await
        .context("Server error")?;

    for handle in worker_handles {
        let _ = handle.await;
    }
    tracing::info!("ingestion server stopped");

    Ok(())
}
