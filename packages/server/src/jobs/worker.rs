//! Chunk job worker.
//!
//! A long-running service that claims jobs from the queue, hands the
//! decoded chunk to the pipeline, and writes the terminal status back.
//! Each worker owns one job at a time; the claim's status transition is
//! the lease, so any number of worker processes can share a queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ingestion::types::config::ProcessingConfig;
use ingestion::{ChunkProcessor, ChunkReport, LlmClient, OpportunityStore, RunStore, RunTracker, SourceDescriptor};

use super::job::{ChunkJob, JobTransition, StatusUpdate};
use super::queue::ChunkJobStore;

/// Worker tuning knobs.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Sleep when the queue is empty (lower bound)
    pub min_poll_interval: Duration,
    /// Sleep ceiling after repeated empty polls
    pub max_poll_interval: Duration,
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            min_poll_interval: Duration::from_millis(250),
            max_poll_interval: Duration::from_secs(15),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Handler for one claimed chunk job.
///
/// Split from the worker so queue mechanics are testable without the full
/// pipeline behind them.
#[async_trait]
pub trait ChunkHandler: Send + Sync {
    async fn process(&self, job: &ChunkJob) -> Result<ChunkReport>;
}

/// Production handler: decode the chunk and run it through the pipeline.
pub struct PipelineChunkHandler {
    store: Arc<dyn OpportunityStore>,
    run_store: Arc<dyn RunStore>,
    llm: Arc<dyn LlmClient>,
}

impl PipelineChunkHandler {
    pub fn new(
        store: Arc<dyn OpportunityStore>,
        run_store: Arc<dyn RunStore>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            store,
            run_store,
            llm,
        }
    }
}

#[async_trait]
impl ChunkHandler for PipelineChunkHandler {
    async fn process(&self, job: &ChunkJob) -> Result<ChunkReport> {
        let records = job
            .opportunities()
            .context("chunk raw_data does not decode to opportunities")?;
        let config: ProcessingConfig = job.config();

        let source = match self.store.get_funding_source(job.source_id).await? {
            Some(record) => {
                let mut descriptor = SourceDescriptor::new(record.id, record.name);
                descriptor.agency = record.agency;
                descriptor.website = record.website;
                descriptor.contact_email = record.contact_email;
                descriptor.contact_phone = record.contact_phone;
                descriptor
            }
            None => anyhow::bail!("unknown funding source {}", job.source_id),
        };

        let tracker = RunTracker::attach(self.run_store.clone(), job.master_run_id, job.source_id);
        let processor = ChunkProcessor::new(self.store.clone(), self.llm.clone());

        let report = processor
            .process_chunk(&records, &source, &config, None, &tracker)
            .await?;
        Ok(report)
    }
}

/// Outcome of one worker tick, shaped for the operator surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessNextResult {
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_index: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_chunks: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<Utc>,
}

impl ProcessNextResult {
    fn empty_queue() -> Self {
        Self {
            processed: false,
            job_id: None,
            chunk_index: None,
            total_chunks: None,
            processing_time_ms: None,
            items_processed: None,
            message: Some("No jobs in queue".to_string()),
            timestamp: Utc::now(),
        }
    }
}

pub struct JobWorker {
    store: Arc<dyn ChunkJobStore>,
    handler: Arc<dyn ChunkHandler>,
    config: JobWorkerConfig,
}

impl JobWorker {
    pub fn new(store: Arc<dyn ChunkJobStore>, handler: Arc<dyn ChunkHandler>) -> Self {
        Self {
            store,
            handler,
            config: JobWorkerConfig::default(),
        }
    }

    pub fn with_config(
        store: Arc<dyn ChunkJobStore>,
        handler: Arc<dyn ChunkHandler>,
        config: JobWorkerConfig,
    ) -> Self {
        Self {
            store,
            handler,
            config,
        }
    }

    /// Claim and process at most one job. The operator surface and the
    /// polling loop both come through here.
    pub async fn process_next(&self) -> Result<ProcessNextResult> {
        let Some(job) = self.store.claim_next(&self.config.worker_id).await? else {
            return Ok(ProcessNextResult::empty_queue());
        };

        let started = std::time::Instant::now();
        let timeout = Duration::from_millis(job.config().chunk_processing.timeout_ms);

        let outcome = tokio::time::timeout(timeout, self.handler.process(&job)).await;
        let processing_time_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(Ok(report)) => {
                self.store
                    .update_status(
                        job.id,
                        JobTransition::Completed,
                        StatusUpdate {
                            processing_time_ms: Some(processing_time_ms),
                            tokens_used: Some(report.tokens_used as i64),
                            estimated_cost_usd: Some(report.estimated_cost_usd),
                            error_details: None,
                        },
                    )
                    .await?;

                info!(
                    job_id = %job.id,
                    chunk_index = job.chunk_index,
                    items = report.items_processed,
                    processing_time_ms,
                    "chunk job completed"
                );

                Ok(ProcessNextResult {
                    processed: true,
                    job_id: Some(job.id),
                    chunk_index: Some(job.chunk_index),
                    total_chunks: Some(job.total_chunks),
                    processing_time_ms: Some(processing_time_ms),
                    items_processed: Some(report.items_processed),
                    message: None,
                    timestamp: Utc::now(),
                })
            }
            Ok(Err(e)) => {
                warn!(job_id = %job.id, error = %e, "chunk job failed");
                self.mark_failed(&job, processing_time_ms, &format!("{e:#}"))
                    .await?;
                Ok(ProcessNextResult {
                    processed: true,
                    job_id: Some(job.id),
                    chunk_index: Some(job.chunk_index),
                    total_chunks: Some(job.total_chunks),
                    processing_time_ms: Some(processing_time_ms),
                    items_processed: None,
                    message: Some(format!("job failed: {e}")),
                    timestamp: Utc::now(),
                })
            }
            Err(_) => {
                warn!(job_id = %job.id, timeout_ms = timeout.as_millis() as u64, "chunk job timed out");
                self.mark_failed(&job, processing_time_ms, "chunk processing timed out")
                    .await?;
                Ok(ProcessNextResult {
                    processed: true,
                    job_id: Some(job.id),
                    chunk_index: Some(job.chunk_index),
                    total_chunks: Some(job.total_chunks),
                    processing_time_ms: Some(processing_time_ms),
                    items_processed: None,
                    message: Some("job failed: timeout".to_string()),
                    timestamp: Utc::now(),
                })
            }
        }
    }

    async fn mark_failed(&self, job: &ChunkJob, processing_time_ms: i64, message: &str) -> Result<()> {
        self.store
            .update_status(
                job.id,
                JobTransition::Failed,
                StatusUpdate {
                    processing_time_ms: Some(processing_time_ms),
                    tokens_used: None,
                    estimated_cost_usd: None,
                    error_details: Some(serde_json::json!({
                        "message": message,
                        "retryCount": job.retry_count,
                    })),
                },
            )
            .await?;
        Ok(())
    }

    /// Polling loop until shutdown. Backs off toward `max_poll_interval`
    /// while the queue stays empty.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(worker_id = %self.config.worker_id, "job worker starting");
        let mut idle_interval = self.config.min_poll_interval;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.process_next().await {
                Ok(result) if result.processed => {
                    idle_interval = self.config.min_poll_interval;
                }
                Ok(_) => {
                    debug!(worker_id = %self.config.worker_id, "queue empty");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(idle_interval) => {}
                    }
                    idle_interval = (idle_interval * 2).min(self.config.max_poll_interval);
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "worker tick failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }
}

/// Periodic queue maintenance: re-queue retryable failures and enforce
/// retention on completed jobs.
pub async fn run_maintenance(
    store: Arc<dyn ChunkJobStore>,
    max_retries: i32,
    retention_days: i64,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        match store.retry_failed_jobs(max_retries).await {
            Ok(jobs) if !jobs.is_empty() => {
                info!(count = jobs.len(), "requeued failed jobs");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retry sweep failed"),
        }

        if let Err(e) = store.cleanup_old_jobs(retention_days).await {
            warn!(error = %e, "cleanup sweep failed");
        }
    }
}
