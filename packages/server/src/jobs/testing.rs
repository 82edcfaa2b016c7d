//! In-memory chunk job store for tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use uuid::Uuid;

use super::job::{
    ChunkJob, JobQueueError, JobStatus, JobTransition, NewChunkJob, Result, StatusCounts,
    StatusUpdate, transition_allowed,
};
use super::queue::ChunkJobStore;

/// Queue semantics without a database: FIFO by `created_at` (ties by id),
/// lifecycle enforcement, retry resets, retention cleanup.
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<Vec<ChunkJob>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl ChunkJobStore for MemoryJobQueue {
    async fn create_job(&self, spec: NewChunkJob) -> Result<ChunkJob> {
        spec.validate()?;
        let job = ChunkJob {
            id: Uuid::new_v4(),
            source_id: spec.source_id,
            master_run_id: spec.master_run_id,
            chunk_index: spec.chunk_index,
            total_chunks: spec.total_chunks,
            raw_data: spec.raw_data,
            processing_config: spec.processing_config,
            status: JobStatus::Pending,
            retry_count: 0,
            max_retries: spec.max_retries,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
            tokens_used: None,
            estimated_cost_usd: None,
            error_details: None,
        };
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn get_next_pending_job(&self) -> Result<Option<ChunkJob>> {
        let jobs = self.jobs.lock().unwrap();
        Ok(jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn claim_next(&self, _worker_id: &str) -> Result<Option<ChunkJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let next = jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| (j.created_at, j.id));

        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.started_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        via: JobTransition,
        update: StatusUpdate,
    ) -> Result<ChunkJob> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(JobQueueError::NotFound(job_id))?;

        if !transition_allowed(job.status, via) {
            return Err(JobQueueError::IllegalTransition {
                current: job.status,
                via,
            });
        }

        match via {
            JobTransition::Processing => {
                job.status = JobStatus::Processing;
                job.started_at = Some(Utc::now());
            }
            JobTransition::Completed => {
                job.status = JobStatus::Completed;
                job.completed_at = Some(Utc::now());
                job.processing_time_ms = update.processing_time_ms;
                job.tokens_used = update.tokens_used;
                job.estimated_cost_usd = update.estimated_cost_usd;
            }
            JobTransition::Failed => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(Utc::now());
                job.processing_time_ms = update.processing_time_ms;
                job.tokens_used = update.tokens_used;
                job.estimated_cost_usd = update.estimated_cost_usd;
                job.error_details = update.error_details;
            }
            JobTransition::Retrying => {
                if job.retry_count >= job.max_retries {
                    return Err(JobQueueError::Constraint(
                        "retry_count exhausted".to_string(),
                    ));
                }
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.completed_at = None;
                job.error_details = None;
                job.retry_count += 1;
            }
        }
        Ok(job.clone())
    }

    async fn get_jobs_by_master_run(&self, master_run_id: Uuid) -> Result<Vec<ChunkJob>> {
        let mut jobs: Vec<ChunkJob> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| j.master_run_id == master_run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.chunk_index);
        Ok(jobs)
    }

    async fn retry_failed_jobs(&self, max_retries: i32) -> Result<Vec<ChunkJob>> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut reset = Vec::new();
        for job in jobs.iter_mut() {
            if job.status == JobStatus::Failed && job.retry_count < max_retries {
                job.status = JobStatus::Pending;
                job.started_at = None;
                job.completed_at = None;
                job.error_details = None;
                job.retry_count += 1;
                reset.push(job.clone());
            }
        }
        Ok(reset)
    }

    async fn cleanup_old_jobs(&self, older_than_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(older_than_days);
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| {
            !(j.status == JobStatus::Completed
                && j.completed_at.is_some_and(|done| done < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn queue_counts(&self) -> Result<StatusCounts> {
        let jobs = self.jobs.lock().unwrap();
        let mut counts = StatusCounts::default();
        for job in jobs.iter() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(master_run_id: Uuid, chunk_index: i32, total: i32) -> NewChunkJob {
        NewChunkJob {
            source_id: Uuid::new_v4(),
            master_run_id,
            chunk_index,
            total_chunks: total,
            raw_data: serde_json::json!([]),
            processing_config: serde_json::json!({}),
            max_retries: 3,
        }
    }

    #[tokio::test]
    async fn test_fifo_claim_order() {
        let queue = MemoryJobQueue::new();
        let run = Uuid::new_v4();
        let first = queue.create_job(spec(run, 0, 3)).await.unwrap();
        let second = queue.create_job(spec(run, 1, 3)).await.unwrap();

        let peeked = queue.get_next_pending_job().await.unwrap().unwrap();
        assert_eq!(peeked.id, first.id);
        assert_eq!(peeked.status, JobStatus::Pending);

        let claimed = queue.claim_next("w-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Processing);
        assert!(claimed.started_at.is_some());

        let claimed = queue.claim_next("w-1").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(queue.claim_next("w-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_resets_lifecycle_fields() {
        let queue = MemoryJobQueue::new();
        let job = queue.create_job(spec(Uuid::new_v4(), 0, 1)).await.unwrap();

        queue.claim_next("w-1").await.unwrap();
        queue
            .update_status(
                job.id,
                JobTransition::Failed,
                StatusUpdate {
                    error_details: Some(serde_json::json!({"message": "boom"})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let retried = queue
            .update_status(job.id, JobTransition::Retrying, StatusUpdate::default())
            .await
            .unwrap();

        assert_eq!(retried.status, JobStatus::Pending);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.started_at.is_none());
        assert!(retried.completed_at.is_none());
        assert!(retried.error_details.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let queue = MemoryJobQueue::new();
        let job = queue.create_job(spec(Uuid::new_v4(), 0, 1)).await.unwrap();

        let err = queue
            .update_status(job.id, JobTransition::Completed, StatusUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, JobQueueError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_only_removes_old_completed() {
        let queue = MemoryJobQueue::new();
        let job = queue.create_job(spec(Uuid::new_v4(), 0, 1)).await.unwrap();
        queue.claim_next("w-1").await.unwrap();
        queue
            .update_status(job.id, JobTransition::Completed, StatusUpdate::default())
            .await
            .unwrap();

        // Completed just now: retention keeps it
        assert_eq!(queue.cleanup_old_jobs(30).await.unwrap(), 0);

        // Backdate completion past the cutoff
        {
            let mut jobs = queue.jobs.lock().unwrap();
            jobs[0].completed_at = Some(Utc::now() - Duration::days(45));
        }
        assert_eq!(queue.cleanup_old_jobs(30).await.unwrap(), 1);
        assert_eq!(queue.job_count(), 0);
    }
}
