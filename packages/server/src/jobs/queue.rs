//! PostgreSQL-backed chunk job queue.
//!
//! Jobs are dequeued strictly FIFO by `created_at` (ties broken by id).
//! Claiming uses `FOR UPDATE SKIP LOCKED` so any number of worker
//! processes can poll the same table: the row-level lock is the lease, not
//! an in-process mutex.

use async_trait::async_trait;
use tracing::{debug, info};
use uuid::Uuid;

use sqlx::postgres::PgPool;

use super::job::{
    ChunkJob, JobQueueError, JobStatus, JobTransition, MasterRunProgress, NewChunkJob, Result,
    StatusCounts, StatusUpdate, aggregate_progress, transition_allowed,
};

const JOB_COLUMNS: &str = r#"
    id, source_id, master_run_id, chunk_index, total_chunks,
    raw_data, processing_config, status, retry_count, max_retries,
    created_at, started_at, completed_at,
    processing_time_ms, tokens_used, estimated_cost_usd, error_details
"#;

/// Storage contract for the chunk job queue.
///
/// The worker and operator routes are written against this trait; the
/// Postgres implementation below is the production backend and an
/// in-memory one backs tests.
#[async_trait]
pub trait ChunkJobStore: Send + Sync {
    /// Create a pending job. Range violations fail locally; foreign-key
    /// violations propagate from the database.
    async fn create_job(&self, spec: NewChunkJob) -> Result<ChunkJob>;

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>>;

    /// Peek the next pending job without claiming it.
    async fn get_next_pending_job(&self) -> Result<Option<ChunkJob>>;

    /// Atomically claim the next pending job and transition it to
    /// processing. Returns `None` when the queue is empty.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<ChunkJob>>;

    /// Apply a lifecycle transition with optional metrics.
    async fn update_status(
        &self,
        job_id: Uuid,
        via: JobTransition,
        update: StatusUpdate,
    ) -> Result<ChunkJob>;

    /// All jobs for one master run, ordered by chunk index.
    async fn get_jobs_by_master_run(&self, master_run_id: Uuid) -> Result<Vec<ChunkJob>>;

    /// Reset failed jobs with retries remaining back to pending.
    async fn retry_failed_jobs(&self, max_retries: i32) -> Result<Vec<ChunkJob>>;

    /// Delete completed jobs older than the cutoff. Returns rows removed.
    async fn cleanup_old_jobs(&self, older_than_days: i64) -> Result<u64>;

    async fn queue_counts(&self) -> Result<StatusCounts>;
}

/// Derived progress for a master run, built on `get_jobs_by_master_run`.
pub async fn master_run_progress(
    store: &dyn ChunkJobStore,
    master_run_id: Uuid,
) -> Result<MasterRunProgress> {
    let jobs = store.get_jobs_by_master_run(master_run_id).await?;
    Ok(aggregate_progress(&jobs))
}

pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    /// Bootstrap the queue schema on an existing pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let queue = Self { pool };
        queue.run_migrations().await?;
        Ok(queue)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            DO $$ BEGIN
                CREATE TYPE chunk_job_status AS ENUM
                    ('pending', 'processing', 'completed', 'failed');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processing_jobs (
                id UUID PRIMARY KEY,
                source_id UUID NOT NULL REFERENCES funding_sources(id),
                master_run_id UUID NOT NULL REFERENCES pipeline_runs(id),
                chunk_index INT NOT NULL CHECK (chunk_index >= 0),
                total_chunks INT NOT NULL CHECK (total_chunks >= 1),
                raw_data JSONB NOT NULL DEFAULT '[]',
                processing_config JSONB NOT NULL DEFAULT '{}',
                status chunk_job_status NOT NULL DEFAULT 'pending',
                retry_count INT NOT NULL DEFAULT 0,
                max_retries INT NOT NULL DEFAULT 3,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                started_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                processing_time_ms BIGINT,
                tokens_used BIGINT,
                estimated_cost_usd DOUBLE PRECISION,
                error_details JSONB,
                CHECK (chunk_index < total_chunks),
                CHECK (retry_count <= max_retries)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processing_jobs_pending \
             ON processing_jobs (created_at, id) WHERE status = 'pending'",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_processing_jobs_master_run \
             ON processing_jobs (master_run_id, chunk_index)",
        )
        .execute(&self.pool)
        .await?;

        debug!("queue schema bootstrapped");
        Ok(())
    }
}

fn map_fk_violation(err: sqlx::Error) -> JobQueueError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23503") {
            return JobQueueError::Constraint(format!("unknown reference: {}", db.message()));
        }
        if db.code().as_deref() == Some("23514") {
            return JobQueueError::Constraint(format!("check failed: {}", db.message()));
        }
    }
    JobQueueError::Database(err)
}

#[async_trait]
impl ChunkJobStore for PostgresJobQueue {
    async fn create_job(&self, spec: NewChunkJob) -> Result<ChunkJob> {
        spec.validate()?;

        let sql = format!(
            r#"
            INSERT INTO processing_jobs (
                id, source_id, master_run_id, chunk_index, total_chunks,
                raw_data, processing_config, max_retries
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let job = sqlx::query_as::<_, ChunkJob>(&sql)
            .bind(Uuid::new_v4())
            .bind(spec.source_id)
            .bind(spec.master_run_id)
            .bind(spec.chunk_index)
            .bind(spec.total_chunks)
            .bind(&spec.raw_data)
            .bind(&spec.processing_config)
            .bind(spec.max_retries)
            .fetch_one(&self.pool)
            .await
            .map_err(map_fk_violation)?;

        debug!(
            job_id = %job.id,
            chunk_index = job.chunk_index,
            total_chunks = job.total_chunks,
            "chunk job created"
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<ChunkJob>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM processing_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, ChunkJob>(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn get_next_pending_job(&self) -> Result<Option<ChunkJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs \
             WHERE status = 'pending' ORDER BY created_at, id LIMIT 1"
        );
        Ok(sqlx::query_as::<_, ChunkJob>(&sql)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<ChunkJob>> {
        let sql = format!(
            r#"
            UPDATE processing_jobs
            SET status = 'processing', started_at = NOW()
            WHERE id = (
                SELECT id FROM processing_jobs
                WHERE status = 'pending'
                ORDER BY created_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let job = sqlx::query_as::<_, ChunkJob>(&sql)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(job) = &job {
            info!(job_id = %job.id, worker_id, "claimed chunk job");
        }
        Ok(job)
    }

    async fn update_status(
        &self,
        job_id: Uuid,
        via: JobTransition,
        update: StatusUpdate,
    ) -> Result<ChunkJob> {
        let current = self
            .get_job(job_id)
            .await?
            .ok_or(JobQueueError::NotFound(job_id))?;

        if !transition_allowed(current.status, via) {
            return Err(JobQueueError::IllegalTransition {
                current: current.status,
                via,
            });
        }

        let sql = match via {
            JobTransition::Processing => format!(
                "UPDATE processing_jobs SET status = 'processing', started_at = NOW() \
                 WHERE id = $1 AND status = 'pending' RETURNING {JOB_COLUMNS}"
            ),
            JobTransition::Completed => format!(
                r#"
                UPDATE processing_jobs SET
                    status = 'completed',
                    completed_at = NOW(),
                    processing_time_ms = $2,
                    tokens_used = $3,
                    estimated_cost_usd = $4
                WHERE id = $1 AND status = 'processing'
                RETURNING {JOB_COLUMNS}
                "#
            ),
            JobTransition::Failed => format!(
                r#"
                UPDATE processing_jobs SET
                    status = 'failed',
                    completed_at = NOW(),
                    processing_time_ms = $2,
                    tokens_used = $3,
                    estimated_cost_usd = $4,
                    error_details = $5
                WHERE id = $1 AND status = 'processing'
                RETURNING {JOB_COLUMNS}
                "#
            ),
            JobTransition::Retrying => format!(
                r#"
                UPDATE processing_jobs SET
                    status = 'pending',
                    started_at = NULL,
                    completed_at = NULL,
                    error_details = NULL,
                    retry_count = retry_count + 1
                WHERE id = $1 AND status = 'failed' AND retry_count < max_retries
                RETURNING {JOB_COLUMNS}
                "#
            ),
        };

        let mut query = sqlx::query_as::<_, ChunkJob>(&sql).bind(job_id);
        match via {
            JobTransition::Completed => {
                query = query
                    .bind(update.processing_time_ms)
                    .bind(update.tokens_used)
                    .bind(update.estimated_cost_usd);
            }
            JobTransition::Failed => {
                query = query
                    .bind(update.processing_time_ms)
                    .bind(update.tokens_used)
                    .bind(update.estimated_cost_usd)
                    .bind(&update.error_details);
            }
            _ => {}
        }

        // A concurrent transition can win the race between the read above
        // and this write; the status guard in the WHERE clause surfaces
        // that as a no-op
        query
            .fetch_optional(&self.pool)
            .await
            .map_err(map_fk_violation)?
            .ok_or(JobQueueError::IllegalTransition {
                current: current.status,
                via,
            })
    }

    async fn get_jobs_by_master_run(&self, master_run_id: Uuid) -> Result<Vec<ChunkJob>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM processing_jobs \
             WHERE master_run_id = $1 ORDER BY chunk_index"
        );
        Ok(sqlx::query_as::<_, ChunkJob>(&sql)
            .bind(master_run_id)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn retry_failed_jobs(&self, max_retries: i32) -> Result<Vec<ChunkJob>> {
        let sql = format!(
            r#"
            UPDATE processing_jobs SET
                status = 'pending',
                started_at = NULL,
                completed_at = NULL,
                error_details = NULL,
                retry_count = retry_count + 1
            WHERE status = 'failed' AND retry_count < $1
            RETURNING {JOB_COLUMNS}
            "#
        );
        let jobs = sqlx::query_as::<_, ChunkJob>(&sql)
            .bind(max_retries)
            .fetch_all(&self.pool)
            .await?;

        if !jobs.is_empty() {
            info!(count = jobs.len(), "reset failed jobs for retry");
        }
        Ok(jobs)
    }

    async fn cleanup_old_jobs(&self, older_than_days: i64) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM processing_jobs \
             WHERE status = 'completed' \
               AND completed_at < NOW() - ($1 || ' days')::INTERVAL",
        )
        .bind(older_than_days.to_string())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if deleted > 0 {
            info!(deleted, older_than_days, "cleaned up completed jobs");
        }
        Ok(deleted)
    }

    async fn queue_counts(&self) -> Result<StatusCounts> {
        let rows: Vec<(JobStatus, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM processing_jobs GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for (status, count) in rows {
            match status {
                JobStatus::Pending => counts.pending = count as u64,
                JobStatus::Processing => counts.processing = count as u64,
                JobStatus::Completed => counts.completed = count as u64,
                JobStatus::Failed => counts.failed = count as u64,
            }
        }
        Ok(counts)
    }
}
