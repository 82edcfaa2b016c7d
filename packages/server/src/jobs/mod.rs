//! Durable chunk job queue and worker.

pub mod job;
pub mod queue;
pub mod testing;
pub mod worker;

pub use job::{
    AggregatedMetrics, ChunkJob, JobQueueError, JobStatus, JobTransition, MasterRunProgress,
    NewChunkJob, StatusCounts, StatusUpdate, aggregate_progress, transition_allowed,
};
pub use queue::{ChunkJobStore, PostgresJobQueue, master_run_progress};
pub use testing::MemoryJobQueue;
pub use worker::{
    ChunkHandler, JobWorker, JobWorkerConfig, PipelineChunkHandler, ProcessNextResult,
    run_maintenance,
};
