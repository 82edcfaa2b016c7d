//! # Ingestion Library
//!
//! Pipeline for funding-opportunity ingestion: decide what is new, enrich
//! it with an LLM, filter the noise, and persist the survivors - without
//! paying for LLM work on records we have already seen.
//!
//! ## Architecture
//!
//! ```text
//! DETECT → { SKIP | UPDATE | NEW }
//!
//! 1. DuplicateDetector partitions a chunk with two batched lookups
//! 2. SKIP records terminate; UPDATE records take the direct-update path
//! 3. NEW records run content + scoring LLM passes in parallel
//! 4. FilterStage drops low-relevance results
//! 5. StorageStage performs idempotent per-item writes
//! 6. RunTracker records every transition, best-effort
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ingestion::{ChunkProcessor, MemoryStore, RunTracker};
//! use ingestion::testing::MockLlmClient;
//! use ingestion::types::config::ProcessingConfig;
//! use ingestion::types::opportunity::SourceDescriptor;
//!
//! let store = Arc::new(MemoryStore::new());
//! let llm = Arc::new(MockLlmClient::auto());
//! let processor = ChunkProcessor::new(store.clone(), llm);
//!
//! let source = SourceDescriptor::new(uuid::Uuid::new_v4(), "Grants Portal");
//! let tracker = RunTracker::start(store, source.id, serde_json::json!({})).await;
//! let report = processor
//!     .process_chunk(&records, &source, &ProcessingConfig::default(), None, &tracker)
//!     .await?;
//! ```
//!
//! ## Modules
//!
//! - [`traits`] - Contracts the stages are written against (LlmClient, stores)
//! - [`types`] - Domain types (Opportunity, AnalysisResult, run records)
//! - [`pipeline`] - The stages themselves plus the chunk orchestrator
//! - [`stores`] - Storage implementations (MemoryStore, PostgresStore)
//! - [`tracker`] - Best-effort run telemetry
//! - [`testing`] - Mock LLM client and fixtures

pub mod error;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod tracker;
pub mod traits;
pub mod types;

// Re-export core types at crate root
pub use error::{PipelineError, Result};
pub use traits::{
    llm::{BatchPlan, CallTiming, LlmClient, LlmMetrics, SchemaCall, TokenUsage},
    store::{
        CriticalField, OpportunityRow, OpportunityStore, RunStore, UpdatePayload, WriteMode,
        WriteOutcome,
    },
};
pub use types::{
    analysis::{AnalyzedOpportunity, ContentAnalysisItem, Scoring, ScoringAnalysisItem},
    config::{ChunkProcessingConfig, FilterConfig, ProcessingConfig},
    opportunity::{FundingSource, Opportunity, PersistedOpportunity, SourceDescriptor},
    run::{
        DuplicateSession, FinalOutcome, OpportunityPath, PathType, PipelineRun, PipelineStage,
        RunStatus, StageStatus,
    },
};

// Re-export pipeline components
pub use pipeline::{
    analysis::{AnalysisCoordinator, AnalysisOutput},
    change::has_material_changes,
    dedupe::{DetectionMetrics, DetectionOutcome, DuplicateDetector, UpdateCandidate},
    filter::{apply_filter, FilterOutcome},
    freshness::{decide_freshness, titles_match, FreshnessDecision},
    processor::{ChunkProcessor, ChunkReport},
    storage::{StorageOutcome, StorageStage},
    update::{DirectUpdateHandler, UpdateOutcome},
};

// Re-export tracker and stores
pub use stores::MemoryStore;
pub use tracker::RunTracker;

#[cfg(feature = "postgres")]
pub use stores::PostgresStore;
