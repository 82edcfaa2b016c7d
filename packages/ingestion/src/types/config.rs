//! Pipeline configuration carried on each chunk job.

use serde::{Deserialize, Serialize};

/// Fixed token budget assumed per opportunity when estimating how much LLM
/// work a bypass saved.
pub const TOKENS_PER_OPPORTUNITY: u64 = 2_500;

/// Staleness window for the freshness decision, in days.
pub const STALE_REVIEW_DAYS: i64 = 90;

/// Configuration decoded from a chunk job's `processing_config` payload.
///
/// Unknown keys are tolerated so the queue stays generic across upstream
/// APIs; only the consumer decodes the structured view.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessingConfig {
    pub chunk_processing: ChunkProcessingConfig,
    pub filter: FilterConfig,
    /// Upsert instead of insert at the storage stage
    pub force_full_processing: bool,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_processing: ChunkProcessingConfig::default(),
            filter: FilterConfig::default(),
            force_full_processing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkProcessingConfig {
    /// Records per chunk job
    pub chunk_size: usize,
    /// Overall per-job timeout
    pub timeout_ms: u64,
}

impl Default for ChunkProcessingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 5,
            timeout_ms: 300_000,
        }
    }
}

/// Filter-stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterConfig {
    /// Exclude when two or more core score components are zero
    pub exclude_if_two_zeros: bool,
    pub enable_logging: bool,
    pub log_level: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            exclude_if_two_zeros: true,
            enable_logging: true,
            log_level: "info".to_string(),
        }
    }
}
