//! LLM provider contract.
//!
//! The pipeline never talks to a concrete provider directly; the analysis
//! coordinator is written against this trait. Implementations wrap a
//! specific provider and own prompting transport, timeouts, and schema
//! enforcement. The crate ships a scripted mock in [`crate::testing`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Token accounting for one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// Timing breakdown for one provider call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CallTiming {
    pub total_ms: u64,
    pub api_call_ms: u64,
    pub validation_ms: u64,
}

/// Result of a schema-constrained provider call.
///
/// `data` is whatever the provider returned for the schemaed field: a parsed
/// array, a wrapper object, or a raw string the caller must coerce.
#[derive(Debug, Clone)]
pub struct SchemaCall {
    pub data: serde_json::Value,
    pub usage: TokenUsage,
    pub performance: CallTiming,
}

/// Batch sizing recommendation derived from model capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPlan {
    pub batch_size: usize,
    pub max_tokens: u32,
    pub model_name: String,
    pub model_capacity: u32,
    pub tokens_per_opportunity: u32,
    pub base_tokens: u32,
    pub reason: String,
}

/// Cumulative client-side metrics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmMetrics {
    pub total_tokens: u64,
    pub total_calls: u64,
    pub average_latency_ms: f64,
}

/// Contract every LLM provider client must satisfy.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issue one schema-constrained call.
    async fn call_with_schema(
        &self,
        prompt: &str,
        json_schema: &serde_json::Value,
    ) -> Result<SchemaCall>;

    /// Issue several schema-constrained calls with bounded concurrency.
    ///
    /// Results are returned in prompt order regardless of completion order.
    async fn batch_call_with_schema(
        &self,
        prompts: &[String],
        json_schema: &serde_json::Value,
        max_concurrent: usize,
    ) -> Result<Vec<SchemaCall>> {
        let mut results = Vec::with_capacity(prompts.len());
        for batch in prompts.chunks(max_concurrent.max(1)) {
            let calls = batch.iter().map(|p| self.call_with_schema(p, json_schema));
            for call in futures::future::join_all(calls).await {
                results.push(call?);
            }
        }
        Ok(results)
    }

    /// Recommend a batch size for the given average description length.
    fn calculate_optimal_batch_size(
        &self,
        avg_description_length: usize,
        base_tokens_hint: Option<u32>,
        per_item_hint: Option<u32>,
    ) -> BatchPlan;

    /// Cumulative usage metrics for this client instance.
    fn performance_metrics(&self) -> LlmMetrics;
}
