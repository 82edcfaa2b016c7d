//! Parallel analysis coordinator: content enhancement and relevance scoring
//! run concurrently over the LLM client, then validate and merge by id.
//!
//! The content pass is load-bearing: its failure aborts the chunk. The
//! scoring pass degrades to a fallback record per input, except for
//! rate-limit and timeout errors, which propagate so the chunk-level retry
//! policy can see them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::pipeline::parse::decode_items;
use crate::pipeline::prompts;
use crate::traits::llm::{LlmClient, TokenUsage};
use crate::types::analysis::{AnalyzedOpportunity, ContentAnalysisItem, ScoringAnalysisItem};
use crate::types::opportunity::Opportunity;

/// Bounded fan-out inside one chunk: the two passes.
const PASS_CONCURRENCY: usize = 2;

/// Merged analysis results for one chunk.
#[derive(Debug, Default)]
pub struct AnalysisOutput {
    /// One merged record per input, in input order
    pub items: Vec<AnalyzedOpportunity>,
    pub usage: TokenUsage,
    pub api_calls: u64,
    /// Wall clock of the joined parallel call
    pub execution_ms: u64,
}

pub struct AnalysisCoordinator {
    llm: Arc<dyn LlmClient>,
}

struct PassResult<T> {
    items: Vec<T>,
    usage: TokenUsage,
    api_calls: u64,
}

impl AnalysisCoordinator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Run both passes over a chunk of NEW opportunities.
    pub async fn analyze_chunk(&self, opps: &[Opportunity]) -> Result<AnalysisOutput> {
        if opps.is_empty() {
            return Ok(AnalysisOutput::default());
        }

        let plan = self.llm.calculate_optimal_batch_size(
            prompts::average_description_length(opps),
            None,
            None,
        );
        debug!(
            batch_size = plan.batch_size,
            model = %plan.model_name,
            reason = %plan.reason,
            "derived analysis batch plan"
        );
        let batch_size = plan.batch_size.max(1);

        let started = Instant::now();
        let (content_result, scoring_result) = futures::join!(
            self.run_pass::<ContentAnalysisItem>(
                opps,
                batch_size,
                prompts::format_content_prompt,
                prompts::content_schema(),
            ),
            self.run_pass::<ScoringAnalysisItem>(
                opps,
                batch_size,
                prompts::format_scoring_prompt,
                prompts::scoring_schema(),
            ),
        );
        let execution_ms = started.elapsed().as_millis() as u64;

        // Content has no fallback; its failure aborts the chunk
        let content = content_result?;

        let scoring = match scoring_result {
            Ok(pass) => pass,
            Err(e) if e.is_rate_limit() || e.is_timeout() => return Err(e),
            Err(e) => {
                warn!(error = %e, "scoring pass failed; substituting fallback records");
                PassResult {
                    items: opps
                        .iter()
                        .map(|o| ScoringAnalysisItem::fallback(&o.id))
                        .collect(),
                    usage: TokenUsage::default(),
                    api_calls: 0,
                }
            }
        };

        validate_results(opps, &content.items, &scoring.items)?;

        let content_index: HashMap<&str, &ContentAnalysisItem> =
            content.items.iter().map(|i| (i.id.as_str(), i)).collect();
        let scoring_index: HashMap<&str, &ScoringAnalysisItem> =
            scoring.items.iter().map(|i| (i.id.as_str(), i)).collect();

        // Validation guarantees both indexes cover every input id
        let items: Vec<AnalyzedOpportunity> = opps
            .iter()
            .map(|opp| {
                AnalyzedOpportunity::merge(
                    opp.clone(),
                    content_index[opp.id.as_str()],
                    scoring_index[opp.id.as_str()],
                )
            })
            .collect();

        let mut usage = content.usage;
        usage.add(&scoring.usage);

        info!(
            opportunities = opps.len(),
            tokens = usage.total_tokens,
            execution_ms,
            "parallel analysis complete"
        );

        Ok(AnalysisOutput {
            items,
            usage,
            api_calls: content.api_calls + scoring.api_calls,
            execution_ms,
        })
    }

    async fn run_pass<T: serde::de::DeserializeOwned>(
        &self,
        opps: &[Opportunity],
        batch_size: usize,
        format_prompt: fn(&[Opportunity]) -> String,
        schema: serde_json::Value,
    ) -> Result<PassResult<T>> {
        let prompts: Vec<String> = opps.chunks(batch_size).map(format_prompt).collect();

        let calls = self
            .llm
            .batch_call_with_schema(&prompts, &schema, PASS_CONCURRENCY)
            .await?;

        let mut items = Vec::with_capacity(opps.len());
        let mut usage = TokenUsage::default();
        let api_calls = calls.len() as u64;
        for call in &calls {
            usage.add(&call.usage);
            items.extend(decode_items::<T>(&call.data)?);
        }

        Ok(PassResult {
            items,
            usage,
            api_calls,
        })
    }
}

/// Pre-merge validation: counts and id sets must line up in both
/// directions for both passes.
pub fn validate_results(
    opps: &[Opportunity],
    content: &[ContentAnalysisItem],
    scoring: &[ScoringAnalysisItem],
) -> Result<()> {
    let mut issues: Vec<String> = Vec::new();

    if content.len() != opps.len() {
        issues.push(format!(
            "Content count mismatch: expected {}, got {}",
            opps.len(),
            content.len()
        ));
    }
    if scoring.len() != opps.len() {
        issues.push(format!(
            "Scoring count mismatch: expected {}, got {}",
            opps.len(),
            scoring.len()
        ));
    }

    let input_ids: HashSet<&str> = opps.iter().map(|o| o.id.as_str()).collect();
    let content_ids: HashSet<&str> = content.iter().map(|i| i.id.as_str()).collect();
    let scoring_ids: HashSet<&str> = scoring.iter().map(|i| i.id.as_str()).collect();

    for opp in opps {
        if !content_ids.contains(opp.id.as_str()) {
            issues.push(format!("Missing content for opportunity ID: {}", opp.id));
        }
        if !scoring_ids.contains(opp.id.as_str()) {
            issues.push(format!("Missing scoring for opportunity ID: {}", opp.id));
        }
    }
    for item in content {
        if !input_ids.contains(item.id.as_str()) {
            issues.push(format!("Unexpected content result ID: {}", item.id));
        }
    }
    for item in scoring {
        if !input_ids.contains(item.id.as_str()) {
            issues.push(format!("Unexpected scoring result ID: {}", item.id));
        }
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::AnalysisValidation {
            issues: issues.join("; "),
        })
    }
}
