//! Mock implementations and fixtures for testing the pipeline without a
//! database or a live LLM provider.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::llm::{BatchPlan, CallTiming, LlmClient, LlmMetrics, SchemaCall, TokenUsage};
use crate::types::analysis::AnalyzedOpportunity;
use crate::types::opportunity::{Opportunity, PersistedOpportunity};

/// A persisted row fixture with sensible defaults.
pub fn persisted(api_id: &str, title: &str) -> PersistedOpportunity {
    let now = Utc::now();
    PersistedOpportunity {
        id: Uuid::new_v4(),
        funding_source_id: Uuid::new_v4(),
        api_opportunity_id: api_id.to_string(),
        raw_response_id: None,
        title: title.to_string(),
        description: None,
        status: None,
        open_date: None,
        close_date: None,
        minimum_award: None,
        maximum_award: None,
        total_funding_available: None,
        enhanced_content: None,
        admin_notes: None,
        api_updated_at: None,
        updated_at: now,
        created_at: now,
    }
}

/// An analyzed opportunity fixture with the three core scores set.
pub fn analyzed_with_scores(
    id: &str,
    client_relevance: Option<f64>,
    project_relevance: Option<f64>,
    funding_attractiveness: Option<f64>,
) -> AnalyzedOpportunity {
    use crate::types::analysis::Scoring;

    let overall = [client_relevance, project_relevance, funding_attractiveness]
        .iter()
        .flatten()
        .sum::<f64>()
        + 1.0;

    AnalyzedOpportunity {
        opportunity: Opportunity::new(id, format!("Program Title For {id}")),
        enhanced_description: Some("Enhanced description".to_string()),
        actionable_summary: Some("Actionable summary".to_string()),
        program_overview: None,
        program_use_cases: None,
        application_summary: None,
        program_insights: None,
        scoring: Some(Scoring {
            client_relevance,
            project_relevance,
            funding_attractiveness,
            funding_type: Some(1.0),
            overall_score: Some(overall),
        }),
        relevance_reasoning: Some("Fixture reasoning".to_string()),
        concerns: vec![],
    }
}

/// Scripted LLM client.
///
/// Routes calls by prompt header (content vs scoring), answers each with
/// one analysis item per `ID:` line in the prompt, and lets tests queue
/// failures or override scoring per opportunity id. Responses use the
/// `{"analyses": [...]}` wrapper shape so coercion is exercised on every
/// test run.
#[derive(Default)]
pub struct MockLlmClient {
    content_failures: Mutex<VecDeque<PipelineError>>,
    scoring_failures: Mutex<VecDeque<PipelineError>>,
    score_overrides: Mutex<HashMap<String, serde_json::Value>>,
    dropped_content_ids: Mutex<Vec<String>>,
    calls: AtomicU64,
    tokens: AtomicU64,
    prompts_seen: Mutex<Vec<String>>,
}

impl MockLlmClient {
    /// A client that answers every call from the prompt contents.
    pub fn auto() -> Self {
        Self::default()
    }

    /// Queue one failure for the next content-pass call.
    pub fn with_content_failure(self, err: PipelineError) -> Self {
        self.content_failures.lock().unwrap().push_back(err);
        self
    }

    /// Queue one failure for the next scoring-pass call.
    pub fn with_scoring_failure(self, err: PipelineError) -> Self {
        self.scoring_failures.lock().unwrap().push_back(err);
        self
    }

    /// Answer the scoring pass for `id` with a specific scoring object.
    pub fn with_scores_for(self, id: &str, scoring: serde_json::Value) -> Self {
        self.score_overrides
            .lock()
            .unwrap()
            .insert(id.to_string(), scoring);
        self
    }

    /// Omit `id` from content-pass responses, simulating a model that
    /// silently drops an item.
    pub fn with_content_dropped_for(self, id: &str) -> Self {
        self.dropped_content_ids.lock().unwrap().push(id.to_string());
        self
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts_seen.lock().unwrap().clone()
    }

    fn ids_in_prompt(prompt: &str) -> Vec<String> {
        prompt
            .lines()
            .filter_map(|line| line.strip_prefix("ID: "))
            .map(|id| id.trim().to_string())
            .collect()
    }

    fn content_item(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "enhancedDescription": format!("Enhanced description for {id}"),
            "actionableSummary": format!("Actionable summary for {id}"),
            "programOverview": format!("Overview for {id}"),
            "programUseCases": format!("Use cases for {id}"),
            "applicationSummary": format!("Application summary for {id}"),
            "programInsights": format!("Insights for {id}"),
        })
    }

    fn scoring_item(&self, id: &str) -> serde_json::Value {
        let scoring = self
            .score_overrides
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| {
                serde_json::json!({
                    "clientRelevance": 2.0,
                    "projectRelevance": 2.0,
                    "fundingAttractiveness": 3.0,
                    "fundingType": 1.0,
                    "overallScore": 8.0,
                })
            });
        serde_json::json!({
            "id": id,
            "scoring": scoring,
            "relevanceReasoning": format!("Reasoning for {id}"),
            "concerns": [],
        })
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn call_with_schema(
        &self,
        prompt: &str,
        _json_schema: &serde_json::Value,
    ) -> Result<SchemaCall> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts_seen.lock().unwrap().push(prompt.to_string());

        let is_scoring = prompt.contains("scoring funding opportunities");
        let failures = if is_scoring {
            &self.scoring_failures
        } else {
            &self.content_failures
        };
        if let Some(err) = failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let ids = Self::ids_in_prompt(prompt);
        let dropped = self.dropped_content_ids.lock().unwrap().clone();
        let items: Vec<serde_json::Value> = ids
            .iter()
            .filter(|id| is_scoring || !dropped.contains(*id))
            .map(|id| {
                if is_scoring {
                    self.scoring_item(id)
                } else {
                    Self::content_item(id)
                }
            })
            .collect();

        let usage = TokenUsage {
            input_tokens: 500 + 120 * ids.len() as u64,
            output_tokens: 200 * ids.len() as u64,
            total_tokens: 500 + 320 * ids.len() as u64,
        };
        self.tokens.fetch_add(usage.total_tokens, Ordering::SeqCst);

        Ok(SchemaCall {
            data: serde_json::json!({ "analyses": items }),
            usage,
            performance: CallTiming {
                total_ms: 5,
                api_call_ms: 4,
                validation_ms: 1,
            },
        })
    }

    fn calculate_optimal_batch_size(
        &self,
        avg_description_length: usize,
        base_tokens_hint: Option<u32>,
        per_item_hint: Option<u32>,
    ) -> BatchPlan {
        let base_tokens = base_tokens_hint.unwrap_or(500);
        let tokens_per_opportunity =
            per_item_hint.unwrap_or(1_000 + (avg_description_length / 4) as u32);
        BatchPlan {
            batch_size: 5,
            max_tokens: 4_096,
            model_name: "mock-analysis-model".to_string(),
            model_capacity: 128_000,
            tokens_per_opportunity,
            base_tokens,
            reason: "fixed mock plan".to_string(),
        }
    }

    fn performance_metrics(&self) -> LlmMetrics {
        let calls = self.calls.load(Ordering::SeqCst);
        LlmMetrics {
            total_tokens: self.tokens.load(Ordering::SeqCst),
            total_calls: calls,
            average_latency_ms: if calls == 0 { 0.0 } else { 5.0 },
        }
    }
}
