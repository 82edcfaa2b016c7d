//! Chunk orchestration: detection, update, analysis, filter, storage.
//!
//! One processor call handles one chunk job. SKIP records terminate at
//! detection, UPDATE records go through the direct-update path, and NEW
//! records run the full analyze/filter/store flow. Every transition emits
//! a path record into the run tracker.
//!
//! Provider retry policy lives here: a rate-limited analysis is retried
//! once for the whole chunk; a timed-out analysis falls back to
//! per-opportunity calls so no record is silently dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::pipeline::analysis::{AnalysisCoordinator, AnalysisOutput};
use crate::pipeline::change::has_material_changes;
use crate::pipeline::dedupe::{DetectionOutcome, DuplicateDetector};
use crate::pipeline::filter::apply_filter;
use crate::pipeline::storage::StorageStage;
use crate::pipeline::update::{DirectUpdateHandler, REASON_NO_VALID_UPDATES};
use crate::tracker::RunTracker;
use crate::traits::llm::LlmClient;
use crate::traits::store::OpportunityStore;
use crate::types::config::ProcessingConfig;
use crate::types::opportunity::{Opportunity, SourceDescriptor};
use crate::types::run::{
    DuplicateSession, FinalOutcome, OpportunityPath, PathType, StageStatus,
};

/// Blended cost estimate applied to token totals.
const ESTIMATED_COST_PER_1K_TOKENS: f64 = 0.0045;

/// Summary of one processed chunk.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkReport {
    pub items_processed: u64,
    pub new_stored: u64,
    pub updated: u64,
    pub skipped: u64,
    pub filtered_out: u64,
    pub duplicates: u64,
    pub failed: u64,
    pub tokens_used: u64,
    pub api_calls: u64,
    pub estimated_cost_usd: f64,
    pub execution_ms: u64,
}

pub struct ChunkProcessor {
    detector: DuplicateDetector,
    coordinator: AnalysisCoordinator,
    storage: StorageStage,
    updater: DirectUpdateHandler,
}

impl ChunkProcessor {
    pub fn new(store: Arc<dyn OpportunityStore>, llm: Arc<dyn LlmClient>) -> Self {
        Self {
            detector: DuplicateDetector::new(store.clone()),
            coordinator: AnalysisCoordinator::new(llm),
            storage: StorageStage::new(store.clone()),
            updater: DirectUpdateHandler::new(store),
        }
    }

    /// Process one chunk of upstream records end to end.
    pub async fn process_chunk(
        &self,
        records: &[Opportunity],
        source: &SourceDescriptor,
        config: &ProcessingConfig,
        raw_response_id: Option<Uuid>,
        tracker: &RunTracker,
    ) -> Result<ChunkReport> {
        let started = Instant::now();
        let mut report = ChunkReport {
            items_processed: records.len() as u64,
            ..Default::default()
        };

        // Stage 1: duplicate / freshness detection
        let detection = self
            .detector
            .detect(source.id, records, raw_response_id)
            .await;
        self.record_detection(&detection, source, tracker).await;

        report.skipped = detection.to_skip.len() as u64;
        for skip in &detection.to_skip {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                &skip.record.id,
                PathType::Skip,
                FinalOutcome::Skipped,
            );
            path.reason = Some(skip.reason.to_string());
            path.duplicate_detected = true;
            path.stages_processed = vec!["duplicate_detection".to_string()];
            tracker.record_path(path).await;
        }

        // Stage 2: direct updates for matched records with newer data
        if !detection.to_update.is_empty() {
            self.run_updates(&detection, &mut report, tracker).await?;
        }

        // Stages 3-5: full pipeline for NEW records
        if !detection.new_opportunities.is_empty() {
            self.run_new_path(
                &detection.new_opportunities,
                source,
                config,
                raw_response_id,
                &mut report,
                tracker,
            )
            .await?;
        }

        let bypassed = (detection.to_skip.len() + detection.to_update.len()) as u64;
        report.estimated_cost_usd =
            (report.tokens_used as f64 / 1_000.0) * ESTIMATED_COST_PER_1K_TOKENS;
        report.execution_ms = started.elapsed().as_millis() as u64;

        tracker.add_totals(
            report.items_processed,
            bypassed,
            report.tokens_used,
            report.api_calls,
            report.estimated_cost_usd,
            report.execution_ms,
        );

        info!(
            items = report.items_processed,
            new_stored = report.new_stored,
            updated = report.updated,
            skipped = report.skipped,
            filtered_out = report.filtered_out,
            failed = report.failed,
            execution_ms = report.execution_ms,
            "chunk processed"
        );
        Ok(report)
    }

    async fn record_detection(
        &self,
        detection: &DetectionOutcome,
        source: &SourceDescriptor,
        tracker: &RunTracker,
    ) {
        tracker
            .record_duplicate_session(DuplicateSession {
                id: Uuid::new_v4(),
                run_id: tracker.run_id(),
                source_id: source.id,
                total_records: detection.metrics.total_records,
                new_count: detection.new_opportunities.len() as u64,
                update_count: detection.to_update.len() as u64,
                skip_count: detection.to_skip.len() as u64,
                method_counts: serde_json::to_value(detection.metrics.method_counts)
                    .unwrap_or_default(),
                estimated_tokens_saved: detection.metrics.estimated_tokens_saved,
                query_count: detection.metrics.database_queries,
                detection_ms: detection.metrics.detection_ms,
            })
            .await;
        tracker
            .record_stage(
                "duplicate_detection",
                StageStatus::Completed,
                detection.metrics.total_records,
                detection.new_opportunities.len() as u64,
                0,
                0,
                serde_json::to_value(&detection.metrics).unwrap_or_default(),
                detection.metrics.detection_ms,
            )
            .await;
    }

    async fn run_updates(
        &self,
        detection: &DetectionOutcome,
        report: &mut ChunkReport,
        tracker: &RunTracker,
    ) -> Result<()> {
        // Material-change verdicts feed the path records
        let changes: HashMap<&str, bool> = detection
            .to_update
            .iter()
            .map(|c| {
                (
                    c.api_record.id.as_str(),
                    has_material_changes(&c.api_record, &c.db_record),
                )
            })
            .collect();
        let reasons: HashMap<&str, &'static str> = detection
            .to_update
            .iter()
            .map(|c| (c.api_record.id.as_str(), c.reason))
            .collect();

        let outcome = self.updater.process(&detection.to_update).await?;

        report.updated = outcome.metrics.successful;
        report.skipped += outcome.metrics.skipped;
        report.failed += outcome.metrics.failed;

        tracker
            .record_stage(
                "direct_update",
                StageStatus::Completed,
                outcome.metrics.total_processed,
                outcome.metrics.successful,
                0,
                0,
                serde_json::to_value(outcome.metrics).unwrap_or_default(),
                outcome.metrics.execution_ms,
            )
            .await;

        for item in &outcome.successful {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                &item.api_opportunity_id,
                PathType::Update,
                FinalOutcome::Updated,
            );
            path.reason = reasons
                .get(item.api_opportunity_id.as_str())
                .map(|r| r.to_string());
            path.duplicate_detected = true;
            path.changes_detected = changes.get(item.api_opportunity_id.as_str()).copied();
            path.stages_processed =
                vec!["duplicate_detection".to_string(), "direct_update".to_string()];
            tracker.record_path(path).await;
        }
        for item in &outcome.skipped {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                &item.api_opportunity_id,
                PathType::Update,
                FinalOutcome::Skipped,
            );
            path.reason = Some(REASON_NO_VALID_UPDATES.to_string());
            path.duplicate_detected = true;
            path.changes_detected = changes.get(item.api_opportunity_id.as_str()).copied();
            path.stages_processed =
                vec!["duplicate_detection".to_string(), "direct_update".to_string()];
            tracker.record_path(path).await;
        }
        for item in &outcome.failed {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                &item.api_opportunity_id,
                PathType::Update,
                FinalOutcome::Failed,
            );
            path.reason = Some(item.error.clone());
            path.duplicate_detected = true;
            path.stages_processed =
                vec!["duplicate_detection".to_string(), "direct_update".to_string()];
            tracker.record_path(path).await;
        }
        Ok(())
    }

    async fn run_new_path(
        &self,
        new_opps: &[Opportunity],
        source: &SourceDescriptor,
        config: &ProcessingConfig,
        raw_response_id: Option<Uuid>,
        report: &mut ChunkReport,
        tracker: &RunTracker,
    ) -> Result<()> {
        let (analysis, analysis_failures) = self.analyze_with_retries(new_opps).await?;

        report.tokens_used += analysis.usage.total_tokens;
        report.api_calls += analysis.api_calls;
        report.failed += analysis_failures.len() as u64;

        tracker
            .record_stage(
                "analysis",
                StageStatus::Completed,
                new_opps.len() as u64,
                analysis.items.len() as u64,
                analysis.usage.total_tokens,
                analysis.api_calls,
                serde_json::json!({
                    "analyzed": analysis.items.len(),
                    "failed": analysis_failures.len(),
                }),
                analysis.execution_ms,
            )
            .await;

        for (opp, error) in &analysis_failures {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                &opp.id,
                PathType::New,
                FinalOutcome::Failed,
            );
            path.reason = Some(error.clone());
            path.stages_processed =
                vec!["duplicate_detection".to_string(), "analysis".to_string()];
            tracker.record_path(path).await;
        }

        // Rough per-opportunity attribution for path records
        let tokens_per_opp = if analysis.items.is_empty() {
            0
        } else {
            analysis.usage.total_tokens / analysis.items.len() as u64
        };

        // Filter stage
        let filtered = apply_filter(analysis.items, &config.filter);
        report.filtered_out = filtered.filter_metrics.excluded;
        tracker
            .record_stage(
                "filter",
                StageStatus::Completed,
                filtered.filter_metrics.total_analyzed,
                filtered.filter_metrics.included,
                0,
                0,
                serde_json::to_value(filtered.filter_metrics).unwrap_or_default(),
                filtered.processing_ms,
            )
            .await;

        for excluded in &filtered.excluded_opportunities {
            let mut path = OpportunityPath::new(
                tracker.run_id(),
                excluded.opportunity.id(),
                PathType::New,
                FinalOutcome::FilteredOut,
            );
            path.reason = Some(excluded.exclusion_reason.clone());
            path.tokens_used = tokens_per_opp;
            path.quality_score = excluded
                .opportunity
                .scoring
                .as_ref()
                .and_then(|s| s.overall_score);
            path.stages_processed = vec![
                "duplicate_detection".to_string(),
                "analysis".to_string(),
                "filter".to_string(),
            ];
            tracker.record_path(path).await;
        }

        // Storage stage
        let stored = self
            .storage
            .store(
                &filtered.included_opportunities,
                source,
                raw_response_id,
                config.force_full_processing,
            )
            .await;

        report.new_stored = stored.metrics.new_opportunities;
        report.updated += stored.metrics.updated_opportunities;
        report.duplicates = stored.metrics.duplicates_found;
        report.failed += stored.metrics.failures;

        let stage_status = if stored.metrics.error {
            StageStatus::Failed
        } else {
            StageStatus::Completed
        };
        tracker
            .record_stage(
                "storage",
                stage_status,
                stored.metrics.total_processed,
                stored.metrics.new_opportunities,
                0,
                0,
                serde_json::to_value(&stored.metrics).unwrap_or_default(),
                stored.execution_ms,
            )
            .await;

        if stored.metrics.error {
            // The stage never throws; surface the failure through paths
            report.failed += filtered.included_opportunities.len() as u64;
            for opp in &filtered.included_opportunities {
                let mut path = OpportunityPath::new(
                    tracker.run_id(),
                    opp.id(),
                    PathType::New,
                    FinalOutcome::Failed,
                );
                path.reason = stored.metrics.error_message.clone();
                path.tokens_used = tokens_per_opp;
                tracker.record_path(path).await;
            }
            return Ok(());
        }

        let stored_ids: HashSet<&str> = stored
            .results
            .new_opportunities
            .iter()
            .map(|s| s.api_opportunity_id.as_str())
            .collect();
        let duplicate_ids: HashSet<&str> =
            stored.duplicate_ids.iter().map(String::as_str).collect();

        for opp in &filtered.included_opportunities {
            let all_stages = vec![
                "duplicate_detection".to_string(),
                "analysis".to_string(),
                "filter".to_string(),
                "storage".to_string(),
            ];
            let id = opp.id();
            let (outcome, reason) = if stored_ids.contains(id) {
                (FinalOutcome::Stored, None)
            } else if duplicate_ids.contains(id) {
                (FinalOutcome::Skipped, Some("duplicate_key".to_string()))
            } else {
                (FinalOutcome::Failed, Some("storage write failed".to_string()))
            };

            let mut path = OpportunityPath::new(tracker.run_id(), id, PathType::New, outcome);
            path.reason = reason;
            path.tokens_used = tokens_per_opp;
            path.quality_score = opp.scoring.as_ref().and_then(|s| s.overall_score);
            path.stages_processed = all_stages;
            tracker.record_path(path).await;
        }

        Ok(())
    }

    /// Analysis with the chunk-level provider retry policy.
    ///
    /// Returns the merged output plus per-item failures from the
    /// per-opportunity fallback; per-item mode never drops records.
    async fn analyze_with_retries(
        &self,
        opps: &[Opportunity],
    ) -> Result<(AnalysisOutput, Vec<(Opportunity, String)>)> {
        match self.coordinator.analyze_chunk(opps).await {
            Ok(output) => Ok((output, Vec::new())),
            Err(e) if e.is_rate_limit() => {
                warn!("analysis rate limited; retrying chunk once");
                let output = self.coordinator.analyze_chunk(opps).await?;
                Ok((output, Vec::new()))
            }
            Err(e) if e.is_timeout() => {
                warn!("analysis timed out; falling back to per-opportunity calls");
                let mut merged = AnalysisOutput::default();
                let mut failures = Vec::new();
                for opp in opps {
                    match self.coordinator.analyze_chunk(std::slice::from_ref(opp)).await {
                        Ok(mut single) => {
                            merged.items.append(&mut single.items);
                            merged.usage.add(&single.usage);
                            merged.api_calls += single.api_calls;
                            merged.execution_ms += single.execution_ms;
                        }
                        Err(item_err) => {
                            warn!(
                                api_opportunity_id = %opp.id,
                                error = %item_err,
                                "per-opportunity analysis failed"
                            );
                            failures.push((opp.clone(), item_err.to_string()));
                        }
                    }
                }
                Ok((merged, failures))
            }
            Err(e) => Err(e),
        }
    }
}
