//! Filter stage: drop analyzed opportunities that fail the relevance rules.
//!
//! Pure in-memory function with no shared state; safe to run from any
//! number of workers at once.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::types::analysis::AnalyzedOpportunity;
use crate::types::config::FilterConfig;

pub const REASON_MISSING_SCORING: &str = "Missing scoring data";

/// An excluded opportunity with the reason it was dropped.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExcludedOpportunity {
    #[serde(flatten)]
    pub opportunity: AnalyzedOpportunity,
    pub exclusion_reason: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExclusionReasons {
    pub two_zero_categories: u64,
    pub missing_scoring: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterMetrics {
    pub total_analyzed: u64,
    pub included: u64,
    pub excluded: u64,
    pub exclusion_reasons: ExclusionReasons,
}

/// Result of one filter invocation.
#[derive(Debug)]
pub struct FilterOutcome {
    pub success: bool,
    pub included_opportunities: Vec<AnalyzedOpportunity>,
    pub excluded_opportunities: Vec<ExcludedOpportunity>,
    pub filter_metrics: FilterMetrics,
    pub processing_ms: u64,
    pub config: FilterConfig,
}

/// Count of zero-valued core components. Null and non-numeric values count
/// as zero.
fn zero_core_components(opp: &AnalyzedOpportunity) -> Option<usize> {
    let scoring = opp.scoring.as_ref()?;
    Some(
        scoring
            .core_components()
            .iter()
            .filter(|c| match c {
                Some(v) if v.is_finite() => *v == 0.0,
                _ => true,
            })
            .count(),
    )
}

/// Apply the relevance filter to a chunk of analyzed opportunities.
///
/// Included opportunities pass through untouched; excluded ones carry an
/// exclusion reason.
pub fn apply_filter(opps: Vec<AnalyzedOpportunity>, config: &FilterConfig) -> FilterOutcome {
    let started = Instant::now();
    let mut metrics = FilterMetrics {
        total_analyzed: opps.len() as u64,
        ..Default::default()
    };
    let mut included = Vec::with_capacity(opps.len());
    let mut excluded = Vec::new();

    for opp in opps {
        match zero_core_components(&opp) {
            None => {
                metrics.exclusion_reasons.missing_scoring += 1;
                if config.enable_logging {
                    debug!(id = %opp.id(), "excluded: no scoring data");
                }
                excluded.push(ExcludedOpportunity {
                    opportunity: opp,
                    exclusion_reason: REASON_MISSING_SCORING.to_string(),
                });
            }
            Some(zeros) if config.exclude_if_two_zeros && zeros >= 2 => {
                metrics.exclusion_reasons.two_zero_categories += 1;
                let reason = format!("{zeros} out of 3 core categories scored 0");
                if config.enable_logging {
                    debug!(id = %opp.id(), reason = %reason, "excluded by score filter");
                }
                excluded.push(ExcludedOpportunity {
                    opportunity: opp,
                    exclusion_reason: reason,
                });
            }
            Some(_) => included.push(opp),
        }
    }

    metrics.included = included.len() as u64;
    metrics.excluded = excluded.len() as u64;

    if config.enable_logging {
        info!(
            analyzed = metrics.total_analyzed,
            included = metrics.included,
            excluded = metrics.excluded,
            "filter stage complete"
        );
    }

    FilterOutcome {
        success: true,
        included_opportunities: included,
        excluded_opportunities: excluded,
        filter_metrics: metrics,
        processing_ms: started.elapsed().as_millis() as u64,
        config: config.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::analyzed_with_scores;
    use crate::types::analysis::Scoring;

    #[test]
    fn test_two_zeros_excluded() {
        let opp = analyzed_with_scores("Z-1", Some(0.0), Some(0.0), Some(75.0));
        let outcome = apply_filter(vec![opp], &FilterConfig::default());

        assert!(outcome.included_opportunities.is_empty());
        assert_eq!(
            outcome.excluded_opportunities[0].exclusion_reason,
            "2 out of 3 core categories scored 0"
        );
        assert_eq!(outcome.filter_metrics.exclusion_reasons.two_zero_categories, 1);
    }

    #[test]
    fn test_one_zero_included() {
        let opp = analyzed_with_scores("Z-2", Some(0.0), Some(2.0), Some(3.0));
        let outcome = apply_filter(vec![opp], &FilterConfig::default());
        assert_eq!(outcome.included_opportunities.len(), 1);
        assert!(outcome.excluded_opportunities.is_empty());
    }

    #[test]
    fn test_null_components_count_as_zero() {
        let mut opp = analyzed_with_scores("Z-3", None, None, Some(3.0));
        opp.scoring = Some(Scoring {
            client_relevance: None,
            project_relevance: None,
            funding_attractiveness: Some(3.0),
            funding_type: Some(1.0),
            overall_score: Some(4.0),
        });
        let outcome = apply_filter(vec![opp], &FilterConfig::default());
        assert_eq!(
            outcome.excluded_opportunities[0].exclusion_reason,
            "2 out of 3 core categories scored 0"
        );
    }

    #[test]
    fn test_missing_scoring_excluded() {
        let mut opp = analyzed_with_scores("Z-4", Some(1.0), Some(1.0), Some(1.0));
        opp.scoring = None;
        let outcome = apply_filter(vec![opp], &FilterConfig::default());
        assert_eq!(
            outcome.excluded_opportunities[0].exclusion_reason,
            REASON_MISSING_SCORING
        );
        assert_eq!(outcome.filter_metrics.exclusion_reasons.missing_scoring, 1);
    }

    #[test]
    fn test_filter_disabled_keeps_two_zeros() {
        let opp = analyzed_with_scores("Z-5", Some(0.0), Some(0.0), Some(1.0));
        let config = FilterConfig {
            exclude_if_two_zeros: false,
            ..Default::default()
        };
        let outcome = apply_filter(vec![opp], &config);
        assert_eq!(outcome.included_opportunities.len(), 1);
    }

    #[test]
    fn test_included_fields_untouched() {
        let mut opp = analyzed_with_scores("Z-6", Some(1.0), Some(2.0), Some(3.0));
        opp.opportunity
            .extra
            .insert("rawField".to_string(), serde_json::json!({"keep": true}));
        let before = serde_json::to_value(&opp).unwrap();

        let outcome = apply_filter(vec![opp], &FilterConfig::default());
        let after = serde_json::to_value(&outcome.included_opportunities[0]).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_metrics_accounting() {
        let opps = vec![
            analyzed_with_scores("M-1", Some(1.0), Some(1.0), Some(1.0)),
            analyzed_with_scores("M-2", Some(0.0), Some(0.0), Some(0.0)),
        ];
        let outcome = apply_filter(opps, &FilterConfig::default());
        assert_eq!(outcome.filter_metrics.total_analyzed, 2);
        assert_eq!(
            outcome.filter_metrics.included + outcome.filter_metrics.excluded,
            outcome.filter_metrics.total_analyzed
        );
        assert_eq!(
            outcome.excluded_opportunities[0].exclusion_reason,
            "3 out of 3 core categories scored 0"
        );
    }
}
