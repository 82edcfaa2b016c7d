//! Analysis results produced by the two LLM passes.
//!
//! The content pass enriches descriptions; the scoring pass grades
//! relevance. Both are merged into `AnalyzedOpportunity` keyed by the
//! upstream opportunity id.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::opportunity::Opportunity;

/// Relevance scores for one opportunity.
///
/// Components are 0–3 (funding type 0–1) and `overall_score` is 0–10,
/// approximately the sum of components. Nulls are preserved: a missing
/// component is only interpreted as zero by the filter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Scoring {
    #[serde(default)]
    pub client_relevance: Option<f64>,
    #[serde(default)]
    pub project_relevance: Option<f64>,
    #[serde(default)]
    pub funding_attractiveness: Option<f64>,
    #[serde(default)]
    pub funding_type: Option<f64>,
    #[serde(default)]
    pub overall_score: Option<f64>,
}

impl Scoring {
    /// All-zero scoring used as the fallback when the scoring pass fails.
    pub fn zeroed() -> Self {
        Self {
            client_relevance: Some(0.0),
            project_relevance: Some(0.0),
            funding_attractiveness: Some(0.0),
            funding_type: Some(0.0),
            overall_score: Some(0.0),
        }
    }

    /// The three core components the filter examines.
    pub fn core_components(&self) -> [Option<f64>; 3] {
        [
            self.client_relevance,
            self.project_relevance,
            self.funding_attractiveness,
        ]
    }
}

/// One item from the content-enhancement pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContentAnalysisItem {
    /// Upstream opportunity id this item belongs to
    pub id: String,
    pub enhanced_description: String,
    pub actionable_summary: String,
    #[serde(default)]
    pub program_overview: Option<String>,
    #[serde(default)]
    pub program_use_cases: Option<String>,
    #[serde(default)]
    pub application_summary: Option<String>,
    #[serde(default)]
    pub program_insights: Option<String>,
}

/// One item from the scoring pass.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScoringAnalysisItem {
    /// Upstream opportunity id this item belongs to
    pub id: String,
    /// May be null; preserved as-is downstream
    #[serde(default)]
    pub scoring: Option<Scoring>,
    #[serde(default)]
    pub relevance_reasoning: Option<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

impl ScoringAnalysisItem {
    /// Fallback record substituted when the scoring pass fails.
    pub fn fallback(id: impl Into<String>) -> Self {
        const FALLBACK_NOTE: &str = "Analysis failed - manual review required";
        Self {
            id: id.into(),
            scoring: Some(Scoring::zeroed()),
            relevance_reasoning: Some(FALLBACK_NOTE.to_string()),
            concerns: vec![FALLBACK_NOTE.to_string()],
        }
    }
}

/// Wrapper shape some models emit instead of a bare array.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct AnalysesEnvelope<T> {
    pub analyses: Vec<T>,
}

/// An opportunity with both analysis passes merged in.
///
/// Every upstream field is preserved unchanged; enhancement and scoring
/// fields are layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzedOpportunity {
    #[serde(flatten)]
    pub opportunity: Opportunity,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enhanced_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actionable_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_overview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_use_cases: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program_insights: Option<String>,

    #[serde(default)]
    pub scoring: Option<Scoring>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_reasoning: Option<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
}

impl AnalyzedOpportunity {
    /// Merge one content item and one scoring item onto an opportunity.
    pub fn merge(
        opportunity: Opportunity,
        content: &ContentAnalysisItem,
        scoring: &ScoringAnalysisItem,
    ) -> Self {
        Self {
            opportunity,
            enhanced_description: Some(content.enhanced_description.clone()),
            actionable_summary: Some(content.actionable_summary.clone()),
            program_overview: content.program_overview.clone(),
            program_use_cases: content.program_use_cases.clone(),
            application_summary: content.application_summary.clone(),
            program_insights: content.program_insights.clone(),
            scoring: scoring.scoring.clone(),
            relevance_reasoning: scoring.relevance_reasoning.clone(),
            concerns: scoring.concerns.clone(),
        }
    }

    pub fn id(&self) -> &str {
        &self.opportunity.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_preserves_upstream_fields() {
        let mut opp = Opportunity::new("A-1", "Community Energy Grant");
        opp.minimum_award = Some(5000.0);
        opp.extra
            .insert("agencyCode".to_string(), serde_json::json!("DOE"));

        let content = ContentAnalysisItem {
            id: "A-1".to_string(),
            enhanced_description: "Better description".to_string(),
            actionable_summary: "Apply by June".to_string(),
            program_overview: None,
            program_use_cases: None,
            application_summary: None,
            program_insights: None,
        };
        let scoring = ScoringAnalysisItem {
            id: "A-1".to_string(),
            scoring: Some(Scoring {
                client_relevance: Some(2.0),
                project_relevance: Some(3.0),
                funding_attractiveness: Some(2.0),
                funding_type: Some(1.0),
                overall_score: Some(8.0),
            }),
            relevance_reasoning: Some("Strong fit".to_string()),
            concerns: vec![],
        };

        let merged = AnalyzedOpportunity::merge(opp.clone(), &content, &scoring);
        assert_eq!(merged.opportunity, opp);
        assert_eq!(merged.enhanced_description.as_deref(), Some("Better description"));

        let json = serde_json::to_value(&merged).unwrap();
        assert_eq!(json["agencyCode"], "DOE");
        assert_eq!(json["minimumAward"], 5000.0);
    }

    #[test]
    fn test_fallback_scoring_record() {
        let fb = ScoringAnalysisItem::fallback("X-9");
        assert_eq!(fb.scoring.as_ref().unwrap().overall_score, Some(0.0));
        assert_eq!(
            fb.concerns,
            vec!["Analysis failed - manual review required".to_string()]
        );
    }

    #[test]
    fn test_scoring_null_preserved_through_serde() {
        let json = r#"{"id": "S-1", "scoring": null, "relevanceReasoning": "n/a"}"#;
        let item: ScoringAnalysisItem = serde_json::from_str(json).unwrap();
        assert!(item.scoring.is_none());
    }
}
