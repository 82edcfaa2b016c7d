//! LLM prompts and schemas for the two analysis passes.

use schemars::schema_for;

use crate::types::analysis::{AnalysesEnvelope, ContentAnalysisItem, ScoringAnalysisItem};
use crate::types::opportunity::Opportunity;

/// Prompt header for the content-enhancement pass.
pub const CONTENT_PROMPT: &str = r#"You are enhancing funding-opportunity descriptions for a grants team.

For EVERY opportunity below, produce one analysis object. Echo the
opportunity id back unchanged - results are matched by id, not position.

For each opportunity write:
1. enhancedDescription - a clear, complete rewrite of the description
2. actionableSummary - 2-3 sentences on what an applicant should do next
3. programOverview - what the program funds and why
4. programUseCases - concrete example projects that would qualify
5. applicationSummary - key dates, amounts, and application mechanics
6. programInsights - anything notable (match requirements, set-asides, renewal patterns)

Output JSON:
{
    "analyses": [
        {
            "id": "opportunity id, echoed unchanged",
            "enhancedDescription": "...",
            "actionableSummary": "...",
            "programOverview": "...",
            "programUseCases": "...",
            "applicationSummary": "...",
            "programInsights": "..."
        }
    ]
}

Opportunities:
"#;

/// Prompt header for the relevance-scoring pass.
pub const SCORING_PROMPT: &str = r#"You are scoring funding opportunities for relevance.

For EVERY opportunity below, produce one scoring object. Echo the
opportunity id back unchanged - results are matched by id, not position.

Score each component:
- clientRelevance (0-3): fit with the clients we serve
- projectRelevance (0-3): fit with the project types we deliver
- fundingAttractiveness (0-3): award size, match burden, competition
- fundingType (0-1): preferred funding instrument
- overallScore (0-10): the sum of the components

Also provide relevanceReasoning (2-3 sentences) and concerns (array of
strings; empty when there are none).

Output JSON:
{
    "analyses": [
        {
            "id": "opportunity id, echoed unchanged",
            "scoring": {
                "clientRelevance": 0,
                "projectRelevance": 0,
                "fundingAttractiveness": 0,
                "fundingType": 0,
                "overallScore": 0
            },
            "relevanceReasoning": "...",
            "concerns": []
        }
    ]
}

Opportunities:
"#;

/// Render one opportunity into the prompt body.
fn format_opportunity(opp: &Opportunity) -> String {
    let mut block = format!("ID: {}\nTitle: {}\n", opp.id, opp.title);
    if let Some(desc) = &opp.description {
        block.push_str(&format!("Description: {desc}\n"));
    }
    if let Some(min) = opp.minimum_award {
        block.push_str(&format!("Minimum award: {min}\n"));
    }
    if let Some(max) = opp.maximum_award {
        block.push_str(&format!("Maximum award: {max}\n"));
    }
    if let Some(total) = opp.total_funding_available {
        block.push_str(&format!("Total funding: {total}\n"));
    }
    if let Some(open) = &opp.open_date {
        block.push_str(&format!("Opens: {open}\n"));
    }
    if let Some(close) = &opp.close_date {
        block.push_str(&format!("Closes: {close}\n"));
    }
    if let Some(status) = &opp.status {
        block.push_str(&format!("Status: {status}\n"));
    }
    if !opp.eligible_applicants.is_empty() {
        block.push_str(&format!(
            "Eligible applicants: {}\n",
            opp.eligible_applicants.join(", ")
        ));
    }
    block
}

pub fn format_content_prompt(opps: &[Opportunity]) -> String {
    let mut prompt = CONTENT_PROMPT.to_string();
    for opp in opps {
        prompt.push_str(&format_opportunity(opp));
        prompt.push('\n');
    }
    prompt
}

pub fn format_scoring_prompt(opps: &[Opportunity]) -> String {
    let mut prompt = SCORING_PROMPT.to_string();
    for opp in opps {
        prompt.push_str(&format_opportunity(opp));
        prompt.push('\n');
    }
    prompt
}

/// JSON schema for the content pass response.
pub fn content_schema() -> serde_json::Value {
    serde_json::to_value(schema_for!(AnalysesEnvelope<ContentAnalysisItem>)).unwrap_or_default()
}

/// JSON schema for the scoring pass response.
pub fn scoring_schema() -> serde_json::Value {
    serde_json::to_value(schema_for!(AnalysesEnvelope<ScoringAnalysisItem>)).unwrap_or_default()
}

/// Average description length, used for batch sizing.
pub fn average_description_length(opps: &[Opportunity]) -> usize {
    if opps.is_empty() {
        return 0;
    }
    let total: usize = opps
        .iter()
        .map(|o| o.description.as_deref().map_or(0, str::len))
        .sum();
    total / opps.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_every_id() {
        let opps = vec![
            Opportunity::new("P-1", "First Program Title"),
            Opportunity::new("P-2", "Second Program Title"),
        ];
        let prompt = format_content_prompt(&opps);
        assert!(prompt.contains("ID: P-1"));
        assert!(prompt.contains("ID: P-2"));
    }

    #[test]
    fn test_schemas_are_objects() {
        assert!(content_schema().is_object());
        assert!(scoring_schema().is_object());
    }

    #[test]
    fn test_average_description_length() {
        let mut a = Opportunity::new("a", "Title One Long Enough");
        a.description = Some("x".repeat(100));
        let mut b = Opportunity::new("b", "Title Two Long Enough");
        b.description = Some("x".repeat(50));
        assert_eq!(average_description_length(&[a, b]), 75);
        assert_eq!(average_description_length(&[]), 0);
    }
}
