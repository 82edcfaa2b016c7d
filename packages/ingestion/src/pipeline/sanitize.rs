//! Payload sanitization for the storage boundary.
//!
//! In-memory records are camelCase and permissive; the database is
//! snake_case and strict. Sanitization trims strings, drops empties,
//! coerces numerics, normalizes dates to calendar days, and leaves unknown
//! upstream fields behind.

use uuid::Uuid;

use crate::pipeline::change::normalize_date;
use crate::traits::store::OpportunityRow;
use crate::types::analysis::AnalyzedOpportunity;

/// US state and district codes recognized by eligibility processing.
const STATE_CODES: [(&str, &str); 51] = [
    ("alabama", "AL"), ("alaska", "AK"), ("arizona", "AZ"), ("arkansas", "AR"),
    ("california", "CA"), ("colorado", "CO"), ("connecticut", "CT"), ("delaware", "DE"),
    ("district of columbia", "DC"), ("florida", "FL"), ("georgia", "GA"), ("hawaii", "HI"),
    ("idaho", "ID"), ("illinois", "IL"), ("indiana", "IN"), ("iowa", "IA"),
    ("kansas", "KS"), ("kentucky", "KY"), ("louisiana", "LA"), ("maine", "ME"),
    ("maryland", "MD"), ("massachusetts", "MA"), ("michigan", "MI"), ("minnesota", "MN"),
    ("mississippi", "MS"), ("missouri", "MO"), ("montana", "MT"), ("nebraska", "NE"),
    ("nevada", "NV"), ("new hampshire", "NH"), ("new jersey", "NJ"), ("new mexico", "NM"),
    ("new york", "NY"), ("north carolina", "NC"), ("north dakota", "ND"), ("ohio", "OH"),
    ("oklahoma", "OK"), ("oregon", "OR"), ("pennsylvania", "PA"), ("rhode island", "RI"),
    ("south carolina", "SC"), ("south dakota", "SD"), ("tennessee", "TN"), ("texas", "TX"),
    ("utah", "UT"), ("vermont", "VT"), ("virginia", "VA"), ("washington", "WA"),
    ("west virginia", "WV"), ("wisconsin", "WI"), ("wyoming", "WY"),
];

/// Trim a string, mapping empty to absent.
fn clean_string(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn clean_opt(value: Option<&str>) -> Option<String> {
    value.and_then(clean_string)
}

/// Coerce an amount: non-finite and negative values are dropped.
fn clean_amount(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Map eligibility strings to two-letter state codes.
///
/// Accepts full state names and bare codes; anything unrecognized (agency
/// types, "nationwide", free text) is ignored.
pub fn extract_state_codes(entries: &[String]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::new();
    for entry in entries {
        let needle = entry.trim().to_lowercase();
        if needle.is_empty() {
            continue;
        }
        let code = STATE_CODES
            .iter()
            .find(|(name, code)| *name == needle || code.to_lowercase() == needle)
            .map(|(_, code)| code.to_string());
        if let Some(code) = code {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    codes.sort();
    codes
}

/// Build the sanitized write row for one analyzed opportunity.
pub fn sanitize_for_storage(
    opp: &AnalyzedOpportunity,
    funding_source_id: Uuid,
    raw_response_id: Option<Uuid>,
) -> OpportunityRow {
    let source = &opp.opportunity;
    OpportunityRow {
        funding_source_id,
        api_opportunity_id: source.id.trim().to_string(),
        raw_response_id,

        title: source.title.trim().to_string(),
        description: clean_opt(source.description.as_deref()),
        status: clean_opt(source.status.as_deref()),
        open_date: source.open_date.as_deref().and_then(normalize_date),
        close_date: source.close_date.as_deref().and_then(normalize_date),
        minimum_award: clean_amount(source.minimum_award),
        maximum_award: clean_amount(source.maximum_award),
        total_funding_available: clean_amount(source.total_funding_available),
        eligible_applicants: source
            .eligible_applicants
            .iter()
            .filter_map(|s| clean_string(s))
            .collect(),
        funding_instrument_type: clean_opt(source.funding_instrument_type.as_deref()),

        enhanced_description: clean_opt(opp.enhanced_description.as_deref()),
        actionable_summary: clean_opt(opp.actionable_summary.as_deref()),
        program_overview: clean_opt(opp.program_overview.as_deref()),
        program_use_cases: clean_opt(opp.program_use_cases.as_deref()),
        application_summary: clean_opt(opp.application_summary.as_deref()),
        program_insights: clean_opt(opp.program_insights.as_deref()),
        // Null scoring stays null all the way to the row
        scoring: opp
            .scoring
            .as_ref()
            .and_then(|s| serde_json::to_value(s).ok()),
        relevance_reasoning: clean_opt(opp.relevance_reasoning.as_deref()),
        concerns: opp.concerns.clone(),

        api_updated_at: source.api_updated_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::analyzed_with_scores;

    #[test]
    fn test_trims_and_drops_empty_strings() {
        let mut opp = analyzed_with_scores("S-1", Some(1.0), Some(1.0), Some(1.0));
        opp.opportunity.description = Some("   ".to_string());
        opp.opportunity.status = Some("  open  ".to_string());

        let row = sanitize_for_storage(&opp, Uuid::new_v4(), None);
        assert!(row.description.is_none());
        assert_eq!(row.status.as_deref(), Some("open"));
    }

    #[test]
    fn test_dates_normalized_to_calendar_day() {
        let mut opp = analyzed_with_scores("S-2", Some(1.0), Some(1.0), Some(1.0));
        opp.opportunity.close_date = Some("2024-12-31T18:00:00Z".to_string());
        opp.opportunity.open_date = Some("not a date".to_string());

        let row = sanitize_for_storage(&opp, Uuid::new_v4(), None);
        assert_eq!(
            row.close_date,
            chrono::NaiveDate::from_ymd_opt(2024, 12, 31)
        );
        assert!(row.open_date.is_none());
    }

    #[test]
    fn test_invalid_amounts_dropped() {
        let mut opp = analyzed_with_scores("S-3", Some(1.0), Some(1.0), Some(1.0));
        opp.opportunity.minimum_award = Some(-5.0);
        opp.opportunity.maximum_award = Some(f64::NAN);
        opp.opportunity.total_funding_available = Some(1_000_000.0);

        let row = sanitize_for_storage(&opp, Uuid::new_v4(), None);
        assert!(row.minimum_award.is_none());
        assert!(row.maximum_award.is_none());
        assert_eq!(row.total_funding_available, Some(1_000_000.0));
    }

    #[test]
    fn test_unknown_fields_not_persisted() {
        let mut opp = analyzed_with_scores("S-4", Some(1.0), Some(1.0), Some(1.0));
        opp.opportunity
            .extra
            .insert("mysteryField".to_string(), serde_json::json!(42));

        let row = sanitize_for_storage(&opp, Uuid::new_v4(), None);
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("mysteryField").is_none());
    }

    #[test]
    fn test_null_scoring_stays_null() {
        let mut opp = analyzed_with_scores("S-5", Some(1.0), Some(1.0), Some(1.0));
        opp.scoring = None;
        let row = sanitize_for_storage(&opp, Uuid::new_v4(), None);
        assert!(row.scoring.is_none());
    }

    #[test]
    fn test_state_extraction() {
        let entries = vec![
            "Minnesota".to_string(),
            "WI".to_string(),
            "minnesota".to_string(),
            "Nonprofit organizations".to_string(),
            "  ".to_string(),
        ];
        assert_eq!(extract_state_codes(&entries), vec!["MN", "WI"]);
    }
}
