//! Material-change detection between an upstream record and its persisted
//! counterpart.
//!
//! Each field family has its own policy; the record-level answer is the OR
//! over all of them. Thresholds are strict: a change of exactly 5% in an
//! amount, or exactly 20% in description length, is not material.

use chrono::NaiveDate;

use crate::types::opportunity::{Opportunity, PersistedOpportunity};

/// Relative delta above which an amount change is material.
const AMOUNT_THRESHOLD: f64 = 0.05;

/// Length-delta ratio above which a description change is material.
const DESCRIPTION_THRESHOLD: f64 = 0.20;

/// Parse an upstream date string to a calendar date, discarding any time
/// component. Accepts RFC 3339 or plain `YYYY-MM-DD`.
pub fn normalize_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.date_naive());
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.date());
    }
    None
}

/// Monetary policy: both absent is unchanged, one-sided presence is
/// material, and a present pair is material above a 5% relative delta.
/// Non-finite values are always material.
pub fn amount_changed(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(old), Some(new)) => {
            if !old.is_finite() || !new.is_finite() {
                return true;
            }
            if old == 0.0 && new == 0.0 {
                return false;
            }
            if old == 0.0 || new == 0.0 {
                return true;
            }
            ((new - old).abs() / old.abs()) > AMOUNT_THRESHOLD
        }
    }
}

/// Date policy: compare calendar dates only.
pub fn date_changed(old: Option<NaiveDate>, new: Option<&str>) -> bool {
    let new = new.and_then(normalize_date);
    match (old, new) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(old), Some(new)) => old != new,
    }
}

/// Status policy: case-insensitive, whitespace-trimmed comparison.
pub fn status_changed(old: Option<&str>, new: Option<&str>) -> bool {
    match (old, new) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(old), Some(new)) => !old.trim().eq_ignore_ascii_case(new.trim()),
    }
}

/// Description policy: material only when the length delta exceeds 20% of
/// the old length.
pub fn description_changed(old: Option<&str>, new: Option<&str>) -> bool {
    match (old, new) {
        (None, None) => false,
        (None, Some(_)) | (Some(_), None) => true,
        (Some(old), Some(new)) => {
            let old_len = old.len();
            let delta = old_len.abs_diff(new.len()) as f64;
            delta / (old_len.max(1) as f64) > DESCRIPTION_THRESHOLD
        }
    }
}

/// Whether any tracked field differs materially between the upstream record
/// and the persisted row. Fields outside the tracked set are ignored.
pub fn has_material_changes(api: &Opportunity, db: &PersistedOpportunity) -> bool {
    amount_changed(db.minimum_award, api.minimum_award)
        || amount_changed(db.maximum_award, api.maximum_award)
        || amount_changed(db.total_funding_available, api.total_funding_available)
        || date_changed(db.open_date, api.open_date.as_deref())
        || date_changed(db.close_date, api.close_date.as_deref())
        || status_changed(db.status.as_deref(), api.status.as_deref())
        || description_changed(db.description.as_deref(), api.description.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::persisted;

    #[test]
    fn test_amount_boundary_five_percent() {
        // Exactly 5% is not material; strictly greater is
        assert!(!amount_changed(Some(100_000.0), Some(105_000.0)));
        assert!(!amount_changed(Some(100_000.0), Some(104_900.0)));
        assert!(amount_changed(Some(100_000.0), Some(105_100.0)));
    }

    #[test]
    fn test_amount_null_and_zero_policies() {
        assert!(!amount_changed(None, None));
        assert!(amount_changed(None, Some(1.0)));
        assert!(amount_changed(Some(1.0), None));
        assert!(!amount_changed(Some(0.0), Some(0.0)));
        assert!(amount_changed(Some(0.0), Some(500.0)));
        assert!(amount_changed(Some(500.0), Some(0.0)));
    }

    #[test]
    fn test_amount_non_finite_is_material() {
        assert!(amount_changed(Some(100.0), Some(f64::NAN)));
        assert!(amount_changed(Some(f64::INFINITY), Some(100.0)));
    }

    #[test]
    fn test_date_normalization_discards_time() {
        let stored = NaiveDate::from_ymd_opt(2024, 12, 31);
        assert!(!date_changed(stored, Some("2024-12-31T23:59:00Z")));
        assert!(!date_changed(stored, Some("2024-12-31")));
        assert!(date_changed(stored, Some("2025-01-01")));
        assert!(date_changed(None, Some("2024-12-31")));
        assert!(!date_changed(None, None));
    }

    #[test]
    fn test_status_comparison() {
        assert!(!status_changed(Some("Open"), Some("  open ")));
        assert!(status_changed(Some("Open"), Some("Closed")));
        assert!(status_changed(None, Some("Open")));
    }

    #[test]
    fn test_description_boundary_twenty_percent() {
        let old = "x".repeat(100);
        // Exactly 20% longer is not material
        assert!(!description_changed(Some(&old), Some(&"x".repeat(120))));
        // Strictly more than 20% is
        assert!(description_changed(Some(&old), Some(&"x".repeat(121))));
        assert!(description_changed(Some(&old), Some(&"x".repeat(79))));
    }

    #[test]
    fn test_record_level_fold() {
        let mut db = persisted("G-1", "Federal Research Grant");
        db.maximum_award = Some(500_000.0);
        db.status = Some("open".to_string());

        let mut api = Opportunity::new("G-1", "Federal Research Grant");
        api.maximum_award = Some(500_000.0);
        api.status = Some("OPEN".to_string());
        assert!(!has_material_changes(&api, &db));

        api.maximum_award = Some(750_000.0);
        assert!(has_material_changes(&api, &db));
    }
}
