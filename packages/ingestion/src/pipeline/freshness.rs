//! Freshness decision and title similarity.
//!
//! Both are pure functions so the duplicate detector's decisions can be
//! tested without a store. The freshness decision depends only on the two
//! upstream timestamps, the persisted review time, and the clock.

use chrono::{DateTime, Duration, Utc};

use crate::types::config::STALE_REVIEW_DAYS;

/// Minimum title length for similarity matching. Titles at or below this
/// length are too generic to match on.
pub const TITLE_MATCH_MIN_LEN: usize = 10;

pub const REASON_API_TIMESTAMP_NEWER: &str = "api_timestamp_newer";
pub const REASON_API_TIMESTAMP_NOT_NEWER: &str = "api_timestamp_not_newer";
pub const REASON_RECENTLY_REVIEWED: &str = "recently_reviewed";
pub const REASON_STALE_REVIEW: &str = "stale_review_90_days";

/// What to do with a matched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessDecision {
    Update { reason: &'static str },
    Skip { reason: &'static str },
}

impl FreshnessDecision {
    pub fn reason(&self) -> &'static str {
        match self {
            FreshnessDecision::Update { reason } | FreshnessDecision::Skip { reason } => reason,
        }
    }
}

/// Decide whether a matched record warrants an update.
///
/// The upstream timestamp wins when it is strictly newer than what we
/// stored. Otherwise the persisted review age governs: records reviewed
/// within the staleness window are skipped, older ones are refreshed.
pub fn decide_freshness(
    api_updated_input: Option<DateTime<Utc>>,
    api_updated_db: Option<DateTime<Utc>>,
    updated_at_db: DateTime<Utc>,
    now: DateTime<Utc>,
) -> FreshnessDecision {
    if let (Some(input), Some(db)) = (api_updated_input, api_updated_db) {
        if input > db {
            return FreshnessDecision::Update {
                reason: REASON_API_TIMESTAMP_NEWER,
            };
        }
    }

    let reviewed_recently = now - updated_at_db <= Duration::days(STALE_REVIEW_DAYS);
    if reviewed_recently {
        // Both timestamps present and comparable reads better as a
        // timestamp decision; anything else is just a recent review.
        let reason = if api_updated_input.is_some() && api_updated_db.is_some() {
            REASON_API_TIMESTAMP_NOT_NEWER
        } else {
            REASON_RECENTLY_REVIEWED
        };
        return FreshnessDecision::Skip { reason };
    }

    FreshnessDecision::Update {
        reason: REASON_STALE_REVIEW,
    }
}

/// Title similarity: trimmed, case-insensitive equality, or containment
/// where the shorter side is at least [`TITLE_MATCH_MIN_LEN`] characters.
pub fn titles_match(a: &str, b: &str) -> bool {
    let a = a.trim().to_lowercase();
    let b = b.trim().to_lowercase();
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }

    let (shorter, longer) = if a.len() <= b.len() { (&a, &b) } else { (&b, &a) };
    shorter.len() >= TITLE_MATCH_MIN_LEN && longer.contains(shorter.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn test_api_timestamp_newer_wins() {
        let decision = decide_freshness(
            Some(ts("2024-02-01T00:00:00Z")),
            Some(ts("2024-01-01T00:00:00Z")),
            ts("2024-01-02T00:00:00Z"),
            ts("2024-02-02T00:00:00Z"),
        );
        assert_eq!(
            decision,
            FreshnessDecision::Update {
                reason: REASON_API_TIMESTAMP_NEWER
            }
        );
    }

    #[test]
    fn test_equal_timestamps_recent_review_skips() {
        let t0 = ts("2024-01-01T00:00:00Z");
        let now = ts("2024-01-04T00:00:00Z");
        let decision = decide_freshness(Some(t0), Some(t0), now - Duration::days(3), now);
        assert_eq!(
            decision,
            FreshnessDecision::Skip {
                reason: REASON_API_TIMESTAMP_NOT_NEWER
            }
        );
    }

    #[test]
    fn test_absent_timestamps_recent_review_skips() {
        let now = ts("2024-06-01T00:00:00Z");
        let decision = decide_freshness(None, None, now - Duration::days(10), now);
        assert_eq!(
            decision,
            FreshnessDecision::Skip {
                reason: REASON_RECENTLY_REVIEWED
            }
        );
    }

    #[test]
    fn test_stale_review_forces_update() {
        let now = ts("2024-06-01T00:00:00Z");
        let decision = decide_freshness(None, None, now - Duration::days(91), now);
        assert_eq!(
            decision,
            FreshnessDecision::Update {
                reason: REASON_STALE_REVIEW
            }
        );
    }

    #[test]
    fn test_exactly_ninety_days_is_still_recent() {
        let now = ts("2024-06-01T00:00:00Z");
        let decision = decide_freshness(None, None, now - Duration::days(90), now);
        assert!(matches!(decision, FreshnessDecision::Skip { .. }));
    }

    #[test]
    fn test_older_api_timestamp_stale_review_updates() {
        let now = ts("2024-06-01T00:00:00Z");
        let decision = decide_freshness(
            Some(ts("2024-01-01T00:00:00Z")),
            Some(ts("2024-02-01T00:00:00Z")),
            now - Duration::days(120),
            now,
        );
        assert_eq!(
            decision,
            FreshnessDecision::Update {
                reason: REASON_STALE_REVIEW
            }
        );
    }

    #[test]
    fn test_titles_match_exact_and_case() {
        assert!(titles_match("Federal Research Grant", "federal research grant"));
        assert!(titles_match("  Federal Research Grant  ", "Federal Research Grant"));
    }

    #[test]
    fn test_titles_match_containment_gate() {
        // Shorter side >= 10 chars: containment counts
        assert!(titles_match(
            "Research Grant",
            "Federal Research Grant Program 2024"
        ));
        // Shorter side < 10 chars: containment rejected
        assert!(!titles_match("Grant", "Federal Research Grant"));
    }

    #[test]
    fn test_titles_match_empty() {
        assert!(!titles_match("", "Federal Research Grant"));
        assert!(!titles_match("   ", "Federal Research Grant"));
    }
}
