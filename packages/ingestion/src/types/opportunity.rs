//! Opportunity records as they move through the pipeline.
//!
//! Upstream APIs speak camelCase JSON; the database speaks snake_case.
//! `Opportunity` is the in-memory view of an upstream record, and
//! `PersistedOpportunity` is the stored row. Unknown upstream fields are
//! carried verbatim in `extra` so nothing is lost between stages.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A funding opportunity as received from an upstream API.
///
/// Identity is `(source, id)` where `id` is the upstream's opportunity id.
/// `id` and `title` are required for matching; everything else is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub id: String,
    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// ISO-8601 date or datetime, kept as received
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub close_date: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_award: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_award: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_funding_available: Option<f64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eligible_applicants: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub funding_instrument_type: Option<String>,

    /// Last-modified timestamp reported by the upstream API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_updated_at: Option<DateTime<Utc>>,

    /// Unstructured upstream metadata, preserved untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Opportunity {
    /// Minimal constructor for records with just an id and title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            open_date: None,
            close_date: None,
            status: None,
            minimum_award: None,
            maximum_award: None,
            total_funding_available: None,
            eligible_applicants: Vec::new(),
            funding_instrument_type: None,
            api_updated_at: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Whether the title is long enough to participate in title matching.
    pub fn has_matchable_title(&self) -> bool {
        self.title.trim().len() > crate::pipeline::freshness::TITLE_MATCH_MIN_LEN
    }
}

/// A funding opportunity as stored in `funding_opportunities`.
///
/// `enhanced_content` and `admin_notes` hold human edits and are protected:
/// the pipeline never writes them after the initial insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct PersistedOpportunity {
    /// Opaque internal id
    pub id: Uuid,
    pub funding_source_id: Uuid,
    pub api_opportunity_id: String,
    pub raw_response_id: Option<Uuid>,

    pub title: String,
    pub description: Option<String>,
    pub status: Option<String>,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,
    pub minimum_award: Option<f64>,
    pub maximum_award: Option<f64>,
    pub total_funding_available: Option<f64>,

    // Protected fields, preserved across pipeline updates
    pub enhanced_content: Option<String>,
    pub admin_notes: Option<String>,

    /// Mirror of the upstream's last-modified timestamp
    pub api_updated_at: Option<DateTime<Utc>>,
    /// System-assigned on every write
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Descriptor of the upstream source a chunk came from.
///
/// `id` is the funding-source row when already resolved; the storage stage
/// resolves-or-creates by `name` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_phone: Option<String>,
}

impl SourceDescriptor {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            agency: None,
            website: None,
            contact_email: None,
            contact_phone: None,
        }
    }
}

/// A funding-source row (agency-level record opportunities link to).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::FromRow))]
pub struct FundingSource {
    pub id: Uuid,
    pub name: String,
    pub agency: Option<String>,
    pub website: Option<String>,
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
