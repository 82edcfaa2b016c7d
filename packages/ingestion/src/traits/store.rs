//! Storage contracts for opportunities and run telemetry.
//!
//! Stages are written against these traits; `PostgresStore` and
//! `MemoryStore` provide the implementations. The write-side types here
//! make the protected-field ban mechanical: an [`UpdatePayload`] simply has
//! no slot for anything outside the six critical fields plus the three
//! bookkeeping columns.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::types::opportunity::{FundingSource, PersistedOpportunity, SourceDescriptor};
use crate::types::run::{DuplicateSession, OpportunityPath, PipelineRun, PipelineStage};

/// The six fields the direct-update path may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalField {
    Title,
    MinimumAward,
    MaximumAward,
    TotalFundingAvailable,
    OpenDate,
    CloseDate,
}

impl CriticalField {
    pub const ALL: [CriticalField; 6] = [
        CriticalField::Title,
        CriticalField::MinimumAward,
        CriticalField::MaximumAward,
        CriticalField::TotalFundingAvailable,
        CriticalField::OpenDate,
        CriticalField::CloseDate,
    ];

    /// Database column this field writes to.
    pub fn column(&self) -> &'static str {
        match self {
            CriticalField::Title => "title",
            CriticalField::MinimumAward => "minimum_award",
            CriticalField::MaximumAward => "maximum_award",
            CriticalField::TotalFundingAvailable => "total_funding_available",
            CriticalField::OpenDate => "open_date",
            CriticalField::CloseDate => "close_date",
        }
    }
}

/// Field-level update for one persisted opportunity.
///
/// A `None` critical field is excluded from the write. The three
/// bookkeeping columns (`updated_at`, `api_updated_at`, `raw_response_id`)
/// ride along on every update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePayload {
    pub title: Option<String>,
    pub minimum_award: Option<f64>,
    pub maximum_award: Option<f64>,
    pub total_funding_available: Option<f64>,
    pub open_date: Option<NaiveDate>,
    pub close_date: Option<NaiveDate>,

    pub updated_at: DateTime<Utc>,
    pub api_updated_at: Option<DateTime<Utc>>,
    pub raw_response_id: Option<Uuid>,
}

impl UpdatePayload {
    /// Empty payload carrying only the bookkeeping columns.
    pub fn bookkeeping(api_updated_at: Option<DateTime<Utc>>, raw_response_id: Option<Uuid>) -> Self {
        Self {
            title: None,
            minimum_award: None,
            maximum_award: None,
            total_funding_available: None,
            open_date: None,
            close_date: None,
            updated_at: Utc::now(),
            api_updated_at,
            raw_response_id,
        }
    }

    /// Which critical fields this payload writes.
    pub fn critical_fields(&self) -> Vec<CriticalField> {
        let mut fields = Vec::new();
        if self.title.is_some() {
            fields.push(CriticalField::Title);
        }
        if self.minimum_award.is_some() {
            fields.push(CriticalField::MinimumAward);
        }
        if self.maximum_award.is_some() {
            fields.push(CriticalField::MaximumAward);
        }
        if self.total_funding_available.is_some() {
            fields.push(CriticalField::TotalFundingAvailable);
        }
        if self.open_date.is_some() {
            fields.push(CriticalField::OpenDate);
        }
        if self.close_date.is_some() {
            fields.push(CriticalField::CloseDate);
        }
        fields
    }

    /// Whether any critical field qualified for the update.
    pub fn has_critical_changes(&self) -> bool {
        !self.critical_fields().is_empty()
    }

    /// Every column this payload writes, bookkeeping included.
    pub fn columns(&self) -> Vec<&'static str> {
        let mut cols: Vec<&'static str> =
            self.critical_fields().iter().map(|f| f.column()).collect();
        cols.push("updated_at");
        if self.api_updated_at.is_some() {
            cols.push("api_updated_at");
        }
        if self.raw_response_id.is_some() {
            cols.push("raw_response_id");
        }
        cols
    }
}

/// Sanitized write row for a new opportunity, snake_case at the boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityRow {
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
    pub eligible_applicants: Vec<String>,
    pub funding_instrument_type: Option<String>,

    pub enhanced_description: Option<String>,
    pub actionable_summary: Option<String>,
    pub program_overview: Option<String>,
    pub program_use_cases: Option<String>,
    pub application_summary: Option<String>,
    pub program_insights: Option<String>,
    /// Null scoring stays null; the storage stage never zero-fills it
    pub scoring: Option<serde_json::Value>,
    pub relevance_reasoning: Option<String>,
    pub concerns: Vec<String>,

    pub api_updated_at: Option<DateTime<Utc>>,
}

/// How the storage stage writes a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Insert,
    /// Insert-or-update on the `(source, api id)` key
    Upsert,
}

/// Outcome of one opportunity write.
#[derive(Debug, Clone)]
pub enum WriteOutcome {
    Inserted { id: Uuid },
    /// Upsert refreshed an existing row
    Updated { id: Uuid },
    /// Unique-constraint hit on `(funding_source_id, api_opportunity_id)`
    Duplicate,
}

/// Read/write contract for persisted opportunities.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    /// Batched lookup by upstream ids within one source.
    async fn find_by_api_ids(
        &self,
        funding_source_id: Uuid,
        api_ids: &[String],
    ) -> Result<Vec<PersistedOpportunity>>;

    /// Batched lookup by exact title (case-insensitive) within one source.
    async fn find_by_titles(
        &self,
        funding_source_id: Uuid,
        titles: &[String],
    ) -> Result<Vec<PersistedOpportunity>>;

    /// Find-or-create the funding source by name, filling only missing
    /// contact fields on an existing row.
    async fn resolve_funding_source(&self, source: &SourceDescriptor) -> Result<Uuid>;

    /// Fetch a funding source by id.
    async fn get_funding_source(&self, id: Uuid) -> Result<Option<FundingSource>>;

    /// Write one sanitized row; unique-key races surface as
    /// [`WriteOutcome::Duplicate`], never as an error.
    async fn insert_opportunity(&self, row: &OpportunityRow, mode: WriteMode) -> Result<WriteOutcome>;

    /// Apply a field-level update to one opportunity in a single statement.
    async fn update_opportunity(&self, id: Uuid, payload: &UpdatePayload) -> Result<()>;

    /// Replace state-eligibility rows for one opportunity.
    async fn replace_state_eligibility(&self, opportunity_id: Uuid, states: &[String])
        -> Result<()>;
}

/// Write contract for run telemetry. All callers treat failures here as
/// best-effort.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &PipelineRun) -> Result<()>;
    async fn update_run(&self, run: &PipelineRun) -> Result<()>;
    async fn insert_stage(&self, stage: &PipelineStage) -> Result<()>;
    async fn insert_path(&self, path: &OpportunityPath) -> Result<()>;
    async fn insert_duplicate_session(&self, session: &DuplicateSession) -> Result<()>;
}
