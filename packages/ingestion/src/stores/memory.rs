//! In-memory storage implementation for testing and development.
//!
//! Mirrors the Postgres behavior that matters to the pipeline: the unique
//! key on `(funding_source_id, api_opportunity_id)`, find-or-create funding
//! sources, and field-level updates that never touch protected columns.
//! Not suitable for production; data is lost on drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::store::{
    OpportunityRow, OpportunityStore, RunStore, UpdatePayload, WriteMode, WriteOutcome,
};
use crate::types::opportunity::{FundingSource, PersistedOpportunity, SourceDescriptor};
use crate::types::run::{DuplicateSession, OpportunityPath, PipelineRun, PipelineStage};

#[derive(Default)]
pub struct MemoryStore {
    opportunities: RwLock<HashMap<Uuid, PersistedOpportunity>>,
    sources: RwLock<HashMap<Uuid, FundingSource>>,
    eligibility: RwLock<HashMap<Uuid, Vec<String>>>,

    runs: RwLock<HashMap<Uuid, PipelineRun>>,
    stages: RwLock<Vec<PipelineStage>>,
    paths: RwLock<Vec<OpportunityPath>>,
    sessions: RwLock<Vec<DuplicateSession>>,

    updates_applied: AtomicUsize,
    fail_lookups: AtomicBool,
    fail_run_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a persisted opportunity directly, bypassing sanitization.
    pub fn seed_opportunity(&self, row: PersistedOpportunity) {
        self.opportunities.write().unwrap().insert(row.id, row);
    }

    pub fn get_opportunity(&self, id: Uuid) -> Option<PersistedOpportunity> {
        self.opportunities.read().unwrap().get(&id).cloned()
    }

    pub fn opportunity_count(&self) -> usize {
        self.opportunities.read().unwrap().len()
    }

    /// Number of field-level updates applied.
    pub fn update_count(&self) -> usize {
        self.updates_applied.load(Ordering::SeqCst)
    }

    pub fn state_eligibility(&self, opportunity_id: Uuid) -> Vec<String> {
        self.eligibility
            .read()
            .unwrap()
            .get(&opportunity_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_run(&self, id: Uuid) -> Option<PipelineRun> {
        self.runs.read().unwrap().get(&id).cloned()
    }

    pub fn path_count(&self) -> usize {
        self.paths.read().unwrap().len()
    }

    pub fn paths(&self) -> Vec<OpportunityPath> {
        self.paths.read().unwrap().clone()
    }

    pub fn stages_for_run(&self, run_id: Uuid) -> Vec<PipelineStage> {
        let mut stages: Vec<PipelineStage> = self
            .stages
            .read()
            .unwrap()
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.stage_order);
        stages
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Make subsequent batched lookups fail, to exercise degraded
    /// detection.
    pub fn set_fail_lookups(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    /// Make run-telemetry writes fail, to exercise best-effort tracking.
    pub fn set_fail_run_writes(&self, fail: bool) {
        self.fail_run_writes.store(fail, Ordering::SeqCst);
    }

    fn lookup_guard(&self) -> Result<()> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            Err(PipelineError::storage(std::io::Error::other(
                "injected lookup failure",
            )))
        } else {
            Ok(())
        }
    }

    fn run_write_guard(&self) -> Result<()> {
        if self.fail_run_writes.load(Ordering::SeqCst) {
            Err(PipelineError::storage(std::io::Error::other(
                "injected run-write failure",
            )))
        } else {
            Ok(())
        }
    }

    fn row_to_persisted(row: &OpportunityRow, id: Uuid) -> PersistedOpportunity {
        let now = chrono::Utc::now();
        PersistedOpportunity {
            id,
            funding_source_id: row.funding_source_id,
            api_opportunity_id: row.api_opportunity_id.clone(),
            raw_response_id: row.raw_response_id,
            title: row.title.clone(),
            description: row.description.clone(),
            status: row.status.clone(),
            open_date: row.open_date,
            close_date: row.close_date,
            minimum_award: row.minimum_award,
            maximum_award: row.maximum_award,
            total_funding_available: row.total_funding_available,
            enhanced_content: None,
            admin_notes: None,
            api_updated_at: row.api_updated_at,
            updated_at: now,
            created_at: now,
        }
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    async fn find_by_api_ids(
        &self,
        funding_source_id: Uuid,
        api_ids: &[String],
    ) -> Result<Vec<PersistedOpportunity>> {
        self.lookup_guard()?;
        Ok(self
            .opportunities
            .read()
            .unwrap()
            .values()
            .filter(|row| {
                row.funding_source_id == funding_source_id
                    && api_ids.iter().any(|id| *id == row.api_opportunity_id)
            })
            .cloned()
            .collect())
    }

    async fn find_by_titles(
        &self,
        funding_source_id: Uuid,
        titles: &[String],
    ) -> Result<Vec<PersistedOpportunity>> {
        self.lookup_guard()?;
        Ok(self
            .opportunities
            .read()
            .unwrap()
            .values()
            .filter(|row| {
                row.funding_source_id == funding_source_id
                    && titles
                        .iter()
                        .any(|t| t.trim().eq_ignore_ascii_case(row.title.trim()))
            })
            .cloned()
            .collect())
    }

    async fn resolve_funding_source(&self, source: &SourceDescriptor) -> Result<Uuid> {
        let mut sources = self.sources.write().unwrap();

        if let Some(existing) = sources
            .values_mut()
            .find(|s| s.name.eq_ignore_ascii_case(&source.name))
        {
            // Fill missing contact fields only
            if existing.agency.is_none() {
                existing.agency = source.agency.clone();
            }
            if existing.website.is_none() {
                existing.website = source.website.clone();
            }
            if existing.contact_email.is_none() {
                existing.contact_email = source.contact_email.clone();
            }
            if existing.contact_phone.is_none() {
                existing.contact_phone = source.contact_phone.clone();
            }
            existing.updated_at = chrono::Utc::now();
            return Ok(existing.id);
        }

        let now = chrono::Utc::now();
        let record = FundingSource {
            id: source.id,
            name: source.name.clone(),
            agency: source.agency.clone(),
            website: source.website.clone(),
            contact_email: source.contact_email.clone(),
            contact_phone: source.contact_phone.clone(),
            created_at: now,
            updated_at: now,
        };
        sources.insert(record.id, record);
        Ok(source.id)
    }

    async fn get_funding_source(&self, id: Uuid) -> Result<Option<FundingSource>> {
        Ok(self.sources.read().unwrap().get(&id).cloned())
    }

    async fn insert_opportunity(
        &self,
        row: &OpportunityRow,
        mode: WriteMode,
    ) -> Result<WriteOutcome> {
        let mut opportunities = self.opportunities.write().unwrap();

        let existing = opportunities
            .values()
            .find(|r| {
                r.funding_source_id == row.funding_source_id
                    && r.api_opportunity_id == row.api_opportunity_id
            })
            .map(|r| r.id);

        match (existing, mode) {
            (Some(_), WriteMode::Insert) => Ok(WriteOutcome::Duplicate),
            (Some(id), WriteMode::Upsert) => {
                let current = opportunities.get(&id).cloned();
                let mut updated = Self::row_to_persisted(row, id);
                if let Some(current) = current {
                    // Protected fields survive the upsert
                    updated.enhanced_content = current.enhanced_content;
                    updated.admin_notes = current.admin_notes;
                    updated.created_at = current.created_at;
                }
                opportunities.insert(id, updated);
                Ok(WriteOutcome::Updated { id })
            }
            (None, _) => {
                let id = Uuid::new_v4();
                opportunities.insert(id, Self::row_to_persisted(row, id));
                Ok(WriteOutcome::Inserted { id })
            }
        }
    }

    async fn update_opportunity(&self, id: Uuid, payload: &UpdatePayload) -> Result<()> {
        let mut opportunities = self.opportunities.write().unwrap();
        let row = opportunities
            .get_mut(&id)
            .ok_or_else(|| PipelineError::Constraint {
                reason: format!("no opportunity with id {id}"),
            })?;

        if let Some(title) = &payload.title {
            row.title = title.clone();
        }
        if let Some(value) = payload.minimum_award {
            row.minimum_award = Some(value);
        }
        if let Some(value) = payload.maximum_award {
            row.maximum_award = Some(value);
        }
        if let Some(value) = payload.total_funding_available {
            row.total_funding_available = Some(value);
        }
        if let Some(date) = payload.open_date {
            row.open_date = Some(date);
        }
        if let Some(date) = payload.close_date {
            row.close_date = Some(date);
        }
        row.updated_at = payload.updated_at;
        if payload.api_updated_at.is_some() {
            row.api_updated_at = payload.api_updated_at;
        }
        if payload.raw_response_id.is_some() {
            row.raw_response_id = payload.raw_response_id;
        }

        self.updates_applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn replace_state_eligibility(
        &self,
        opportunity_id: Uuid,
        states: &[String],
    ) -> Result<()> {
        self.eligibility
            .write()
            .unwrap()
            .insert(opportunity_id, states.to_vec());
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        self.run_write_guard()?;
        self.runs.write().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        self.run_write_guard()?;
        self.runs.write().unwrap().insert(run.id, run.clone());
        Ok(())
    }

    async fn insert_stage(&self, stage: &PipelineStage) -> Result<()> {
        self.run_write_guard()?;
        self.stages.write().unwrap().push(stage.clone());
        Ok(())
    }

    async fn insert_path(&self, path: &OpportunityPath) -> Result<()> {
        self.run_write_guard()?;
        self.paths.write().unwrap().push(path.clone());
        Ok(())
    }

    async fn insert_duplicate_session(&self, session: &DuplicateSession) -> Result<()> {
        self.run_write_guard()?;
        self.sessions.write().unwrap().push(session.clone());
        Ok(())
    }
}
