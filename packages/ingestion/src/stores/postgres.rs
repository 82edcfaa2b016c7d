//! PostgreSQL storage implementation.
//!
//! Production backend for persisted opportunities and run telemetry. The
//! schema is bootstrapped at construction with idempotent DDL; the unique
//! constraint on `(funding_source_id, api_opportunity_id)` is what makes
//! concurrent ingestion safe - duplicate-key races surface as
//! [`WriteOutcome::Duplicate`], never as errors.

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{QueryBuilder, Row};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::traits::store::{
    OpportunityRow, OpportunityStore, RunStore, UpdatePayload, WriteMode, WriteOutcome,
};
use crate::types::opportunity::{FundingSource, PersistedOpportunity, SourceDescriptor};
use crate::types::run::{DuplicateSession, OpportunityPath, PipelineRun, PipelineStage};

const OPPORTUNITY_COLUMNS: &str = r#"
    id, funding_source_id, api_opportunity_id, raw_response_id,
    title, description, status, open_date, close_date,
    minimum_award, maximum_award, total_funding_available,
    enhanced_content, admin_notes, api_updated_at, updated_at, created_at
"#;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and bootstrap the schema.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(PipelineError::storage)?;
        Self::from_pool(pool).await
    }

    /// Reuse an existing connection pool (e.g. the server's).
    pub async fn from_pool(pool: PgPool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS funding_sources (
                id UUID PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                agency TEXT,
                website TEXT,
                contact_email TEXT,
                contact_phone TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS funding_opportunities (
                id UUID PRIMARY KEY,
                funding_source_id UUID NOT NULL REFERENCES funding_sources(id),
                api_opportunity_id TEXT NOT NULL,
                raw_response_id UUID,
                title TEXT NOT NULL,
                description TEXT,
                status TEXT,
                open_date DATE,
                close_date DATE,
                minimum_award DOUBLE PRECISION,
                maximum_award DOUBLE PRECISION,
                total_funding_available DOUBLE PRECISION,
                eligible_applicants JSONB NOT NULL DEFAULT '[]',
                funding_instrument_type TEXT,
                enhanced_description TEXT,
                actionable_summary TEXT,
                program_overview TEXT,
                program_use_cases TEXT,
                application_summary TEXT,
                program_insights TEXT,
                scoring JSONB,
                relevance_reasoning TEXT,
                concerns JSONB NOT NULL DEFAULT '[]',
                enhanced_content TEXT,
                admin_notes TEXT,
                api_updated_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                UNIQUE (funding_source_id, api_opportunity_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_funding_opportunities_title
            ON funding_opportunities (funding_source_id, LOWER(TRIM(title)))
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS opportunity_state_eligibility (
                opportunity_id UUID NOT NULL REFERENCES funding_opportunities(id) ON DELETE CASCADE,
                state_code TEXT NOT NULL,
                PRIMARY KEY (opportunity_id, state_code)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_runs (
                id UUID PRIMARY KEY,
                source_id UUID NOT NULL,
                status TEXT NOT NULL,
                pipeline_version TEXT NOT NULL,
                configuration JSONB NOT NULL DEFAULT '{}',
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                total_execution_ms BIGINT NOT NULL DEFAULT 0,
                totals JSONB NOT NULL DEFAULT '{}',
                success_count BIGINT NOT NULL DEFAULT 0,
                failure_count BIGINT NOT NULL DEFAULT 0
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_stages (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                name TEXT NOT NULL,
                stage_order INT NOT NULL,
                status TEXT NOT NULL,
                input_count BIGINT NOT NULL,
                output_count BIGINT NOT NULL,
                tokens_used BIGINT NOT NULL,
                api_calls BIGINT NOT NULL,
                results JSONB NOT NULL DEFAULT '{}',
                performance JSONB NOT NULL DEFAULT '{}',
                execution_ms BIGINT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS opportunity_processing_paths (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                api_opportunity_id TEXT NOT NULL,
                path_type TEXT NOT NULL,
                reason TEXT,
                stages_processed JSONB NOT NULL DEFAULT '[]',
                final_outcome TEXT NOT NULL,
                tokens_used BIGINT NOT NULL DEFAULT 0,
                processing_ms BIGINT NOT NULL DEFAULT 0,
                cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
                duplicate_detected BOOLEAN NOT NULL DEFAULT FALSE,
                changes_detected BOOLEAN,
                detection_method TEXT,
                quality_score DOUBLE PRECISION
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS duplicate_detection_sessions (
                id UUID PRIMARY KEY,
                run_id UUID NOT NULL,
                source_id UUID NOT NULL,
                total_records BIGINT NOT NULL,
                new_count BIGINT NOT NULL,
                update_count BIGINT NOT NULL,
                skip_count BIGINT NOT NULL,
                method_counts JSONB NOT NULL DEFAULT '{}',
                estimated_tokens_saved BIGINT NOT NULL DEFAULT 0,
                query_count INT NOT NULL DEFAULT 0,
                detection_ms BIGINT NOT NULL DEFAULT 0
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(PipelineError::storage)?;
        }
        debug!("pipeline schema bootstrapped");
        Ok(())
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

/// Serialize a serde-tagged enum to its snake_case wire string.
fn enum_str<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

#[async_trait]
impl OpportunityStore for PostgresStore {
    async fn find_by_api_ids(
        &self,
        funding_source_id: Uuid,
        api_ids: &[String],
    ) -> Result<Vec<PersistedOpportunity>> {
        if api_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM funding_opportunities \
             WHERE funding_source_id = $1 AND api_opportunity_id = ANY($2)"
        );
        sqlx::query_as::<_, PersistedOpportunity>(&sql)
            .bind(funding_source_id)
            .bind(api_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::storage)
    }

    async fn find_by_titles(
        &self,
        funding_source_id: Uuid,
        titles: &[String],
    ) -> Result<Vec<PersistedOpportunity>> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }
        let needles: Vec<String> = titles.iter().map(|t| t.trim().to_lowercase()).collect();
        let sql = format!(
            "SELECT {OPPORTUNITY_COLUMNS} FROM funding_opportunities \
             WHERE funding_source_id = $1 AND LOWER(TRIM(title)) = ANY($2)"
        );
        sqlx::query_as::<_, PersistedOpportunity>(&sql)
            .bind(funding_source_id)
            .bind(&needles)
            .fetch_all(&self.pool)
            .await
            .map_err(PipelineError::storage)
    }

    async fn resolve_funding_source(&self, source: &SourceDescriptor) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO funding_sources (id, name, agency, website, contact_email, contact_phone)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                agency = COALESCE(funding_sources.agency, EXCLUDED.agency),
                website = COALESCE(funding_sources.website, EXCLUDED.website),
                contact_email = COALESCE(funding_sources.contact_email, EXCLUDED.contact_email),
                contact_phone = COALESCE(funding_sources.contact_phone, EXCLUDED.contact_phone),
                updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(source.id)
        .bind(&source.name)
        .bind(&source.agency)
        .bind(&source.website)
        .bind(&source.contact_email)
        .bind(&source.contact_phone)
        .fetch_one(&self.pool)
        .await
        .map_err(PipelineError::storage)?;

        row.try_get("id").map_err(PipelineError::storage)
    }

    async fn get_funding_source(&self, id: Uuid) -> Result<Option<FundingSource>> {
        sqlx::query_as::<_, FundingSource>(
            "SELECT id, name, agency, website, contact_email, contact_phone, \
             created_at, updated_at FROM funding_sources WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(PipelineError::storage)
    }

    async fn insert_opportunity(
        &self,
        row: &OpportunityRow,
        mode: WriteMode,
    ) -> Result<WriteOutcome> {
        let id = Uuid::new_v4();
        let eligible = serde_json::to_value(&row.eligible_applicants).unwrap_or_default();
        let concerns = serde_json::to_value(&row.concerns).unwrap_or_default();

        let insert = r#"
            INSERT INTO funding_opportunities (
                id, funding_source_id, api_opportunity_id, raw_response_id,
                title, description, status, open_date, close_date,
                minimum_award, maximum_award, total_funding_available,
                eligible_applicants, funding_instrument_type,
                enhanced_description, actionable_summary, program_overview,
                program_use_cases, application_summary, program_insights,
                scoring, relevance_reasoning, concerns, api_updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23, $24
            )
        "#;

        // Protected columns (enhanced_content, admin_notes) are absent from
        // the update list, so an upsert cannot clobber human edits.
        let upsert_suffix = r#"
            ON CONFLICT (funding_source_id, api_opportunity_id) DO UPDATE SET
                raw_response_id = EXCLUDED.raw_response_id,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                status = EXCLUDED.status,
                open_date = EXCLUDED.open_date,
                close_date = EXCLUDED.close_date,
                minimum_award = EXCLUDED.minimum_award,
                maximum_award = EXCLUDED.maximum_award,
                total_funding_available = EXCLUDED.total_funding_available,
                eligible_applicants = EXCLUDED.eligible_applicants,
                funding_instrument_type = EXCLUDED.funding_instrument_type,
                enhanced_description = EXCLUDED.enhanced_description,
                actionable_summary = EXCLUDED.actionable_summary,
                program_overview = EXCLUDED.program_overview,
                program_use_cases = EXCLUDED.program_use_cases,
                application_summary = EXCLUDED.application_summary,
                program_insights = EXCLUDED.program_insights,
                scoring = EXCLUDED.scoring,
                relevance_reasoning = EXCLUDED.relevance_reasoning,
                concerns = EXCLUDED.concerns,
                api_updated_at = EXCLUDED.api_updated_at,
                updated_at = NOW()
        "#;

        let sql = match mode {
            WriteMode::Insert => format!("{insert} RETURNING id, TRUE AS inserted"),
            WriteMode::Upsert => {
                format!("{insert} {upsert_suffix} RETURNING id, (xmax = 0) AS inserted")
            }
        };

        let result = sqlx::query(&sql)
            .bind(id)
            .bind(row.funding_source_id)
            .bind(&row.api_opportunity_id)
            .bind(row.raw_response_id)
            .bind(&row.title)
            .bind(&row.description)
            .bind(&row.status)
            .bind(row.open_date)
            .bind(row.close_date)
            .bind(row.minimum_award)
            .bind(row.maximum_award)
            .bind(row.total_funding_available)
            .bind(eligible)
            .bind(&row.funding_instrument_type)
            .bind(&row.enhanced_description)
            .bind(&row.actionable_summary)
            .bind(&row.program_overview)
            .bind(&row.program_use_cases)
            .bind(&row.application_summary)
            .bind(&row.program_insights)
            .bind(&row.scoring)
            .bind(&row.relevance_reasoning)
            .bind(concerns)
            .bind(row.api_updated_at)
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(record) => {
                let row_id: Uuid = record.try_get("id").map_err(PipelineError::storage)?;
                let inserted: bool = record.try_get("inserted").map_err(PipelineError::storage)?;
                if inserted {
                    Ok(WriteOutcome::Inserted { id: row_id })
                } else {
                    Ok(WriteOutcome::Updated { id: row_id })
                }
            }
            Err(e) if is_unique_violation(&e) => Ok(WriteOutcome::Duplicate),
            Err(e) => Err(PipelineError::storage(e)),
        }
    }

    async fn update_opportunity(&self, id: Uuid, payload: &UpdatePayload) -> Result<()> {
        let mut builder: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("UPDATE funding_opportunities SET ");
        {
            let mut set = builder.separated(", ");

            if let Some(title) = &payload.title {
                set.push("title = ").push_bind_unseparated(title);
            }
            if let Some(value) = payload.minimum_award {
                set.push("minimum_award = ").push_bind_unseparated(value);
            }
            if let Some(value) = payload.maximum_award {
                set.push("maximum_award = ").push_bind_unseparated(value);
            }
            if let Some(value) = payload.total_funding_available {
                set.push("total_funding_available = ")
                    .push_bind_unseparated(value);
            }
            if let Some(date) = payload.open_date {
                set.push("open_date = ").push_bind_unseparated(date);
            }
            if let Some(date) = payload.close_date {
                set.push("close_date = ").push_bind_unseparated(date);
            }
            set.push("updated_at = ")
                .push_bind_unseparated(payload.updated_at);
            if let Some(ts) = payload.api_updated_at {
                set.push("api_updated_at = ").push_bind_unseparated(ts);
            }
            if let Some(raw_id) = payload.raw_response_id {
                set.push("raw_response_id = ").push_bind_unseparated(raw_id);
            }
        }

        builder.push(" WHERE id = ").push_bind(id);

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(PipelineError::storage)?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::Constraint {
                reason: format!("no opportunity with id {id}"),
            });
        }
        Ok(())
    }

    async fn replace_state_eligibility(
        &self,
        opportunity_id: Uuid,
        states: &[String],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(PipelineError::storage)?;

        sqlx::query("DELETE FROM opportunity_state_eligibility WHERE opportunity_id = $1")
            .bind(opportunity_id)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;

        for state in states {
            sqlx::query(
                "INSERT INTO opportunity_state_eligibility (opportunity_id, state_code) \
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(opportunity_id)
            .bind(state)
            .execute(&mut *tx)
            .await
            .map_err(PipelineError::storage)?;
        }

        tx.commit().await.map_err(PipelineError::storage)
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn insert_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (
                id, source_id, status, pipeline_version, configuration,
                started_at, completed_at, total_execution_ms, totals,
                success_count, failure_count
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(run.id)
        .bind(run.source_id)
        .bind(enum_str(&run.status))
        .bind(&run.pipeline_version)
        .bind(&run.configuration)
        .bind(run.started_at)
        .bind(run.completed_at)
        .bind(run.total_execution_ms as i64)
        .bind(serde_json::to_value(&run.totals).unwrap_or_default())
        .bind(run.success_count as i64)
        .bind(run.failure_count as i64)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn update_run(&self, run: &PipelineRun) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pipeline_runs SET
                status = $2,
                completed_at = $3,
                total_execution_ms = $4,
                totals = $5,
                success_count = $6,
                failure_count = $7
            WHERE id = $1
            "#,
        )
        .bind(run.id)
        .bind(enum_str(&run.status))
        .bind(run.completed_at)
        .bind(run.total_execution_ms as i64)
        .bind(serde_json::to_value(&run.totals).unwrap_or_default())
        .bind(run.success_count as i64)
        .bind(run.failure_count as i64)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn insert_stage(&self, stage: &PipelineStage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_stages (
                id, run_id, name, stage_order, status, input_count,
                output_count, tokens_used, api_calls, results, performance,
                execution_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(stage.id)
        .bind(stage.run_id)
        .bind(&stage.name)
        .bind(stage.stage_order)
        .bind(enum_str(&stage.status))
        .bind(stage.input_count as i64)
        .bind(stage.output_count as i64)
        .bind(stage.tokens_used as i64)
        .bind(stage.api_calls as i64)
        .bind(&stage.results)
        .bind(&stage.performance)
        .bind(stage.execution_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn insert_path(&self, path: &OpportunityPath) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO opportunity_processing_paths (
                id, run_id, api_opportunity_id, path_type, reason,
                stages_processed, final_outcome, tokens_used, processing_ms,
                cost_usd, duplicate_detected, changes_detected,
                detection_method, quality_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(path.id)
        .bind(path.run_id)
        .bind(&path.api_opportunity_id)
        .bind(enum_str(&path.path_type))
        .bind(&path.reason)
        .bind(serde_json::to_value(&path.stages_processed).unwrap_or_default())
        .bind(enum_str(&path.final_outcome))
        .bind(path.tokens_used as i64)
        .bind(path.processing_ms as i64)
        .bind(path.cost_usd)
        .bind(path.duplicate_detected)
        .bind(path.changes_detected)
        .bind(&path.detection_method)
        .bind(path.quality_score)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }

    async fn insert_duplicate_session(&self, session: &DuplicateSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO duplicate_detection_sessions (
                id, run_id, source_id, total_records, new_count,
                update_count, skip_count, method_counts,
                estimated_tokens_saved, query_count, detection_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(session.id)
        .bind(session.run_id)
        .bind(session.source_id)
        .bind(session.total_records as i64)
        .bind(session.new_count as i64)
        .bind(session.update_count as i64)
        .bind(session.skip_count as i64)
        .bind(&session.method_counts)
        .bind(session.estimated_tokens_saved as i64)
        .bind(session.query_count as i32)
        .bind(session.detection_ms as i64)
        .execute(&self.pool)
        .await
        .map_err(PipelineError::storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_violation_detection_ignores_other_errors() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }
}
