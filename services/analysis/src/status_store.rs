use crate::config::DatabaseConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use prism_pipeline::{PipelineError, PipelineStatus, StatusRecord, StatusStore};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};

/// Row of the `pipeline_status` table
#[derive(Debug, Clone, FromRow)]
pub struct StatusRow {
    pub base_id: String,
    pub status: String,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<StatusRow> for StatusRecord {
    type Error = PipelineError;

    fn try_from(row: StatusRow) -> Result<Self, Self::Error> {
        Ok(StatusRecord {
            base_id: row.base_id,
            status: row.status.parse()?,
            updated_at: row.updated_at,
        })
    }
}

fn db_error(context: &str, e: sqlx::Error) -> PipelineError {
    PipelineError::Transport(format!("{}: {}", context, e))
}

/// Lifecycle status store in PostgreSQL
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    /// Create a new status store with connection pool
    pub async fn new(config: &DatabaseConfig, url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait::async_trait]
impl StatusStore for PgStatusStore {
    #[instrument(skip(self), fields(base_id = %base_id, status = %status))]
    async fn advance(
        &self,
        base_id: &str,
        status: PipelineStatus,
    ) -> prism_pipeline::Result<StatusRecord> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin transaction", e))?;

        // Only moves forward; a redelivered earlier stage leaves the row alone
        let updated = sqlx::query(
            r#"
            INSERT INTO pipeline_status (base_id, status, status_rank, created_at, updated_at)
            VALUES ($1, $2, $3, NOW(), NOW())
            ON CONFLICT (base_id) DO UPDATE
                SET status = EXCLUDED.status,
                    status_rank = EXCLUDED.status_rank,
                    updated_at = NOW()
                WHERE pipeline_status.status_rank < EXCLUDED.status_rank
            "#,
        )
        .bind(base_id)
        .bind(status.as_str())
        .bind(status.rank())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to upsert pipeline status", e))?
        .rows_affected();

        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT base_id, status, updated_at
            FROM pipeline_status
            WHERE base_id = $1
            "#,
        )
        .bind(base_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to read pipeline status", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit transaction", e))?;

        debug!(updated = updated > 0, current = %row.status, "Pipeline status advanced");
        metrics::counter!("analysis.status.advanced", "status" => status.as_str())
            .increment(updated);

        row.try_into()
    }

    async fn get(&self, base_id: &str) -> prism_pipeline::Result<Option<StatusRecord>> {
        let row = sqlx::query_as::<_, StatusRow>(
            r#"
            SELECT base_id, status, updated_at
            FROM pipeline_status
            WHERE base_id = $1
            "#,
        )
        .bind(base_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to query pipeline status", e))?;

        row.map(StatusRecord::try_from).transpose()
    }

    async fn ping(&self) -> prism_pipeline::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Database ping failed", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_into_record() {
        let now = Utc::now();
        let row = StatusRow {
            base_id: "req-1".to_string(),
            status: "synthesized".to_string(),
            updated_at: now,
        };

        let record = StatusRecord::try_from(row).unwrap();
        assert_eq!(record.base_id, "req-1");
        assert_eq!(record.status, PipelineStatus::Synthesized);
        assert_eq!(record.updated_at, now);
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let row = StatusRow {
            base_id: "req-1".to_string(),
            status: "archived".to_string(),
            updated_at: Utc::now(),
        };
        assert!(matches!(
            StatusRecord::try_from(row),
            Err(PipelineError::Serialization(_))
        ));
    }
}
