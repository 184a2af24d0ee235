//! Runner-side job receipts.
//!
//! The agent runner allocates a job and reports it through the control
//! channel; the runtime keeps the receipt so operators can target a run by
//! job id and recovery can reap zombies.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub dispatch_id: Option<Uuid>,
    pub agent_id: Uuid,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    /// Record the job the runner reported for a dispatch.
    pub async fn start(id: Uuid, dispatch_id: Uuid, agent_id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (id, dispatch_id, agent_id, status)
            VALUES ($1, $2, $3, 'running')
            ON CONFLICT (id) DO UPDATE SET dispatch_id = EXCLUDED.dispatch_id
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(dispatch_id)
        .bind(agent_id)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn finish(id: Uuid, status: JobStatus, error: Option<&str>, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2, error = $3, finished_at = NOW()
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn cancel_for_dispatches(dispatch_ids: &[Uuid], pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', finished_at = NOW()
            WHERE dispatch_id = ANY($1) AND status IN ('pending', 'running')
            "#,
        )
        .bind(dispatch_ids)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Fail jobs stuck in pending/running past the staleness cutoff.
    pub async fn reap_zombies(cutoff_seconds: i64, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error = 'zombie job reaped', finished_at = NOW()
            WHERE status IN ('pending', 'running')
              AND started_at < NOW() - ($1 || ' seconds')::INTERVAL
            "#,
        )
        .bind(cutoff_seconds.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
