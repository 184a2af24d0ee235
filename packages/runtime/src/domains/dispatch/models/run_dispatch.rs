//! The dispatch table: one row per intended agent run.
//!
//! Claim/finalize are the store's leasing primitives. A claim stamps the
//! worker, the lease, and a fresh `claimed_epoch`; every transitional write
//! afterwards carries that epoch and no-ops on mismatch, so a preempted
//! holder can never double-resolve a row.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "dispatch_status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Abandoned,
    Merged,
}

impl DispatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Abandoned | Self::Merged
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "dispatch_control_state", rename_all = "snake_case")]
pub enum ControlState {
    Normal,
    PauseRequested,
    ResumeRequested,
    CancelRequested,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunDispatch {
    pub id: Uuid,
    pub run_key: String,
    pub queue_key: String,
    pub work_item_id: Uuid,
    pub agent_id: Uuid,
    pub status: DispatchStatus,
    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub claimed_epoch: i64,
    pub control_state: ControlState,
    pub control_reason: Option<String>,
    pub replay_of_dispatch_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub input_text: Option<String>,
    pub coalesced_text: Option<String>,
    pub error: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunDispatch {
    /// Insert a queued dispatch for a lane. A `run_key` collision means
    /// another promoter won; returns `None`.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_queued<'e, E>(
        run_key: &str,
        queue_key: &str,
        work_item_id: Uuid,
        agent_id: Uuid,
        input_text: Option<&str>,
        coalesced_text: &str,
        replay_of_dispatch_id: Option<Uuid>,
        executor: E,
    ) -> Result<Option<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO run_dispatches (
                id, run_key, queue_key, work_item_id, agent_id,
                input_text, coalesced_text, replay_of_dispatch_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (run_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(run_key)
        .bind(queue_key)
        .bind(work_item_id)
        .bind(agent_id)
        .bind(input_text)
        .bind(coalesced_text)
        .bind(replay_of_dispatch_id)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// Atomically claim the next runnable dispatch.
    ///
    /// Picks the oldest queued dispatch whose lane is idle, flips the lane to
    /// `running` pointing at it, stamps the lease and worker, and bumps the
    /// row epoch. Locks both the dispatch and its lane row so two workers can
    /// never claim into the same lane.
    pub async fn claim_next(
        worker_id: &str,
        lease_seconds: i64,
        pool: &PgPool,
    ) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            WITH next_dispatch AS (
                SELECT d.id, d.queue_key
                FROM run_dispatches d
                JOIN queue_lanes l ON l.queue_key = d.queue_key
                WHERE d.status = 'queued' AND l.state = 'queued'
                ORDER BY d.scheduled_at, d.created_at, d.id
                LIMIT 1
                FOR UPDATE OF d, l SKIP LOCKED
            ),
            claimed AS (
                UPDATE run_dispatches d
                SET status = 'running',
                    claimed_by = $1,
                    lease_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                    claimed_epoch = d.claimed_epoch + 1,
                    updated_at = NOW()
                FROM next_dispatch nd
                WHERE d.id = nd.id
                RETURNING d.*
            )
            UPDATE queue_lanes l
            SET state = 'running', active_dispatch_id = c.id, updated_at = NOW()
            FROM claimed c
            WHERE l.queue_key = c.queue_key
            RETURNING c.*
            "#,
        )
        .bind(worker_id)
        .bind(lease_seconds.to_string())
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Write a terminal status and release the lane.
    ///
    /// No-op (returns false) when the row epoch moved on, or when the row is
    /// already terminal.
    pub async fn finalize(
        id: Uuid,
        status: DispatchStatus,
        error: Option<&str>,
        expected_epoch: i64,
        pool: &PgPool,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());

        let mut tx = pool.begin().await?;
        let finalized = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE run_dispatches
            SET status = $2,
                error = $3,
                control_state = 'normal',
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
              AND claimed_epoch = $4
              AND status IN ('running', 'paused')
            RETURNING queue_key
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error)
        .bind(expected_epoch)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(queue_key) = finalized else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE queue_lanes
            SET state = 'queued', active_dispatch_id = NULL, updated_at = NOW()
            WHERE queue_key = $1 AND active_dispatch_id = $2
            "#,
        )
        .bind(&queue_key)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Extend the lease for a held dispatch (heartbeat). Epoch-guarded so a
    /// preempted worker cannot revive an abandoned row.
    pub async fn heartbeat(
        id: Uuid,
        lease_seconds: i64,
        expected_epoch: i64,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches
            SET lease_expires_at = NOW() + ($2 || ' seconds')::INTERVAL,
                updated_at = NOW()
            WHERE id = $1
              AND claimed_epoch = $3
              AND status IN ('running', 'paused')
            "#,
        )
        .bind(id)
        .bind(lease_seconds.to_string())
        .bind(expected_epoch)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn attach_job(id: Uuid, job_id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE run_dispatches SET job_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(job_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Request a control transition on a non-terminal dispatch.
    pub async fn set_control_state(
        id: Uuid,
        state: ControlState,
        reason: Option<&str>,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches
            SET control_state = $2, control_reason = $3, updated_at = NOW()
            WHERE id = $1 AND status IN ('queued', 'running', 'paused')
            "#,
        )
        .bind(id)
        .bind(state)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the arbiter's latest verdict for observability.
    pub async fn record_control_reason(id: Uuid, reason: &str, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE run_dispatches SET control_reason = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(reason)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_paused(id: Uuid, expected_epoch: i64, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches
            SET status = 'paused', control_state = 'normal', updated_at = NOW()
            WHERE id = $1 AND claimed_epoch = $2 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(expected_epoch)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_resumed(id: Uuid, expected_epoch: i64, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches
            SET status = 'running', control_state = 'normal', updated_at = NOW()
            WHERE id = $1 AND claimed_epoch = $2 AND status = 'paused'
            "#,
        )
        .bind(id)
        .bind(expected_epoch)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Abandon every held dispatch whose lease expired, bumping the row
    /// epoch so the stale holder's finalize becomes a no-op, and free the
    /// lanes. Returns the number reaped.
    pub async fn reap_expired(pool: &PgPool) -> Result<u64> {
        let mut tx = pool.begin().await?;
        let reaped = sqlx::query_as::<_, (Uuid, String)>(
            r#"
            WITH expired AS (
                SELECT id, queue_key FROM run_dispatches
                WHERE status IN ('running', 'paused') AND lease_expires_at < NOW()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE run_dispatches d
            SET status = 'abandoned',
                claimed_epoch = d.claimed_epoch + 1,
                claimed_by = NULL,
                lease_expires_at = NULL,
                error = COALESCE(d.error, 'lease expired'),
                updated_at = NOW()
            FROM expired e
            WHERE d.id = e.id
            RETURNING d.id, d.queue_key
            "#,
        )
        .fetch_all(&mut *tx)
        .await?;

        for (id, queue_key) in &reaped {
            sqlx::query(
                r#"
                UPDATE queue_lanes
                SET state = 'queued', active_dispatch_id = NULL, updated_at = NOW()
                WHERE queue_key = $1 AND active_dispatch_id = $2
                "#,
            )
            .bind(queue_key)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(reaped.len() as u64)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM run_dispatches WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_job(job_id: Uuid, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM run_dispatches WHERE job_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(job_id)
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// The agent's other in-flight dispatches, for the steering arbiter.
    pub async fn find_active_for_agent(
        agent_id: Uuid,
        except: Uuid,
        pool: &PgPool,
    ) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM run_dispatches
            WHERE agent_id = $1 AND id <> $2 AND status IN ('running', 'paused')
            ORDER BY created_at
            "#,
        )
        .bind(agent_id)
        .bind(except)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Existing unclaimed dispatch on a lane, if any (merge candidate
    /// during coalescing).
    pub async fn find_queued_for_lane<'e, E>(queue_key: &str, executor: E) -> Result<Option<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM run_dispatches
            WHERE queue_key = $1 AND status = 'queued'
            ORDER BY created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(queue_key)
        .fetch_optional(executor)
        .await
        .map_err(Into::into)
    }

    /// Supersede an unclaimed dispatch whose messages were folded into a
    /// newer one.
    pub async fn mark_merged<'e, E>(id: Uuid, executor: E) -> Result<bool>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE run_dispatches
            SET status = 'merged', updated_at = NOW()
            WHERE id = $1 AND status = 'queued'
            "#,
        )
        .bind(id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count_by_status(status: DispatchStatus, pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM run_dispatches WHERE status = $1")
            .bind(status)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(DispatchStatus::Completed.is_terminal());
        assert!(DispatchStatus::Failed.is_terminal());
        assert!(DispatchStatus::Cancelled.is_terminal());
        assert!(DispatchStatus::Abandoned.is_terminal());
        assert!(DispatchStatus::Merged.is_terminal());
    }

    #[test]
    fn non_terminal_statuses() {
        assert!(!DispatchStatus::Queued.is_terminal());
        assert!(!DispatchStatus::Running.is_terminal());
        assert!(!DispatchStatus::Paused.is_terminal());
    }
}
