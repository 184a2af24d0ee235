//! Lane: per-(session, agent) serialization primitive.
//!
//! Invariant: at most one dispatch per lane is `running`/`paused` at any
//! time; a `running` lane references its active dispatch.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "lane_state", rename_all = "snake_case")]
pub enum LaneState {
    Queued,
    Running,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "lane_mode", rename_all = "snake_case")]
pub enum LaneMode {
    /// New input may interrupt the in-flight run (arbiter decides).
    Steer,
    /// New input always waits for the next run.
    Coalesce,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Lane {
    pub queue_key: String,
    pub session_key: String,
    pub agent_id: Uuid,
    pub state: LaneState,
    pub mode: LaneMode,
    pub debounce_until: DateTime<Utc>,
    pub active_dispatch_id: Option<Uuid>,
    pub max_queued: i32,
    pub debounce_ms: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lane {
    pub fn queue_key_for(session_key: &str, agent_id: Uuid) -> String {
        format!("{session_key}:{agent_id}")
    }

    /// Upsert on enqueue: push the debounce horizon forward, never backward.
    pub async fn upsert_for_enqueue(
        session_key: &str,
        agent_id: Uuid,
        debounce_ms: i64,
        max_queued: i32,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO queue_lanes (queue_key, session_key, agent_id, debounce_until, max_queued, debounce_ms)
            VALUES ($1, $2, $3, NOW() + ($4 || ' milliseconds')::INTERVAL, $5, $4::BIGINT)
            ON CONFLICT (queue_key) DO UPDATE SET
                debounce_until = GREATEST(
                    queue_lanes.debounce_until,
                    NOW() + ($4 || ' milliseconds')::INTERVAL
                ),
                max_queued = EXCLUDED.max_queued,
                debounce_ms = EXCLUDED.debounce_ms,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(Self::queue_key_for(session_key, agent_id))
        .bind(session_key)
        .bind(agent_id)
        .bind(debounce_ms.to_string())
        .bind(max_queued)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find(queue_key: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM queue_lanes WHERE queue_key = $1")
            .bind(queue_key)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Lanes whose debounce elapsed and which have at least one pending
    /// message, ready to be promoted into a dispatch.
    pub async fn find_due(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT l.* FROM queue_lanes l
            WHERE l.state = 'queued'
              AND l.debounce_until <= NOW()
              AND EXISTS (
                  SELECT 1 FROM queue_messages m
                  WHERE m.queue_key = l.queue_key AND m.status = 'pending'
              )
            ORDER BY l.debounce_until
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_state(queue_key: &str, state: LaneState, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE queue_lanes SET state = $1, updated_at = NOW() WHERE queue_key = $2")
            .bind(state)
            .bind(queue_key)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Release the lane after its active dispatch reached a terminal state.
    pub async fn release(queue_key: &str, dispatch_id: Uuid, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE queue_lanes
            SET state = 'queued', active_dispatch_id = NULL, updated_at = NOW()
            WHERE queue_key = $1 AND active_dispatch_id = $2
            "#,
        )
        .bind(queue_key)
        .bind(dispatch_id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_key_composes_session_and_agent() {
        let agent = Uuid::nil();
        assert_eq!(
            Lane::queue_key_for("telegram:chat42", agent),
            format!("telegram:chat42:{agent}")
        );
    }
}
