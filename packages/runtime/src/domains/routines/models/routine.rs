use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "routine_trigger_kind", rename_all = "snake_case")]
pub enum RoutineTriggerKind {
    Cron,
    Condition,
    Oneshot,
    Event,
}

/// A user-defined trigger that converts time or events into work.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Routine {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub name: String,
    pub trigger_kind: RoutineTriggerKind,
    pub cron_expr: Option<String>,
    pub timezone: String,
    pub condition_probe: Option<String>,
    pub condition_config: Option<serde_json::Value>,
    pub rule_json: Option<serde_json::Value>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub last_status: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Routine {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        agent_id: Uuid,
        name: &str,
        trigger_kind: RoutineTriggerKind,
        cron_expr: Option<&str>,
        timezone: &str,
        condition_probe: Option<&str>,
        condition_config: Option<serde_json::Value>,
        rule_json: Option<serde_json::Value>,
        next_run_at: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO routines (
                id, agent_id, name, trigger_kind, cron_expr, timezone,
                condition_probe, condition_config, rule_json, next_run_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(agent_id)
        .bind(name)
        .bind(trigger_kind)
        .bind(cron_expr)
        .bind(timezone)
        .bind(condition_probe)
        .bind(condition_config)
        .bind(rule_json)
        .bind(next_run_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM routines WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    /// Due time/condition/oneshot routines, bounded per scheduler tick.
    pub async fn find_due(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM routines
            WHERE enabled = TRUE
              AND trigger_kind <> 'event'
              AND next_run_at IS NOT NULL
              AND next_run_at <= NOW()
            ORDER BY next_run_at
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_event_routines(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            "SELECT * FROM routines WHERE enabled = TRUE AND trigger_kind = 'event' ORDER BY created_at",
        )
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn record_evaluation(
        id: Uuid,
        next_run_at: Option<DateTime<Utc>>,
        last_status: &str,
        pool: &PgPool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE routines
            SET next_run_at = $1, last_evaluated_at = NOW(), last_status = $2, updated_at = NOW()
            WHERE id = $3
            "#,
        )
        .bind(next_run_at)
        .bind(last_status)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn disable(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE routines SET enabled = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }
}
