use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "routine_decision", rename_all = "snake_case")]
pub enum RoutineDecision {
    Enqueued,
    Skipped,
    Error,
}

/// Receipt for a single routine evaluation. `(routine_id, trigger_ref)` is
/// the dedupe key: reprocessing a trigger is a no-op.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoutineRun {
    pub id: Uuid,
    pub routine_id: Uuid,
    pub trigger_origin: String,
    pub trigger_ref: String,
    pub envelope_json: Option<serde_json::Value>,
    pub decision: RoutineDecision,
    pub decision_reason: Option<String>,
    pub scheduled_item_id: Option<Uuid>,
    pub evaluated_at: DateTime<Utc>,
}

/// Insert outcome across the dedupe constraint.
#[derive(Debug)]
pub enum RecordOutcome {
    Created(RoutineRun),
    Duplicate,
}

impl RecordOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, RecordOutcome::Created(_))
    }
}

impl RoutineRun {
    #[allow(clippy::too_many_arguments)]
    pub async fn record(
        routine_id: Uuid,
        trigger_origin: &str,
        trigger_ref: &str,
        envelope_json: Option<serde_json::Value>,
        decision: RoutineDecision,
        decision_reason: Option<&str>,
        scheduled_item_id: Option<Uuid>,
        pool: &PgPool,
    ) -> Result<RecordOutcome> {
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO routine_runs (
                id, routine_id, trigger_origin, trigger_ref, envelope_json,
                decision, decision_reason, scheduled_item_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (routine_id, trigger_ref) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(routine_id)
        .bind(trigger_origin)
        .bind(trigger_ref)
        .bind(envelope_json)
        .bind(decision)
        .bind(decision_reason)
        .bind(scheduled_item_id)
        .fetch_optional(pool)
        .await?;

        Ok(match inserted {
            Some(run) => RecordOutcome::Created(run),
            None => RecordOutcome::Duplicate,
        })
    }

    pub async fn set_scheduled_item(id: Uuid, scheduled_item_id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query("UPDATE routine_runs SET scheduled_item_id = $1 WHERE id = $2")
            .bind(scheduled_item_id)
            .bind(id)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn exists(routine_id: Uuid, trigger_ref: &str, pool: &PgPool) -> Result<bool> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM routine_runs WHERE routine_id = $1 AND trigger_ref = $2",
        )
        .bind(routine_id)
        .bind(trigger_ref)
        .fetch_one(pool)
        .await?;
        Ok(count > 0)
    }

    pub async fn find_recent(routine_id: Uuid, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM routine_runs
            WHERE routine_id = $1
            ORDER BY evaluated_at DESC
            LIMIT $2
            "#,
        )
        .bind(routine_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}
