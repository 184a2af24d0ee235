//! Durable queue of deferred side-effects, primarily outbound deliveries.
//!
//! `effect_key` is unique per intent so re-inserting is a no-op, and every
//! transition out of `sending` is epoch-gated. Delivery is at-most-once
//! with a sent/failed/unknown tri-state; `unknown` is never auto-retried.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{db_id, ActorEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "effect_status", rename_all = "snake_case")]
pub enum EffectStatus {
    Pending,
    Sending,
    Sent,
    Failed,
    Unknown,
}

/// Payload carried by a delivery effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectPayload {
    pub content: String,
    #[serde(default)]
    pub response_context: serde_json::Value,
    #[serde(default)]
    pub hit_limit: bool,
    pub actor: ActorEnvelope,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EffectOutbox {
    pub id: Uuid,
    pub effect_key: String,
    pub dispatch_id: Option<Uuid>,
    pub plugin_instance_id: Option<Uuid>,
    pub work_item_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub channel: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: EffectStatus,
    pub attempt_count: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub claimed_epoch: i64,
    pub provider_ref: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Retry backoff in seconds for attempt `n` (1-based).
pub fn backoff_seconds(attempt: i64) -> i64 {
    (attempt * 10).clamp(5, 300)
}

impl EffectOutbox {
    /// Insert an effect; a duplicate `effect_key` is a no-op returning the
    /// existing row.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        effect_key: &str,
        dispatch_id: Option<Uuid>,
        plugin_instance_id: Option<Uuid>,
        work_item_id: Option<Uuid>,
        job_id: Option<Uuid>,
        channel: &str,
        kind: &str,
        payload: &EffectPayload,
        pool: &PgPool,
    ) -> Result<Self> {
        let payload_json = serde_json::to_value(payload)?;
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO effect_outbox (
                id, effect_key, dispatch_id, plugin_instance_id, work_item_id,
                job_id, channel, kind, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (effect_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(effect_key)
        .bind(dispatch_id)
        .bind(plugin_instance_id)
        .bind(work_item_id)
        .bind(job_id)
        .bind(channel)
        .bind(kind)
        .bind(&payload_json)
        .fetch_optional(pool)
        .await?;

        match inserted {
            Some(row) => Ok(row),
            None => sqlx::query_as::<_, Self>("SELECT * FROM effect_outbox WHERE effect_key = $1")
                .bind(effect_key)
                .fetch_one(pool)
                .await
                .map_err(Into::into),
        }
    }

    /// Atomically claim the next deliverable effect: oldest pending row whose
    /// retry time arrived, stamped `sending` with a fresh epoch.
    pub async fn claim_next(pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            WITH next_effect AS (
                SELECT id FROM effect_outbox
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= NOW())
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE effect_outbox e
            SET status = 'sending',
                attempt_count = e.attempt_count + 1,
                claimed_epoch = e.claimed_epoch + 1,
                last_error = NULL,
                updated_at = NOW()
            FROM next_effect n
            WHERE e.id = n.id
            RETURNING e.*
            "#,
        )
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Terminal success. Epoch-gated; a re-claimed row cannot be resolved
    /// twice.
    pub async fn mark_sent(
        id: Uuid,
        provider_ref: Option<&str>,
        expected_epoch: i64,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox
            SET status = 'sent', provider_ref = $2, next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND claimed_epoch = $3 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(provider_ref)
        .bind(expected_epoch)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Failure. Retryable failures go back to `pending` on the backoff
    /// schedule; non-retryable ones are terminal. `attempt` is the claimed
    /// row's attempt count (already incremented by the claim).
    pub async fn mark_failed(
        id: Uuid,
        error: &str,
        retryable: bool,
        attempt: i32,
        expected_epoch: i64,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = if retryable {
            sqlx::query(
                r#"
                UPDATE effect_outbox
                SET status = 'pending',
                    last_error = $2,
                    next_attempt_at = NOW() + ($4 || ' seconds')::INTERVAL,
                    updated_at = NOW()
                WHERE id = $1 AND claimed_epoch = $3 AND status = 'sending'
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(expected_epoch)
            .bind(backoff_seconds(i64::from(attempt)).to_string())
            .execute(pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE effect_outbox
                SET status = 'failed', last_error = $2, next_attempt_at = NULL, updated_at = NOW()
                WHERE id = $1 AND claimed_epoch = $3 AND status = 'sending'
                "#,
            )
            .bind(id)
            .bind(error)
            .bind(expected_epoch)
            .execute(pool)
            .await?
        };
        Ok(result.rows_affected() > 0)
    }

    /// Ambiguous delivery: the side effect may or may not have happened.
    /// Terminal for the runtime; surfaced for operator reconciliation.
    pub async fn mark_unknown(
        id: Uuid,
        error: &str,
        expected_epoch: i64,
        pool: &PgPool,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox
            SET status = 'unknown', last_error = $2, next_attempt_at = NULL, updated_at = NOW()
            WHERE id = $1 AND claimed_epoch = $3 AND status = 'sending'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(expected_epoch)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM effect_outbox WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    /// Unknown-outcome effects awaiting operator reconciliation.
    pub async fn find_unknown(limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM effect_outbox
            WHERE status = 'unknown'
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    /// Mark in-flight sends ambiguous during forced termination.
    pub async fn mark_sending_unknown(reason: &str, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox
            SET status = 'unknown',
                last_error = $1,
                claimed_epoch = claimed_epoch + 1,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE status = 'sending'
            "#,
        )
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Mark sends whose worker went silent ambiguous (periodic recovery).
    pub async fn mark_stale_sending_unknown(cutoff_seconds: i64, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE effect_outbox
            SET status = 'unknown',
                last_error = 'delivery worker lost mid-send',
                claimed_epoch = claimed_epoch + 1,
                next_attempt_at = NULL,
                updated_at = NOW()
            WHERE status = 'sending'
              AND updated_at < NOW() - ($1 || ' seconds')::INTERVAL
            "#,
        )
        .bind(cutoff_seconds.to_string())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_by_status(status: EffectStatus, pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM effect_outbox WHERE status = $1")
            .bind(status)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub fn parsed_payload(&self) -> Result<EffectPayload> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }
}

/// Effect key for a dispatch's final assistant response.
pub fn final_response_effect_key(dispatch_id: Uuid) -> String {
    format!("dispatch:{dispatch_id}:assistant_final_response")
}

/// Effect key for a dispatch's failure notice.
pub fn failure_notice_effect_key(dispatch_id: Uuid) -> String {
    format!("dispatch:{dispatch_id}:failure_notice")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_clamps_low() {
        // First attempts still wait at least 5 seconds.
        assert_eq!(backoff_seconds(0), 5);
        assert_eq!(backoff_seconds(1), 10);
    }

    #[test]
    fn backoff_grows_linearly() {
        assert_eq!(backoff_seconds(2), 20);
        assert_eq!(backoff_seconds(10), 100);
    }

    #[test]
    fn backoff_clamps_high() {
        assert_eq!(backoff_seconds(30), 300);
        assert_eq!(backoff_seconds(1000), 300);
    }

    #[test]
    fn effect_keys_are_per_dispatch() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(final_response_effect_key(a), final_response_effect_key(b));
        assert_ne!(final_response_effect_key(a), failure_notice_effect_key(a));
    }
}
