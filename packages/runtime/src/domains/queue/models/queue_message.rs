use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_message_status", rename_all = "snake_case")]
pub enum QueueMessageStatus {
    Pending,
    Included,
    Dropped,
    Cancelled,
}

/// One inbound message waiting on a lane to be coalesced into a dispatch
/// (or forwarded into an in-flight run as a steer candidate).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueueMessage {
    pub id: Uuid,
    pub queue_key: String,
    pub work_item_id: Uuid,
    pub text: String,
    pub sender_name: String,
    pub arrived_at: DateTime<Utc>,
    pub status: QueueMessageStatus,
    pub dispatch_id: Option<Uuid>,
    pub drop_reason: Option<String>,
}

impl QueueMessage {
    pub async fn enqueue(
        queue_key: &str,
        work_item_id: Uuid,
        text: &str,
        sender_name: &str,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO queue_messages (id, queue_key, work_item_id, text, sender_name)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(queue_key)
        .bind(work_item_id)
        .bind(text)
        .bind(sender_name)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Pending messages on a lane in arrival order.
    pub async fn find_pending<'e, E>(queue_key: &str, executor: E) -> Result<Vec<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM queue_messages
            WHERE queue_key = $1 AND status = 'pending'
            ORDER BY arrived_at, id
            "#,
        )
        .bind(queue_key)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    /// Pending messages locked for the caller's transaction.
    pub async fn lock_pending<'e, E>(queue_key: &str, executor: E) -> Result<Vec<Self>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM queue_messages
            WHERE queue_key = $1 AND status = 'pending'
            ORDER BY arrived_at, id
            FOR UPDATE
            "#,
        )
        .bind(queue_key)
        .fetch_all(executor)
        .await
        .map_err(Into::into)
    }

    pub async fn mark_included<'e, E>(ids: &[Uuid], dispatch_id: Uuid, executor: E) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'included', dispatch_id = $1
            WHERE id = ANY($2) AND status = 'pending'
            "#,
        )
        .bind(dispatch_id)
        .bind(ids)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn mark_dropped<'e, E>(ids: &[Uuid], reason: &str, executor: E) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'dropped', drop_reason = $1
            WHERE id = ANY($2) AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(ids)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Re-point messages that were included in a now-merged dispatch.
    pub async fn reassign_dispatch<'e, E>(
        from_dispatch_id: Uuid,
        to_dispatch_id: Uuid,
        executor: E,
    ) -> Result<u64>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET dispatch_id = $1
            WHERE dispatch_id = $2 AND status = 'included'
            "#,
        )
        .bind(to_dispatch_id)
        .bind(from_dispatch_id)
        .execute(executor)
        .await?;
        Ok(result.rows_affected())
    }

    /// Cancel pending input on a lane (operator cancel with discard).
    pub async fn cancel_pending(queue_key: &str, reason: &str, pool: &PgPool) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET status = 'cancelled', drop_reason = $1
            WHERE queue_key = $2 AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(queue_key)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Join pending messages in arrival order into the run's coalesced input,
/// one `sender: text` line per message.
pub fn build_coalesced_text(messages: &[QueueMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.sender_name, m.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: &str, arrived_at: DateTime<Utc>) -> QueueMessage {
        QueueMessage {
            id: db_id(),
            queue_key: "s:a".into(),
            work_item_id: Uuid::nil(),
            text: text.into(),
            sender_name: "user".into(),
            arrived_at,
            status: QueueMessageStatus::Pending,
            dispatch_id: None,
            drop_reason: None,
        }
    }

    #[test]
    fn coalesced_text_joins_sender_lines_in_order() {
        let now = Utc::now();
        let messages = vec![message("first", now), message("second", now)];
        assert_eq!(build_coalesced_text(&messages), "user: first\n\nuser: second");
    }

    #[test]
    fn coalesced_text_of_single_message_is_one_sender_line() {
        let messages = vec![message("hi", Utc::now())];
        assert_eq!(build_coalesced_text(&messages), "user: hi");
    }
}
