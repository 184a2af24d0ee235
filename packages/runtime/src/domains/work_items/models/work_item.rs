use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{db_id, ActorEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "work_item_status", rename_all = "snake_case")]
pub enum WorkItemStatus {
    New,
    Done,
    Failed,
}

/// Structured body of a work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItemPayload {
    pub text: String,
    pub sender_name: String,
    pub actor: ActorEnvelope,
    /// Channel-specific reply routing (chat id, thread ts, ...), passed
    /// through untouched to the channel handler on delivery.
    #[serde(default)]
    pub response_context: serde_json::Value,
    /// Number of agent-relay hops behind this item. Bounded at enqueue time.
    #[serde(default)]
    pub relay_depth: i32,
    /// Explicit targets; empty means "all agents assigned to the instance".
    #[serde(default)]
    pub target_agent_ids: Vec<Uuid>,
}

/// The unit representing an inbound event to be processed.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkItem {
    pub id: Uuid,
    pub plugin_instance_id: Option<Uuid>,
    pub session_key: String,
    pub source: String,
    pub source_ref: String,
    pub title: String,
    pub payload: serde_json::Value,
    pub status: WorkItemStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of a create that may hit the `source_ref` dedupe constraint.
#[derive(Debug, Clone)]
pub enum CreateResult {
    Created(WorkItem),
    Duplicate(WorkItem),
}

impl CreateResult {
    pub fn work_item(self) -> WorkItem {
        match self {
            CreateResult::Created(item) | CreateResult::Duplicate(item) => item,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateResult::Created(_))
    }
}

impl WorkItem {
    /// Create a work item; a `source_ref` collision returns the existing row.
    pub async fn create(
        plugin_instance_id: Option<Uuid>,
        session_key: &str,
        source: &str,
        source_ref: &str,
        title: &str,
        payload: &WorkItemPayload,
        pool: &PgPool,
    ) -> Result<CreateResult> {
        let payload_json = serde_json::to_value(payload)?;
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO work_items (id, plugin_instance_id, session_key, source, source_ref, title, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source_ref) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(plugin_instance_id)
        .bind(session_key)
        .bind(source)
        .bind(source_ref)
        .bind(title)
        .bind(&payload_json)
        .fetch_optional(pool)
        .await?;

        match inserted {
            Some(item) => Ok(CreateResult::Created(item)),
            None => {
                let existing = Self::find_by_source_ref(source_ref, pool)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("work item vanished after conflict"))?;
                Ok(CreateResult::Duplicate(existing))
            }
        }
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM work_items WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_by_source_ref(source_ref: &str, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM work_items WHERE source_ref = $1")
            .bind(source_ref)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    /// Monotone transition toward a terminal state; terminal rows are left
    /// untouched.
    pub async fn transition(id: Uuid, status: WorkItemStatus, pool: &PgPool) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE work_items
            SET status = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'new'
            "#,
        )
        .bind(status)
        .bind(id)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub fn parsed_payload(&self) -> Result<WorkItemPayload> {
        serde_json::from_value(self.payload.clone()).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let payload = WorkItemPayload {
            text: "ship it".into(),
            sender_name: "dana".into(),
            actor: ActorEnvelope::system("test"),
            response_context: serde_json::json!({"chat_id": 7}),
            relay_depth: 2,
            target_agent_ids: vec![Uuid::new_v4()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        let back: WorkItemPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.text, "ship it");
        assert_eq!(back.relay_depth, 2);
        assert_eq!(back.target_agent_ids.len(), 1);
    }

    #[test]
    fn payload_defaults_relay_depth_to_zero() {
        let json = serde_json::json!({
            "text": "hello",
            "sender_name": "sam",
            "actor": { "kind": "human" }
        });
        let payload: WorkItemPayload = serde_json::from_value(json).unwrap();
        assert_eq!(payload.relay_depth, 0);
        assert!(payload.target_agent_ids.is_empty());
    }
}
