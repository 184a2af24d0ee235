use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

/// Structured plugin-side occurrences surfaced to operators, e.g. a
/// capability request that was denied.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PluginEvent {
    pub id: Uuid,
    pub plugin_instance_id: Option<Uuid>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl PluginEvent {
    pub async fn record(
        plugin_instance_id: Option<Uuid>,
        kind: &str,
        payload: serde_json::Value,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO plugin_events (id, plugin_instance_id, kind, payload)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(plugin_instance_id)
        .bind(kind)
        .bind(payload)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn permission_denied(
        plugin_instance_id: Option<Uuid>,
        capability: &str,
        pool: &PgPool,
    ) -> Result<Self> {
        Self::record(
            plugin_instance_id,
            "permission_denied",
            serde_json::json!({ "capability": capability }),
            pool,
        )
        .await
    }
}
