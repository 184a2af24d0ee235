use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::db_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "routine_event_status", rename_all = "snake_case")]
pub enum RoutineEventStatus {
    Queued,
    Processed,
}

/// Inbound event envelope fanned out to event-triggered routines.
///
/// The field set is closed: rule predicates in envelope mode may only
/// reference the fields exposed by [`envelope_value`](Self::envelope_value).
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoutineEvent {
    pub id: Uuid,
    pub event_key: String,
    pub source: String,
    pub event_type: String,
    pub source_ref: String,
    pub session_key: String,
    pub plugin_instance_id: Option<Uuid>,
    pub actor_kind: String,
    pub actor_handle: Option<String>,
    pub status: RoutineEventStatus,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Publish outcome across the `event_key` dedupe constraint.
#[derive(Debug)]
pub enum PublishOutcome {
    Published(RoutineEvent),
    Duplicate(RoutineEvent),
}

impl PublishOutcome {
    pub fn event(self) -> RoutineEvent {
        match self {
            PublishOutcome::Published(e) | PublishOutcome::Duplicate(e) => e,
        }
    }
}

impl RoutineEvent {
    /// Publish an event envelope; an already-seen `event_key` returns the
    /// existing row.
    #[allow(clippy::too_many_arguments)]
    pub async fn publish(
        event_key: &str,
        source: &str,
        event_type: &str,
        source_ref: &str,
        session_key: &str,
        plugin_instance_id: Option<Uuid>,
        actor_kind: &str,
        actor_handle: Option<&str>,
        title: &str,
        pool: &PgPool,
    ) -> Result<PublishOutcome> {
        let inserted = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO routine_events (
                id, event_key, source, event_type, source_ref, session_key,
                plugin_instance_id, actor_kind, actor_handle, title
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (event_key) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(event_key)
        .bind(source)
        .bind(event_type)
        .bind(source_ref)
        .bind(session_key)
        .bind(plugin_instance_id)
        .bind(actor_kind)
        .bind(actor_handle)
        .bind(title)
        .fetch_optional(pool)
        .await?;

        match inserted {
            Some(event) => Ok(PublishOutcome::Published(event)),
            None => {
                let existing = sqlx::query_as::<_, Self>(
                    "SELECT * FROM routine_events WHERE event_key = $1",
                )
                .bind(event_key)
                .fetch_one(pool)
                .await?;
                Ok(PublishOutcome::Duplicate(existing))
            }
        }
    }

    /// Oldest queued envelope, if any.
    pub async fn next_queued(pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM routine_events
            WHERE status = 'queued'
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .fetch_optional(pool)
        .await
        .map_err(Into::into)
    }

    /// Marked only after fan-out completes; a crash in between reprocesses
    /// the event and the routine-run dedupe absorbs it.
    pub async fn mark_processed(id: Uuid, pool: &PgPool) -> Result<()> {
        sqlx::query(
            "UPDATE routine_events SET status = 'processed', processed_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// The closed envelope record that event rules match against.
    pub fn envelope_value(&self) -> serde_json::Value {
        serde_json::json!({
            "eventId": self.id,
            "source": self.source,
            "eventType": self.event_type,
            "sourceRef": self.source_ref,
            "sessionKey": self.session_key,
            "pluginInstanceId": self.plugin_instance_id,
            "actorKind": self.actor_kind,
            "actorHandle": self.actor_handle,
            "status": "queued",
            "title": self.title,
            "createdAt": self.created_at.timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_exposes_the_closed_field_set() {
        let event = RoutineEvent {
            id: Uuid::nil(),
            event_key: "k".into(),
            source: "telegram".into(),
            event_type: "message".into(),
            source_ref: "tg:1".into(),
            session_key: "s".into(),
            plugin_instance_id: None,
            actor_kind: "human".into(),
            actor_handle: None,
            status: RoutineEventStatus::Queued,
            title: "t".into(),
            created_at: Utc::now(),
            processed_at: None,
        };
        let value = event.envelope_value();
        let keys: Vec<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "actorHandle",
                "actorKind",
                "createdAt",
                "eventId",
                "eventType",
                "pluginInstanceId",
                "sessionKey",
                "source",
                "sourceRef",
                "status",
                "title",
            ]
        );
    }
}
