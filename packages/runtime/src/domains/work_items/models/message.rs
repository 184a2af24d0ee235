use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::common::{db_id, ActorEnvelope};

/// Conversation transcript entry. The dispatch worker appends the coalesced
/// user turn before a run and the assistant turn after it; the transcript
/// feeds team-context summaries and lane objectives.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Message {
    pub id: Uuid,
    pub session_key: String,
    pub agent_id: Option<Uuid>,
    pub role: String,
    pub content: String,
    pub actor: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub async fn append(
        session_key: &str,
        agent_id: Option<Uuid>,
        role: &str,
        content: &str,
        actor: &ActorEnvelope,
        pool: &PgPool,
    ) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO messages (id, session_key, agent_id, role, content, actor)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(session_key)
        .bind(agent_id)
        .bind(role)
        .bind(content)
        .bind(serde_json::to_value(actor)?)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_recent(session_key: &str, limit: i64, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>(
            r#"
            SELECT * FROM messages
            WHERE session_key = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(session_key)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }
}

/// Compact recent-activity summary for the team context.
pub fn summarize_recent(messages: &[Message]) -> String {
    messages
        .iter()
        .rev()
        .map(|m| {
            let text: String = m.content.chars().take(120).collect();
            format!("{}: {}", m.role, text)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: &str, content: &str) -> Message {
        Message {
            id: db_id(),
            session_key: "s".into(),
            agent_id: None,
            role: role.into(),
            content: content.into(),
            actor: serde_json::json!({"kind": "human"}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn summary_reverses_into_chronological_order() {
        // find_recent returns newest-first
        let messages = vec![message("assistant", "later"), message("user", "earlier")];
        let summary = summarize_recent(&messages);
        assert_eq!(summary, "user: earlier\nassistant: later");
    }

    #[test]
    fn summary_truncates_long_content() {
        let long = "x".repeat(500);
        let messages = vec![message("user", &long)];
        let summary = summarize_recent(&messages);
        assert_eq!(summary.len(), "user: ".len() + 120);
    }
}
