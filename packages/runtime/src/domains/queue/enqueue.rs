//! Fan-out of a work item onto per-agent lanes.
//!
//! Debounce composes as agent override, then plugin-instance default, then
//! the runtime default; each additional target agent gets a fair-share
//! stagger so co-assigned agents do not all fire at the same instant.

use anyhow::Result;
use sqlx::PgPool;
use tracing::debug;

use super::models::{Lane, QueueMessage};
use crate::domains::plugins::models::{Agent, PluginInstance};

/// Stagger added per additional target agent in the same session.
pub const FAIR_SHARE_STAGGER_MS: i64 = 5_000;

const DEFAULT_MAX_QUEUED: i32 = 20;

/// Effective debounce for one target agent.
pub fn compose_debounce_ms(
    agent: &Agent,
    instance: Option<&PluginInstance>,
    default_ms: i64,
    agent_index: usize,
) -> i64 {
    let base = agent
        .debounce_ms
        .or_else(|| instance.and_then(|i| i.default_debounce_ms))
        .unwrap_or(default_ms);
    base + agent_index as i64 * FAIR_SHARE_STAGGER_MS
}

/// Enqueue one inbound message for every target agent.
///
/// Inserts a queue message per agent lane and pushes each lane's debounce
/// horizon forward. Origin exclusion is the caller's concern: `agents` must
/// already exclude the originating agent.
#[allow(clippy::too_many_arguments)]
pub async fn enqueue_for_agents(
    session_key: &str,
    work_item_id: uuid::Uuid,
    text: &str,
    sender_name: &str,
    agents: &[Agent],
    instance: Option<&PluginInstance>,
    default_debounce_ms: i64,
    pool: &PgPool,
) -> Result<Vec<QueueMessage>> {
    let mut enqueued = Vec::with_capacity(agents.len());
    for (index, agent) in agents.iter().enumerate() {
        let debounce_ms = compose_debounce_ms(agent, instance, default_debounce_ms, index);
        let lane = Lane::upsert_for_enqueue(
            session_key,
            agent.id,
            debounce_ms,
            DEFAULT_MAX_QUEUED,
            pool,
        )
        .await?;
        let message =
            QueueMessage::enqueue(&lane.queue_key, work_item_id, text, sender_name, pool).await?;
        debug!(
            queue_key = %lane.queue_key,
            message_id = %message.id,
            debounce_ms,
            "enqueued queue message"
        );
        enqueued.push(message);
    }
    Ok(enqueued)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn agent(debounce_ms: Option<i64>) -> Agent {
        Agent {
            id: Uuid::new_v4(),
            handle: "a".into(),
            display_name: "A".into(),
            role: None,
            status: "idle".into(),
            debounce_ms,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn instance(default_debounce_ms: Option<i64>) -> PluginInstance {
        PluginInstance {
            id: Uuid::new_v4(),
            plugin_type: "webhook".into(),
            name: "x".into(),
            settings_encrypted: None,
            public_channel: true,
            default_debounce_ms,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn agent_override_wins() {
        let a = agent(Some(2_000));
        let i = instance(Some(30_000));
        assert_eq!(compose_debounce_ms(&a, Some(&i), 15_000, 0), 2_000);
    }

    #[test]
    fn instance_default_beats_runtime_default() {
        let a = agent(None);
        let i = instance(Some(30_000));
        assert_eq!(compose_debounce_ms(&a, Some(&i), 15_000, 0), 30_000);
    }

    #[test]
    fn runtime_default_is_the_fallback() {
        let a = agent(None);
        assert_eq!(compose_debounce_ms(&a, None, 15_000, 0), 15_000);
    }

    #[test]
    fn stagger_adds_five_seconds_per_agent_index() {
        let a = agent(None);
        assert_eq!(compose_debounce_ms(&a, None, 15_000, 0), 15_000);
        assert_eq!(compose_debounce_ms(&a, None, 15_000, 1), 20_000);
        assert_eq!(compose_debounce_ms(&a, None, 15_000, 3), 30_000);
    }
}
