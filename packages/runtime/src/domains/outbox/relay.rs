//! Agent relay: after a successful delivery on a public channel, an agent's
//! output is re-ingested as a work item for the other agents on the same
//! instance.
//!
//! Guardrails: the relay's `source_ref` is unique per effect (re-attempts
//! no-op), depth is bounded, and the originating agent is excluded from the
//! fan-out by the intake path.

use anyhow::Result;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{EffectOutbox, EffectPayload};
use crate::domains::work_items::intake::{ingest_work_item, IngestOutcome, IntakeRequest};
use crate::domains::work_items::models::{WorkItem, WorkItemPayload};
use crate::kernel::RuntimeKernel;

/// Maximum relay hops between agents on one channel.
pub const MAX_RELAY_DEPTH: i32 = 12;

pub fn relay_source_ref(effect_id: Uuid) -> String {
    format!("agent_relay:{effect_id}")
}

/// Depth check for the next hop: `parent_depth` hops happened already.
pub fn relay_depth_allowed(parent_depth: i32) -> bool {
    parent_depth < MAX_RELAY_DEPTH
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    Enqueued { work_item_id: Uuid, targets: usize },
    Duplicate,
    SkippedNonAgent,
    SkippedPrivateChannel,
    SkippedDepthLimit,
    SkippedNoInstance,
}

/// Enqueue a relay work item for a delivered agent response.
pub async fn enqueue_agent_relay(
    kernel: &RuntimeKernel,
    effect: &EffectOutbox,
    payload: &EffectPayload,
) -> Result<RelayOutcome> {
    let Some(agent_handle) = payload.actor.handle().map(str::to_string) else {
        return Ok(RelayOutcome::SkippedNonAgent);
    };

    let Some(instance_id) = effect.plugin_instance_id else {
        return Ok(RelayOutcome::SkippedNoInstance);
    };
    let instance =
        crate::domains::plugins::models::PluginInstance::find_by_id(instance_id, &kernel.db_pool)
            .await?;
    if !instance.public_channel {
        return Ok(RelayOutcome::SkippedPrivateChannel);
    }

    let Some(work_item_id) = effect.work_item_id else {
        return Ok(RelayOutcome::SkippedNoInstance);
    };
    let work_item = WorkItem::find_by_id(work_item_id, &kernel.db_pool).await?;
    let parent_depth = work_item
        .parsed_payload()
        .map(|p| p.relay_depth)
        .unwrap_or(0);
    if !relay_depth_allowed(parent_depth) {
        info!(
            effect_id = %effect.id,
            depth = parent_depth,
            "relay depth limit reached, not relaying"
        );
        return Ok(RelayOutcome::SkippedDepthLimit);
    }

    let request = IntakeRequest::builder()
        .plugin_instance_id(instance_id)
        .session_key(work_item.session_key)
        .source("agent_relay")
        .source_ref(relay_source_ref(effect.id))
        .title(format!("Relay from @{agent_handle}"))
        .payload(WorkItemPayload {
            text: payload.content.clone(),
            sender_name: payload
                .actor
                .display_name()
                .unwrap_or(&agent_handle)
                .to_string(),
            actor: payload.actor.clone(),
            response_context: payload.response_context.clone(),
            relay_depth: parent_depth + 1,
            target_agent_ids: Vec::new(),
        })
        .build();

    match ingest_work_item(kernel, request).await? {
        IngestOutcome::Ingested {
            work_item,
            enqueued,
        } => {
            debug!(
                effect_id = %effect.id,
                work_item_id = %work_item.id,
                targets = enqueued,
                depth = parent_depth + 1,
                "agent relay enqueued"
            );
            Ok(RelayOutcome::Enqueued {
                work_item_id: work_item.id,
                targets: enqueued,
            })
        }
        IngestOutcome::Duplicate(_) => Ok(RelayOutcome::Duplicate),
        IngestOutcome::Blocked { .. } => Ok(RelayOutcome::Duplicate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_allows_up_to_the_bound() {
        assert!(relay_depth_allowed(0));
        assert!(relay_depth_allowed(11));
        assert!(!relay_depth_allowed(12));
        assert!(!relay_depth_allowed(40));
    }

    #[test]
    fn source_ref_is_unique_per_effect() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(relay_source_ref(a), relay_source_ref(b));
        assert!(relay_source_ref(a).starts_with("agent_relay:"));
    }
}
