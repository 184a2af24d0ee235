//! Work-item intake: the single entry point for all inbound signals
//! (webhooks, in-app chat, routine firings, probe hits, agent relays).
//!
//! Creates the work item, publishes its event envelope, and fans the
//! message out onto one lane per target agent. The originating agent is
//! never a target of its own output.

use anyhow::Result;
use serde_json::json;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::models::{CreateResult, WorkItem, WorkItemPayload};
use crate::domains::plugins::models::{Agent, PluginEvent, PluginInstance};
use crate::domains::queue::enqueue_for_agents;
use crate::domains::routines::models::RoutineEvent;
use crate::kernel::{HookDispatch, HookPoint, RuntimeKernel};

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct IntakeRequest {
    #[builder(default, setter(strip_option))]
    pub plugin_instance_id: Option<Uuid>,
    pub session_key: String,
    pub source: String,
    pub source_ref: String,
    pub title: String,
    pub payload: WorkItemPayload,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Ingested { work_item: WorkItem, enqueued: usize },
    Duplicate(WorkItem),
    Blocked { hook: String, reason: String },
}

pub async fn ingest_work_item(
    kernel: &RuntimeKernel,
    request: IntakeRequest,
) -> Result<IngestOutcome> {
    let pool = &kernel.db_pool;

    let payload_value = serde_json::to_value(&request.payload)?;
    let payload: WorkItemPayload = match kernel
        .hooks
        .dispatch(HookPoint::WorkItemPreCreate, payload_value)
        .await
    {
        HookDispatch::Blocked { hook, reason } => {
            info!(hook, reason, source_ref = %request.source_ref, "work item vetoed by hook");
            PluginEvent::record(
                request.plugin_instance_id,
                "work_item_blocked",
                json!({ "hook": hook, "reason": reason, "source_ref": request.source_ref }),
                pool,
            )
            .await?;
            return Ok(IngestOutcome::Blocked { hook, reason });
        }
        HookDispatch::Proceed(value) => serde_json::from_value(value)?,
    };

    let work_item = match WorkItem::create(
        request.plugin_instance_id,
        &request.session_key,
        &request.source,
        &request.source_ref,
        &request.title,
        &payload,
        pool,
    )
    .await?
    {
        CreateResult::Created(item) => item,
        CreateResult::Duplicate(item) => {
            info!(source_ref = %request.source_ref, "work item already exists, skipping");
            return Ok(IngestOutcome::Duplicate(item));
        }
    };

    RoutineEvent::publish(
        &work_item.source_ref,
        &request.source,
        "work_item.created",
        &work_item.source_ref,
        &work_item.session_key,
        work_item.plugin_instance_id,
        payload.actor.kind(),
        payload.actor.handle(),
        &work_item.title,
        pool,
    )
    .await?;

    let instance = match work_item.plugin_instance_id {
        Some(id) => Some(PluginInstance::find_by_id(id, pool).await?),
        None => None,
    };
    let agents = resolve_target_agents(&payload, instance.as_ref(), pool).await?;

    if agents.is_empty() {
        warn!(work_item_id = %work_item.id, "no target agents for work item");
        return Ok(IngestOutcome::Ingested {
            work_item,
            enqueued: 0,
        });
    }

    let enqueued = enqueue_for_agents(
        &work_item.session_key,
        work_item.id,
        &payload.text,
        &payload.sender_name,
        &agents,
        instance.as_ref(),
        kernel.config.default_debounce_ms,
        pool,
    )
    .await?;

    kernel
        .hooks
        .dispatch(
            HookPoint::WorkItemPostCreate,
            json!({
                "work_item_id": work_item.id,
                "session_key": work_item.session_key,
                "enqueued": enqueued.len(),
            }),
        )
        .await;

    info!(
        work_item_id = %work_item.id,
        targets = enqueued.len(),
        source = %work_item.source,
        "work item ingested"
    );

    Ok(IngestOutcome::Ingested {
        work_item,
        enqueued: enqueued.len(),
    })
}

/// Explicit targets when the payload names them, otherwise every agent
/// assigned to the instance; the originating agent is always excluded.
async fn resolve_target_agents(
    payload: &WorkItemPayload,
    instance: Option<&PluginInstance>,
    pool: &sqlx::PgPool,
) -> Result<Vec<Agent>> {
    let mut agents = if !payload.target_agent_ids.is_empty() {
        let mut loaded = Vec::with_capacity(payload.target_agent_ids.len());
        for id in &payload.target_agent_ids {
            match Agent::find_by_id(*id, pool).await {
                Ok(agent) if agent.enabled => loaded.push(agent),
                Ok(_) => {}
                Err(e) => warn!(agent_id = %id, error = %e, "target agent not found"),
            }
        }
        loaded
    } else if let Some(instance) = instance {
        instance.assigned_agents(pool).await?
    } else {
        Vec::new()
    };

    if let Some(origin) = payload.actor.agent_id() {
        agents.retain(|a| a.id != origin);
    }

    Ok(agents)
}
