//! Operator HTTP handlers: health, status, runtime control, outbox
//! reconciliation, webhook ingest, and per-run actions.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::{db_id, ActorEnvelope};
use crate::domains::control::models::{PauseMode, RuntimeControl};
use crate::domains::control::{
    cancel_run_by_job, emergency_stop, pause_run_by_job, resume_run_by_job,
};
use crate::domains::dispatch::models::{DispatchStatus, RunDispatch};
use crate::domains::outbox::models::{EffectOutbox, EffectStatus};
use crate::domains::plugins::models::{Agent, PluginInstance};
use crate::domains::routines::{
    create_routine, CreateRoutineParams, RoutineTriggerKind, RoutineValidationError,
};
use crate::domains::work_items::intake::{ingest_work_item, IngestOutcome, IntakeRequest};
use crate::domains::work_items::models::WorkItemPayload;
use crate::kernel::RuntimeKernel;

type AppState = Arc<RuntimeKernel>;
type ApiError = (StatusCode, Json<Value>);

fn internal(e: impl std::fmt::Display) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn get_status(State(kernel): State<AppState>) -> Result<Json<Value>, ApiError> {
    let pool = &kernel.db_pool;
    let control = RuntimeControl::get(pool).await.map_err(internal)?;
    let queued = RunDispatch::count_by_status(DispatchStatus::Queued, pool)
        .await
        .map_err(internal)?;
    let running = RunDispatch::count_by_status(DispatchStatus::Running, pool)
        .await
        .map_err(internal)?;
    let pending_effects = EffectOutbox::count_by_status(EffectStatus::Pending, pool)
        .await
        .map_err(internal)?;
    let unknown_effects = EffectOutbox::count_by_status(EffectStatus::Unknown, pool)
        .await
        .map_err(internal)?;

    Ok(Json(json!({
        "processing_enabled": control.processing_enabled,
        "pause_mode": match control.pause_mode { PauseMode::Soft => "soft", PauseMode::Hard => "hard" },
        "control_epoch": control.control_epoch,
        "max_concurrent_dispatches": control.max_concurrent_dispatches,
        "dispatches": { "queued": queued, "running": running },
        "effects": { "pending": pending_effects, "unknown": unknown_effects },
    })))
}

#[derive(Deserialize, Default)]
pub struct PauseBody {
    #[serde(default)]
    mode: Option<String>,
}

pub async fn post_pause(
    State(kernel): State<AppState>,
    body: Option<Json<PauseBody>>,
) -> Result<Json<Value>, ApiError> {
    let mode = body
        .and_then(|Json(b)| b.mode)
        .unwrap_or_else(|| "soft".to_string());
    match mode.as_str() {
        "soft" => {
            RuntimeControl::set_processing(false, PauseMode::Soft, &kernel.db_pool)
                .await
                .map_err(internal)?;
            Ok(Json(json!({ "paused": true, "mode": "soft" })))
        }
        "hard" => {
            let report = emergency_stop(&kernel.db_pool).await.map_err(internal)?;
            Ok(Json(json!({
                "paused": true,
                "mode": "hard",
                "dispatches_terminated": report.dispatches_terminated,
            })))
        }
        other => Err(bad_request(format!("unknown pause mode '{other}'"))),
    }
}

pub async fn post_resume(State(kernel): State<AppState>) -> Result<Json<Value>, ApiError> {
    RuntimeControl::set_processing(true, PauseMode::Soft, &kernel.db_pool)
        .await
        .map_err(internal)?;
    Ok(Json(json!({ "resumed": true })))
}

pub async fn post_emergency_stop(
    State(kernel): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let report = emergency_stop(&kernel.db_pool).await.map_err(internal)?;
    Ok(Json(json!({
        "stopped": true,
        "dispatches_terminated": report.dispatches_terminated,
        "effects_marked_unknown": report.effects_marked_unknown,
        "jobs_cancelled": report.jobs_reaped,
        "lanes_reset": report.lanes_reset,
    })))
}

pub async fn get_unknown_effects(
    State(kernel): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let effects = EffectOutbox::find_unknown(100, &kernel.db_pool)
        .await
        .map_err(internal)?;
    let items: Vec<Value> = effects
        .iter()
        .map(|e| {
            json!({
                "id": e.id,
                "effect_key": e.effect_key,
                "channel": e.channel,
                "kind": e.kind,
                "last_error": e.last_error,
                "attempt_count": e.attempt_count,
                "updated_at": e.updated_at,
            })
        })
        .collect();
    Ok(Json(json!({ "unknown": items })))
}

#[derive(Deserialize)]
pub struct CreateAgentBody {
    pub handle: String,
    pub display_name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub debounce_ms: Option<i64>,
}

pub async fn post_agent(
    State(kernel): State<AppState>,
    Json(body): Json<CreateAgentBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let agent = Agent::create(
        &body.handle,
        &body.display_name,
        body.role.as_deref(),
        body.debounce_ms,
        &kernel.db_pool,
    )
    .await
    .map_err(|e| bad_request(e.to_string()))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "id": agent.id, "handle": agent.handle })),
    ))
}

#[derive(Deserialize)]
pub struct CreateInstanceBody {
    pub plugin_type: String,
    pub name: String,
    #[serde(default)]
    pub settings: Option<String>,
    #[serde(default)]
    pub public_channel: bool,
    #[serde(default)]
    pub default_debounce_ms: Option<i64>,
}

pub async fn post_instance(
    State(kernel): State<AppState>,
    Json(body): Json<CreateInstanceBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let instance = PluginInstance::create(
        &body.plugin_type,
        &body.name,
        body.settings.as_deref(),
        body.public_channel,
        body.default_debounce_ms,
        &kernel.cipher,
        &kernel.db_pool,
    )
    .await
    .map_err(internal)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": instance.id,
            "ingest_url": instance.ingest_url(&kernel.config.app_base_url),
        })),
    ))
}

#[derive(Deserialize)]
pub struct AssignAgentBody {
    pub agent_id: Uuid,
    #[serde(default)]
    pub position: i32,
}

pub async fn post_instance_agent(
    State(kernel): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(body): Json<AssignAgentBody>,
) -> Result<Json<Value>, ApiError> {
    let instance = PluginInstance::find_by_id(instance_id, &kernel.db_pool)
        .await
        .map_err(|_| bad_request("unknown plugin instance"))?;
    instance
        .assign_agent(body.agent_id, body.position, &kernel.db_pool)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({ "assigned": true })))
}

pub async fn get_instances(State(kernel): State<AppState>) -> Result<Json<Value>, ApiError> {
    let instances = PluginInstance::list(&kernel.db_pool).await.map_err(internal)?;
    let items: Vec<Value> = instances
        .iter()
        .map(|i| {
            json!({
                "id": i.id,
                "plugin_type": i.plugin_type,
                "name": i.name,
                "public_channel": i.public_channel,
                "ingest_url": i.ingest_url(&kernel.config.app_base_url),
            })
        })
        .collect();
    Ok(Json(json!({ "instances": items })))
}

#[derive(Deserialize)]
pub struct IngestBody {
    pub text: String,
    #[serde(default)]
    pub session_key: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_external_id: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub response_context: Option<Value>,
}

pub async fn post_ingest(
    State(kernel): State<AppState>,
    Path(instance_id): Path<Uuid>,
    Json(body): Json<IngestBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if body.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let instance = PluginInstance::find_by_id(instance_id, &kernel.db_pool)
        .await
        .map_err(|_| bad_request("unknown plugin instance"))?;

    let sender_name = body.sender_name.unwrap_or_else(|| "webhook".to_string());
    let request = IntakeRequest::builder()
        .plugin_instance_id(instance.id)
        .session_key(
            body.session_key
                .unwrap_or_else(|| format!("{}:{}", instance.plugin_type, instance.id)),
        )
        .source(instance.plugin_type.clone())
        .source_ref(
            body.source_ref
                .unwrap_or_else(|| format!("ingest:{}", db_id())),
        )
        .title(
            body.title
                .unwrap_or_else(|| body.text.chars().take(80).collect::<String>()),
        )
        .payload(WorkItemPayload {
            text: body.text,
            sender_name: sender_name.clone(),
            actor: ActorEnvelope::Human {
                display_name: Some(sender_name),
                external_id: body.sender_external_id,
                source: Some(instance.plugin_type.clone()),
            },
            response_context: body.response_context.unwrap_or(Value::Null),
            relay_depth: 0,
            target_agent_ids: Vec::new(),
        })
        .build();

    match ingest_work_item(&kernel, request).await.map_err(internal)? {
        IngestOutcome::Ingested {
            work_item,
            enqueued,
        } => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "work_item_id": work_item.id, "enqueued": enqueued })),
        )),
        IngestOutcome::Duplicate(work_item) => Ok((
            StatusCode::OK,
            Json(json!({ "work_item_id": work_item.id, "duplicate": true })),
        )),
        IngestOutcome::Blocked { hook, reason } => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "blocked_by": hook, "reason": reason })),
        )),
    }
}

#[derive(Deserialize)]
pub struct CreateRoutineBody {
    pub agent_id: Uuid,
    pub name: String,
    pub trigger_kind: String,
    #[serde(default)]
    pub cron_expr: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub condition_probe: Option<String>,
    #[serde(default)]
    pub condition_config: Option<Value>,
    #[serde(default)]
    pub rule: Option<Value>,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

pub async fn post_routine(
    State(kernel): State<AppState>,
    Json(body): Json<CreateRoutineBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let trigger_kind = match body.trigger_kind.as_str() {
        "cron" => RoutineTriggerKind::Cron,
        "condition" => RoutineTriggerKind::Condition,
        "oneshot" => RoutineTriggerKind::Oneshot,
        "event" => RoutineTriggerKind::Event,
        other => return Err(bad_request(format!("unknown trigger kind '{other}'"))),
    };

    let params = CreateRoutineParams {
        agent_id: body.agent_id,
        name: body.name,
        trigger_kind,
        cron_expr: body.cron_expr,
        timezone: body.timezone,
        condition_probe: body.condition_probe,
        condition_config: body.condition_config,
        rule_json: body.rule,
    };
    let routine = create_routine(params, &kernel.db_pool).await.map_err(|e| {
        match e.downcast_ref::<RoutineValidationError>() {
            Some(validation) => bad_request(validation.to_string()),
            None => internal(e),
        }
    })?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": routine.id,
            "name": routine.name,
            "next_run_at": routine.next_run_at,
        })),
    ))
}

pub async fn post_pause_run(
    State(kernel): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    pause_run_by_job(job_id, Some("operator pause"), &kernel.db_pool)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({ "pause_requested": true })))
}

pub async fn post_resume_run(
    State(kernel): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    resume_run_by_job(job_id, &kernel.db_pool)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({ "resume_requested": true })))
}

pub async fn post_cancel_run(
    State(kernel): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    cancel_run_by_job(job_id, Some("operator cancel"), &kernel.db_pool)
        .await
        .map_err(|e| bad_request(e.to_string()))?;
    Ok(Json(json!({ "cancel_requested": true })))
}
