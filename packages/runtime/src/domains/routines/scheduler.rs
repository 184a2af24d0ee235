//! Routine scheduler: turns due cron/condition/oneshot routines into work.
//!
//! Routines never do work inline; a firing routine enqueues a work item for
//! its agent and records a receipt. The `(routine_id, trigger_ref)` dedupe
//! makes every firing idempotent across crashes and restarts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::cron::{next_fire_after, validate_cron};
use super::models::{RecordOutcome, Routine, RoutineDecision, RoutineRun, RoutineTriggerKind};
use super::rules::{evaluate, parse_rule, RuleScope};
use crate::common::{generate_content_hash, is_schema_drift, warn_schema_drift_once, ActorEnvelope};
use crate::domains::control::models::RuntimeControl;
use crate::domains::queue::models::Lane;
use crate::domains::work_items::intake::{ingest_work_item, IngestOutcome, IntakeRequest};
use crate::domains::work_items::models::WorkItemPayload;
use crate::kernel::{RuntimeKernel, Service};

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const DUE_BATCH: i64 = 25;

/// Condition routines re-evaluate on this cadence unless a cron is set.
const CONDITION_INTERVAL_SECONDS: i64 = 300;

/// Catch-up jitter spread for cron firings.
const MAX_JITTER_SECONDS: i64 = 120;

pub struct RoutineSchedulerWorker {
    kernel: Arc<RuntimeKernel>,
}

impl RoutineSchedulerWorker {
    pub fn new(kernel: Arc<RuntimeKernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl Service for RoutineSchedulerWorker {
    fn name(&self) -> &'static str {
        "routine-scheduler"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("routine scheduler starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }

            let control = match RuntimeControl::get(&self.kernel.db_pool).await {
                Ok(control) => control,
                Err(e) => {
                    if is_schema_drift(&e) {
                        warn_schema_drift_once(&e);
                        return Ok(());
                    }
                    error!(error = %e, "failed to read runtime control");
                    continue;
                }
            };
            if !control.processing_enabled {
                continue;
            }

            let due = match Routine::find_due(DUE_BATCH, &self.kernel.db_pool).await {
                Ok(due) => due,
                Err(e) => {
                    error!(error = %e, "failed to load due routines");
                    continue;
                }
            };

            for routine in due {
                if let Err(e) = evaluate_due_routine(&self.kernel, &routine).await {
                    error!(routine_id = %routine.id, error = %e, "routine evaluation failed");
                    let _ = Routine::record_evaluation(
                        routine.id,
                        Some(Utc::now() + chrono::Duration::seconds(CONDITION_INTERVAL_SECONDS)),
                        &format!("error: {e}"),
                        &self.kernel.db_pool,
                    )
                    .await;
                }
            }
        }
        info!("routine scheduler stopped");
        Ok(())
    }
}

async fn evaluate_due_routine(kernel: &RuntimeKernel, routine: &Routine) -> Result<()> {
    match routine.trigger_kind {
        RoutineTriggerKind::Cron => evaluate_cron_routine(kernel, routine).await,
        RoutineTriggerKind::Condition => evaluate_condition_routine(kernel, routine).await,
        RoutineTriggerKind::Oneshot => {
            fire_routine(kernel, routine, "oneshot", "oneshot", None, None).await?;
            Routine::disable(routine.id, &kernel.db_pool).await?;
            Routine::record_evaluation(routine.id, None, "enqueued", &kernel.db_pool).await
        }
        RoutineTriggerKind::Event => Ok(()),
    }
}

async fn evaluate_cron_routine(kernel: &RuntimeKernel, routine: &Routine) -> Result<()> {
    let expr = routine
        .cron_expr
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("cron routine without expression"))?;

    if let Err(e) = validate_cron(expr, &routine.timezone) {
        warn!(routine_id = %routine.id, error = %e, "disabling invalid cron routine");
        Routine::disable(routine.id, &kernel.db_pool).await?;
        return Routine::record_evaluation(routine.id, None, &format!("error: {e}"), &kernel.db_pool)
            .await;
    }

    let now = Utc::now();
    let due_at = routine.next_run_at.unwrap_or(now);
    // Catch-up: a missed firing runs now, spread by jitter so a backlog of
    // routines does not thunder in one instant.
    let jitter = chrono::Duration::seconds(rand::thread_rng().gen_range(0..=MAX_JITTER_SECONDS));
    let fire_at = due_at.max(now) + jitter;
    let trigger_ref = format!("cron:{}", due_at.timestamp());

    fire_routine(kernel, routine, "cron", &trigger_ref, None, Some(fire_at)).await?;

    let next = next_fire_after(expr, &routine.timezone, due_at.max(now))?;
    Routine::record_evaluation(routine.id, next, "enqueued", &kernel.db_pool).await
}

async fn evaluate_condition_routine(kernel: &RuntimeKernel, routine: &Routine) -> Result<()> {
    let probe_name = routine
        .condition_probe
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("condition routine without probe"))?;
    let probe = kernel
        .probes
        .get(probe_name)
        .ok_or_else(|| anyhow::anyhow!("unknown probe '{probe_name}'"))?;

    let config = routine.condition_config.clone().unwrap_or(Value::Null);
    let output = probe.run(&config).await?;

    let rule_value = routine
        .rule_json
        .clone()
        .ok_or_else(|| anyhow::anyhow!("condition routine without rule"))?;
    let rule = parse_rule(&rule_value, RuleScope::Probe)?;
    let matched = evaluate(&rule, &output);

    // Identical probe states dedupe on a content hash, so a condition that
    // stays true does not re-fire every evaluation.
    let trigger_ref = format!("probe:{}", generate_content_hash(&output.to_string()));
    let status = if matched {
        fire_routine(kernel, routine, "condition", &trigger_ref, Some(output), None).await?;
        "enqueued"
    } else {
        RoutineRun::record(
            routine.id,
            "condition",
            &trigger_ref,
            Some(output),
            RoutineDecision::Skipped,
            Some("rule did not match"),
            None,
            &kernel.db_pool,
        )
        .await?;
        "skipped"
    };

    let next = match routine.cron_expr.as_deref() {
        Some(expr) => next_fire_after(expr, &routine.timezone, Utc::now())?,
        None => Some(Utc::now() + chrono::Duration::seconds(CONDITION_INTERVAL_SECONDS)),
    };
    Routine::record_evaluation(routine.id, next, status, &kernel.db_pool).await
}

/// Record a receipt and enqueue the routine's work item.
///
/// Returns without enqueueing when the `(routine_id, trigger_ref)` receipt
/// already exists.
pub async fn fire_routine(
    kernel: &RuntimeKernel,
    routine: &Routine,
    trigger_origin: &str,
    trigger_ref: &str,
    envelope: Option<Value>,
    fire_at: Option<DateTime<Utc>>,
) -> Result<RecordOutcome> {
    let record = RoutineRun::record(
        routine.id,
        trigger_origin,
        trigger_ref,
        envelope.clone(),
        RoutineDecision::Enqueued,
        None,
        None,
        &kernel.db_pool,
    )
    .await?;
    let RecordOutcome::Created(run) = record else {
        return Ok(RecordOutcome::Duplicate);
    };

    let text = routine_fire_text(routine, trigger_origin, envelope.as_ref());
    let request = IntakeRequest::builder()
        .session_key(format!("routine:{}", routine.id))
        .source("routine")
        .source_ref(format!("routine:{}:{trigger_ref}", routine.id))
        .title(routine.name.clone())
        .payload(WorkItemPayload {
            text,
            sender_name: "routine".into(),
            actor: ActorEnvelope::system("routine"),
            response_context: Value::Null,
            relay_depth: 0,
            target_agent_ids: vec![routine.agent_id],
        })
        .build();

    match ingest_work_item(kernel, request).await? {
        IngestOutcome::Ingested { work_item, .. } => {
            RoutineRun::set_scheduled_item(run.id, work_item.id, &kernel.db_pool).await?;

            // A future fire time pushes the lane debounce out to it.
            if let Some(fire_at) = fire_at {
                let delay_ms = (fire_at - Utc::now()).num_milliseconds();
                if delay_ms > 0 {
                    Lane::upsert_for_enqueue(
                        &work_item.session_key,
                        routine.agent_id,
                        delay_ms,
                        20,
                        &kernel.db_pool,
                    )
                    .await?;
                }
            }
            info!(routine_id = %routine.id, work_item_id = %work_item.id, trigger_ref, "routine fired");
        }
        IngestOutcome::Duplicate(_) | IngestOutcome::Blocked { .. } => {}
    }

    Ok(RecordOutcome::Created(run))
}

fn routine_fire_text(routine: &Routine, trigger_origin: &str, envelope: Option<&Value>) -> String {
    match envelope {
        Some(envelope) => format!(
            "Routine '{}' triggered ({trigger_origin}).\n\n{}",
            routine.name,
            serde_json::to_string_pretty(envelope).unwrap_or_default()
        ),
        None => format!("Routine '{}' triggered ({trigger_origin}).", routine.name),
    }
}
