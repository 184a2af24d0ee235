//! Run-dispatch worker: claims dispatches, drives the agent runner, and
//! finalizes with epoch-gated writes.
//!
//! Per-conversation ordering falls out of the lane invariant: a claim flips
//! the lane to `running` and nothing else can claim into that lane until
//! finalize releases it, so the pool size only bounds cross-lane
//! parallelism.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::control::{finish_job_for_outcome, DispatchControlHandle};
use super::models::{DispatchStatus, JobStatus, RunDispatch};
use super::promote::promote_due_lanes;
use crate::common::{is_schema_drift, warn_schema_drift_once, ActorEnvelope};
use crate::domains::control::models::RuntimeControl;
use crate::domains::outbox::models::{
    failure_notice_effect_key, final_response_effect_key, EffectOutbox, EffectPayload,
};
use crate::domains::plugins::models::{Agent, PluginInstance};
use crate::domains::queue::models::{Lane, LaneMode};
use crate::domains::work_items::models::{summarize_recent, Message, WorkItem, WorkItemStatus};
use crate::kernel::{
    ResponseMode, RunError, RunOutput, RunRequest, RuntimeKernel, Service, TeamContext, Teammate,
};

/// Channel name used for in-app sessions with no plugin instance.
const IN_APP_CHANNEL: &str = "chat";

#[derive(Debug, Clone)]
pub struct RunDispatchWorkerConfig {
    pub worker_id: String,
    pub lease_seconds: i64,
    pub tick_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for RunDispatchWorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("dispatch-worker-{}", Uuid::new_v4()),
            lease_seconds: 120,
            tick_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(25),
        }
    }
}

pub struct RunDispatchWorker {
    kernel: Arc<RuntimeKernel>,
    config: RunDispatchWorkerConfig,
}

impl RunDispatchWorker {
    pub fn new(kernel: Arc<RuntimeKernel>) -> Self {
        let config = RunDispatchWorkerConfig {
            lease_seconds: kernel.config.dispatch_lease_seconds,
            ..Default::default()
        };
        Self { kernel, config }
    }

    pub fn with_config(kernel: Arc<RuntimeKernel>, config: RunDispatchWorkerConfig) -> Self {
        Self { kernel, config }
    }
}

#[async_trait::async_trait]
impl Service for RunDispatchWorker {
    fn name(&self) -> &'static str {
        "run-dispatch-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            lease_seconds = self.config.lease_seconds,
            "run-dispatch worker starting"
        );

        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.tick_interval) => {}
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

            if let Err(e) = promote_due_lanes(&self.kernel.db_pool).await {
                error!(error = %e, "lane promotion failed");
            }

            while active.load(Ordering::SeqCst) < control.max_concurrent_dispatches as usize {
                let claimed = match RunDispatch::claim_next(
                    &self.config.worker_id,
                    self.config.lease_seconds,
                    &self.kernel.db_pool,
                )
                .await
                {
                    Ok(Some(claimed)) => claimed,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "failed to claim dispatch");
                        break;
                    }
                };

                debug!(dispatch_id = %claimed.id, queue_key = %claimed.queue_key, "claimed dispatch");
                active.fetch_add(1, Ordering::SeqCst);
                let kernel = self.kernel.clone();
                let lease_seconds = self.config.lease_seconds;
                let active_ref = active.clone();
                tokio::spawn(async move {
                    execute_dispatch(kernel, claimed, lease_seconds).await;
                    active_ref.fetch_sub(1, Ordering::SeqCst);
                });
            }
        }

        // Drain: stop claiming, then wait for in-flight runs.
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while active.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        let remaining = active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "drain window elapsed with runs still active");
        }
        info!(worker_id = %self.config.worker_id, "run-dispatch worker stopped");
        Ok(())
    }
}

/// Execute one claimed dispatch end to end. Never panics the worker; every
/// exit path finalizes (or discovers it was preempted) and stops the
/// heartbeat.
pub async fn execute_dispatch(kernel: Arc<RuntimeKernel>, dispatch: RunDispatch, lease_seconds: i64) {
    let pool = kernel.db_pool.clone();
    let heartbeat_stop = CancellationToken::new();
    let heartbeat_task = spawn_heartbeat(
        pool.clone(),
        dispatch.id,
        dispatch.claimed_epoch,
        lease_seconds,
        heartbeat_stop.clone(),
    );

    // Status feeds teammate snapshots; best-effort on both edges.
    if let Err(e) = Agent::set_status(dispatch.agent_id, "busy", &pool).await {
        warn!(agent_id = %dispatch.agent_id, error = %e, "failed to set agent status");
    }

    let outcome = run_claimed_dispatch(&kernel, &dispatch).await;
    if let Err(e) = apply_outcome(&kernel, &dispatch, outcome).await {
        error!(dispatch_id = %dispatch.id, error = %e, "failed to record dispatch outcome");
    }

    if let Err(e) = Agent::set_status(dispatch.agent_id, "idle", &pool).await {
        warn!(agent_id = %dispatch.agent_id, error = %e, "failed to set agent status");
    }

    heartbeat_stop.cancel();
    let _ = heartbeat_task.await;
}

fn spawn_heartbeat(
    pool: PgPool,
    dispatch_id: Uuid,
    expected_epoch: i64,
    lease_seconds: i64,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    // Renew well inside the lease window.
    let period = Duration::from_secs((lease_seconds / 6).max(5) as u64);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // Skip first immediate tick

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    match RunDispatch::heartbeat(dispatch_id, lease_seconds, expected_epoch, &pool).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Preempted: recovery or emergency stop took the row.
                            warn!(dispatch_id = %dispatch_id, "lease lost, stopping heartbeat");
                            break;
                        }
                        Err(e) => warn!(dispatch_id = %dispatch_id, error = %e, "heartbeat failed"),
                    }
                }
            }
        }
    })
}

struct LoadedContext {
    work_item: WorkItem,
    agent: Agent,
    instance: Option<PluginInstance>,
    assigned_count: usize,
    channel: String,
    response_context: serde_json::Value,
}

async fn run_claimed_dispatch(
    kernel: &RuntimeKernel,
    dispatch: &RunDispatch,
) -> (Result<RunOutput, RunError>, Option<LoadedContext>) {
    let context = match load_context(kernel, dispatch).await {
        Ok(context) => context,
        Err(e) => return (Err(RunError::Other(e)), None),
    };

    let lane_mode = match Lane::find(&dispatch.queue_key, &kernel.db_pool).await {
        Ok(Some(lane)) => lane.mode,
        _ => LaneMode::Steer,
    };

    let response_mode = context
        .instance
        .as_ref()
        .and_then(|i| kernel.channels.get(&i.plugin_type))
        .map(|h| h.response_mode())
        .unwrap_or(ResponseMode::Final);

    let team_context = match load_team_context(kernel, dispatch, &context).await {
        Ok(team) => team,
        Err(e) => {
            warn!(dispatch_id = %dispatch.id, error = %e, "failed to load team context");
            None
        }
    };

    // Transcript: the coalesced user turn, attributed to the inbound actor.
    if let Some(text) = dispatch.coalesced_text.as_deref() {
        let actor = context
            .work_item
            .parsed_payload()
            .map(|p| p.actor)
            .unwrap_or_else(|_| ActorEnvelope::system("runtime"));
        if let Err(e) = Message::append(
            &context.work_item.session_key,
            None,
            "user",
            text,
            &actor,
            &kernel.db_pool,
        )
        .await
        {
            warn!(dispatch_id = %dispatch.id, error = %e, "failed to append user turn");
        }
    }

    let control = Arc::new(DispatchControlHandle::new(
        kernel.db_pool.clone(),
        kernel.arbiter.clone(),
        dispatch,
        context.agent.handle.clone(),
        lane_mode,
    ));

    let request = RunRequest {
        dispatch_id: dispatch.id,
        agent_id: dispatch.agent_id,
        work_item_id: dispatch.work_item_id,
        coalesced_text: dispatch.coalesced_text.clone(),
        resume_from_job_id: dispatch.replay_of_dispatch_id.and(dispatch.job_id),
        skip_triage: false,
        response_mode,
        team_context,
    };

    let result = kernel.runner.run(request, control).await;
    (result, Some(context))
}

async fn load_context(kernel: &RuntimeKernel, dispatch: &RunDispatch) -> Result<LoadedContext> {
    let work_item = WorkItem::find_by_id(dispatch.work_item_id, &kernel.db_pool)
        .await
        .context("work item not found")?;
    let agent = Agent::find_by_id(dispatch.agent_id, &kernel.db_pool)
        .await
        .context("agent not found")?;

    let instance = match work_item.plugin_instance_id {
        Some(id) => Some(PluginInstance::find_by_id(id, &kernel.db_pool).await?),
        None => None,
    };
    let assigned_count = match &instance {
        Some(instance) => instance.assigned_agents(&kernel.db_pool).await?.len(),
        None => 1,
    };
    let channel = instance
        .as_ref()
        .map(|i| i.plugin_type.clone())
        .unwrap_or_else(|| IN_APP_CHANNEL.to_string());
    let response_context = work_item
        .parsed_payload()
        .map(|p| p.response_context)
        .unwrap_or(serde_json::Value::Null);

    Ok(LoadedContext {
        work_item,
        agent,
        instance,
        assigned_count,
        channel,
        response_context,
    })
}

async fn load_team_context(
    kernel: &RuntimeKernel,
    dispatch: &RunDispatch,
    context: &LoadedContext,
) -> Result<Option<TeamContext>> {
    let Some(instance) = &context.instance else {
        return Ok(None);
    };
    let teammates: Vec<Teammate> = instance
        .assigned_agents(&kernel.db_pool)
        .await?
        .into_iter()
        .filter(|a| a.id != dispatch.agent_id)
        .map(|a| Teammate {
            agent_id: a.id,
            handle: a.handle,
            display_name: a.display_name,
            role: a.role,
            status: a.status,
        })
        .collect();
    if teammates.is_empty() {
        return Ok(None);
    }

    let recent = Message::find_recent(&context.work_item.session_key, 10, &kernel.db_pool).await?;
    Ok(Some(TeamContext {
        teammates,
        recent_activity: summarize_recent(&recent),
    }))
}

async fn apply_outcome(
    kernel: &RuntimeKernel,
    dispatch: &RunDispatch,
    (result, context): (Result<RunOutput, RunError>, Option<LoadedContext>),
) -> Result<()> {
    let pool = &kernel.db_pool;
    match result {
        Ok(output) => {
            let finalized = RunDispatch::finalize(
                dispatch.id,
                DispatchStatus::Completed,
                None,
                dispatch.claimed_epoch,
                pool,
            )
            .await?;
            if !finalized {
                debug!(dispatch_id = %dispatch.id, "finalize preempted, discarding outcome");
                return Ok(());
            }

            WorkItem::transition(dispatch.work_item_id, WorkItemStatus::Done, pool).await?;
            finish_job_for_outcome(Some(output.job_id), JobStatus::Succeeded, None, pool).await;

            let Some(context) = context else {
                return Ok(());
            };
            if let Some(response) = output.final_response.as_deref() {
                record_final_response(kernel, dispatch, &context, &output, response).await?;
            }
            info!(dispatch_id = %dispatch.id, "dispatch completed");
        }
        Err(RunError::Cancelled) => {
            let finalized = RunDispatch::finalize(
                dispatch.id,
                DispatchStatus::Cancelled,
                dispatch.control_reason.as_deref(),
                dispatch.claimed_epoch,
                pool,
            )
            .await?;
            if finalized {
                finish_job_for_outcome(dispatch.job_id, JobStatus::Cancelled, None, pool).await;
                info!(dispatch_id = %dispatch.id, "dispatch cancelled");
            }
        }
        Err(RunError::Other(e)) => {
            let message = format!("{e:#}");
            let finalized = RunDispatch::finalize(
                dispatch.id,
                DispatchStatus::Failed,
                Some(&message),
                dispatch.claimed_epoch,
                pool,
            )
            .await?;
            if !finalized {
                return Ok(());
            }

            WorkItem::transition(dispatch.work_item_id, WorkItemStatus::Failed, pool).await?;
            finish_job_for_outcome(dispatch.job_id, JobStatus::Failed, Some(&message), pool).await;
            warn!(dispatch_id = %dispatch.id, error = %message, "dispatch failed");

            if let Some(context) = context {
                let payload = EffectPayload {
                    content: format_failure_notice(&context.agent.display_name, &message),
                    response_context: context.response_context.clone(),
                    hit_limit: false,
                    actor: ActorEnvelope::system("runtime"),
                };
                EffectOutbox::insert(
                    &failure_notice_effect_key(dispatch.id),
                    Some(dispatch.id),
                    context.instance.as_ref().map(|i| i.id),
                    Some(dispatch.work_item_id),
                    dispatch.job_id,
                    &context.channel,
                    "failure_notice",
                    &payload,
                    pool,
                )
                .await?;
            }
        }
    }
    Ok(())
}

async fn record_final_response(
    kernel: &RuntimeKernel,
    dispatch: &RunDispatch,
    context: &LoadedContext,
    output: &RunOutput,
    response: &str,
) -> Result<()> {
    let pool = &kernel.db_pool;
    let actor = ActorEnvelope::Agent {
        agent_id: context.agent.id,
        handle: context.agent.handle.clone(),
        display_name: context.agent.display_name.clone(),
        source: Some(context.channel.clone()),
    };

    Message::append(
        &context.work_item.session_key,
        Some(context.agent.id),
        "assistant",
        response,
        &actor,
        pool,
    )
    .await?;

    let payload = EffectPayload {
        content: prefix_response(response, &context.agent.display_name, context.assigned_count > 1),
        response_context: context.response_context.clone(),
        hit_limit: output.hit_limit,
        actor,
    };
    EffectOutbox::insert(
        &final_response_effect_key(dispatch.id),
        Some(dispatch.id),
        context.instance.as_ref().map(|i| i.id),
        Some(dispatch.work_item_id),
        Some(output.job_id),
        &context.channel,
        "assistant_final_response",
        &payload,
        pool,
    )
    .await?;
    Ok(())
}

/// Prefix the agent's display label iff the instance has multiple agents.
pub fn prefix_response(content: &str, display_name: &str, multi_agent: bool) -> String {
    if multi_agent {
        format!("[{display_name}] {content}")
    } else {
        content.to_string()
    }
}

/// Human-readable failure notice for the originating channel.
pub fn format_failure_notice(agent_display_name: &str, error: &str) -> String {
    format!("{agent_display_name} could not finish this request: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_agent_response_is_unprefixed() {
        assert_eq!(prefix_response("hello", "Scout", false), "hello");
    }

    #[test]
    fn multi_agent_response_carries_display_label() {
        assert_eq!(prefix_response("hello", "Scout", true), "[Scout] hello");
    }

    #[test]
    fn failure_notice_names_the_agent_and_reason() {
        let notice = format_failure_notice("Scout", "probe timed out");
        assert!(notice.contains("Scout"));
        assert!(notice.contains("probe timed out"));
    }

    #[test]
    fn heartbeat_period_is_a_sixth_of_the_lease() {
        let lease = 120i64;
        assert_eq!((lease / 6).max(5), 20);
        // Short leases still heartbeat at a sane floor.
        assert_eq!((12i64 / 6).max(5), 5);
    }
}
