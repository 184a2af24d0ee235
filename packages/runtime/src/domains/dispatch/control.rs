//! Per-dispatch control channel handed to the agent runner.
//!
//! The runner polls `directive()` at safe suspension points; the handle
//! consults the dispatch's control state and the lane's pending messages,
//! involving the steering arbiter when there is something to decide.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, warn};
use uuid::Uuid;

use super::models::{ControlState, Job, JobStatus, RunDispatch};
use super::steering::{
    build_steer_messages, format_control_reason, should_short_circuit, steering_signature,
};
use crate::domains::queue::models::{LaneMode, QueueMessage};
use crate::kernel::{
    ActiveWork, RunControl, RunControlDirective, RunEvent, SteeringAction, SteeringArbiter,
    SteeringInput,
};

pub struct DispatchControlHandle {
    pool: PgPool,
    arbiter: Arc<dyn SteeringArbiter>,
    dispatch_id: Uuid,
    queue_key: String,
    agent_id: Uuid,
    agent_handle: String,
    lane_mode: LaneMode,
    objective: String,
    expected_epoch: i64,
    steering_memo: Mutex<Option<(String, SteeringAction)>>,
}

impl DispatchControlHandle {
    pub fn new(
        pool: PgPool,
        arbiter: Arc<dyn SteeringArbiter>,
        dispatch: &RunDispatch,
        agent_handle: String,
        lane_mode: LaneMode,
    ) -> Self {
        Self {
            pool,
            arbiter,
            dispatch_id: dispatch.id,
            queue_key: dispatch.queue_key.clone(),
            agent_id: dispatch.agent_id,
            agent_handle,
            lane_mode,
            objective: dispatch.coalesced_text.clone().unwrap_or_default(),
            expected_epoch: dispatch.claimed_epoch,
            steering_memo: Mutex::new(None),
        }
    }

    async fn compute_directive(&self) -> Result<RunControlDirective> {
        let dispatch = RunDispatch::find_by_id(self.dispatch_id, &self.pool).await?;

        match dispatch.control_state {
            ControlState::CancelRequested => return Ok(RunControlDirective::Cancel),
            ControlState::PauseRequested => return Ok(RunControlDirective::Pause),
            ControlState::ResumeRequested => {
                RunDispatch::mark_resumed(self.dispatch_id, self.expected_epoch, &self.pool)
                    .await?;
                return Ok(RunControlDirective::Continue);
            }
            ControlState::Normal => {}
        }

        // Coalesce lanes never steer; new input waits for the next run.
        if self.lane_mode == LaneMode::Coalesce {
            return Ok(RunControlDirective::Continue);
        }

        let pending = QueueMessage::find_pending(&self.queue_key, &self.pool).await?;
        if pending.is_empty() {
            return Ok(RunControlDirective::Continue);
        }

        let signature = steering_signature(&pending);
        {
            let memo = self.steering_memo.lock().unwrap();
            if should_short_circuit(&memo, &signature) {
                return Ok(RunControlDirective::Continue);
            }
        }

        let active = RunDispatch::find_active_for_agent(self.agent_id, self.dispatch_id, &self.pool)
            .await?
            .into_iter()
            .map(|d| ActiveWork {
                dispatch_id: d.id,
                queue_key: d.queue_key,
                objective: d.coalesced_text.unwrap_or_default(),
            })
            .collect();

        let input = SteeringInput {
            agent_id: self.agent_id,
            agent_handle: self.agent_handle.clone(),
            current_objective: self.objective.clone(),
            pending: build_steer_messages(&pending),
            active_work: active,
        };

        let decision = self.arbiter.decide(&input).await?;
        RunDispatch::record_control_reason(
            self.dispatch_id,
            &format_control_reason(&decision),
            &self.pool,
        )
        .await?;

        *self.steering_memo.lock().unwrap() = Some((signature, decision.action));

        let ids: Vec<Uuid> = pending.iter().map(|m| m.id).collect();
        match decision.action {
            SteeringAction::InterruptNow => {
                let messages = build_steer_messages(&pending);
                QueueMessage::mark_included(&ids, self.dispatch_id, &self.pool).await?;
                debug!(dispatch_id = %self.dispatch_id, count = messages.len(), "steering run");
                Ok(RunControlDirective::Steer { messages })
            }
            SteeringAction::DoNotInterrupt => Ok(RunControlDirective::Continue),
            SteeringAction::Ignore => {
                QueueMessage::mark_dropped(&ids, &decision.reason, &self.pool).await?;
                debug!(dispatch_id = %self.dispatch_id, reason = %decision.reason, "dropped pending input");
                Ok(RunControlDirective::Continue)
            }
        }
    }
}

#[async_trait]
impl RunControl for DispatchControlHandle {
    async fn directive(&self) -> RunControlDirective {
        // Fail open: a transient store error must not wedge the run; the
        // next poll reconverges.
        match self.compute_directive().await {
            Ok(directive) => directive,
            Err(e) => {
                warn!(dispatch_id = %self.dispatch_id, error = %e, "control directive failed");
                RunControlDirective::Continue
            }
        }
    }

    async fn job_started(&self, job_id: Uuid) {
        if let Err(e) = Job::start(job_id, self.dispatch_id, self.agent_id, &self.pool).await {
            warn!(dispatch_id = %self.dispatch_id, error = %e, "failed to record job");
        }
        if let Err(e) = RunDispatch::attach_job(self.dispatch_id, job_id, &self.pool).await {
            warn!(dispatch_id = %self.dispatch_id, error = %e, "failed to attach job");
        }
    }

    async fn event(&self, event: RunEvent) {
        match event {
            RunEvent::Paused => {
                if let Err(e) =
                    RunDispatch::mark_paused(self.dispatch_id, self.expected_epoch, &self.pool)
                        .await
                {
                    warn!(dispatch_id = %self.dispatch_id, error = %e, "failed to mark paused");
                }
            }
            RunEvent::Resumed => {
                if let Err(e) =
                    RunDispatch::mark_resumed(self.dispatch_id, self.expected_epoch, &self.pool)
                        .await
                {
                    warn!(dispatch_id = %self.dispatch_id, error = %e, "failed to mark resumed");
                }
            }
            RunEvent::Steered => {
                debug!(dispatch_id = %self.dispatch_id, "runner incorporated steer input");
            }
            RunEvent::Progress { text } => {
                debug!(dispatch_id = %self.dispatch_id, progress = %text, "run progress");
            }
        }
    }
}

/// Finish the job receipt to match the dispatch outcome.
pub async fn finish_job_for_outcome(
    job_id: Option<Uuid>,
    status: JobStatus,
    error: Option<&str>,
    pool: &PgPool,
) {
    let Some(job_id) = job_id else { return };
    if let Err(e) = Job::finish(job_id, status, error, pool).await {
        warn!(job_id = %job_id, error = %e, "failed to finish job");
    }
}
