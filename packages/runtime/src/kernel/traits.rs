//! Contracts for the runtime's external collaborators.
//!
//! The agent reasoning loop, channel integrations, steering judgment, and
//! condition probes all live behind these traits. The runtime drives them
//! and owns every state transition; implementations own the outside world.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domains::plugins::models::PluginInstance;

// ============================================================================
// Agent runner
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// The channel streams partial output; progress events matter.
    Streaming,
    /// The channel only accepts the final response.
    Final,
}

/// A teammate visible to the running agent, read-only.
#[derive(Debug, Clone, Serialize)]
pub struct Teammate {
    pub agent_id: Uuid,
    pub handle: String,
    pub display_name: String,
    pub role: Option<String>,
    pub status: String,
}

/// Read-only team snapshot assembled before a run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeamContext {
    pub teammates: Vec<Teammate>,
    pub recent_activity: String,
}

/// Everything the runner needs to execute one dispatch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub dispatch_id: Uuid,
    pub agent_id: Uuid,
    pub work_item_id: Uuid,
    pub coalesced_text: Option<String>,
    pub resume_from_job_id: Option<Uuid>,
    pub skip_triage: bool,
    pub response_mode: ResponseMode,
    pub team_context: Option<TeamContext>,
}

/// What a completed run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub job_id: Uuid,
    pub final_response: Option<String>,
    pub hit_limit: bool,
}

/// Run failure. Cancellation is a first-class variant, not a sentinel string.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("run cancelled")]
    Cancelled,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A newly-arrived message forwarded into an in-flight run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteerMessage {
    pub id: Uuid,
    pub text: String,
    pub sender_name: String,
}

/// What the runner should do at its next safe suspension point.
#[derive(Debug, Clone)]
pub enum RunControlDirective {
    Continue,
    Pause,
    Cancel,
    Steer { messages: Vec<SteerMessage> },
}

/// Progress notifications emitted by the runner, best-effort.
#[derive(Debug, Clone)]
pub enum RunEvent {
    Progress { text: String },
    Paused,
    Resumed,
    Steered,
}

/// Control channel the runner polls at safe suspension points.
///
/// The worker hands the runner one of these per dispatch; the runner calls
/// `directive()` between turns and reacts to the result.
#[async_trait]
pub trait RunControl: Send + Sync {
    async fn directive(&self) -> RunControlDirective;

    /// Reported once, as soon as the runner has allocated its job record.
    async fn job_started(&self, job_id: Uuid);

    async fn event(&self, event: RunEvent);
}

/// The agent reasoning loop. Out of scope for this repository; the runtime
/// only depends on this contract.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: RunRequest,
        control: Arc<dyn RunControl>,
    ) -> Result<RunOutput, RunError>;
}

// ============================================================================
// Channel handlers
// ============================================================================

/// Options threaded through to the channel adapter on delivery.
#[derive(Debug, Clone, Default)]
pub struct PostResponseOptions {
    pub hit_limit: bool,
    pub idempotency_key: Option<String>,
}

/// Tri-state delivery outcome.
///
/// `Unknown` means the transport failed after the send may have happened;
/// the runtime never retries it, the operator reconciles.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Sent { provider_ref: Option<String> },
    Failed { retryable: bool, error: String },
    Unknown { error: String },
}

/// Wire adapter for one channel type (telegram, slack, webhook, ...).
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    fn response_mode(&self) -> ResponseMode;

    /// Deliver a response. Called at most once per effect key.
    async fn post_response(
        &self,
        instance: &PluginInstance,
        work_item_id: Option<Uuid>,
        content: &str,
        response_context: &Value,
        options: &PostResponseOptions,
    ) -> Result<DeliveryOutcome>;

    /// Optional read-receipt, best-effort.
    async fn acknowledge_receipt(&self, _instance: &PluginInstance, _response_context: &Value) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Steering arbiter
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteeringAction {
    InterruptNow,
    DoNotInterrupt,
    Ignore,
}

impl SteeringAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InterruptNow => "interrupt_now",
            Self::DoNotInterrupt => "do_not_interrupt",
            Self::Ignore => "ignore",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SteeringDecision {
    pub action: SteeringAction,
    pub reason: String,
}

/// Another in-flight dispatch of the same agent, for arbiter context.
#[derive(Debug, Clone)]
pub struct ActiveWork {
    pub dispatch_id: Uuid,
    pub queue_key: String,
    pub objective: String,
}

#[derive(Debug, Clone)]
pub struct SteeringInput {
    pub agent_id: Uuid,
    pub agent_handle: String,
    /// What the in-flight run is currently working on.
    pub current_objective: String,
    pub pending: Vec<SteerMessage>,
    pub active_work: Vec<ActiveWork>,
}

/// Decides whether newly-arrived input should interrupt an in-flight run.
#[async_trait]
pub trait SteeringArbiter: Send + Sync {
    async fn decide(&self, input: &SteeringInput) -> Result<SteeringDecision>;
}

// ============================================================================
// Condition probes
// ============================================================================

/// A deterministic, side-effect-free check producing a structured record for
/// condition routines to match rules against.
#[async_trait]
pub trait Probe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, config: &Value) -> Result<Value>;
}
