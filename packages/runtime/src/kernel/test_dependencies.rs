//! Mock collaborators for tests.
//!
//! These stand in for the agent runner, channel adapters, the steering
//! arbiter, and condition probes so worker logic can be exercised without
//! any external systems.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::traits::{
    AgentRunner, ChannelHandler, DeliveryOutcome, PostResponseOptions, Probe, ResponseMode,
    RunControl, RunControlDirective, RunError, RunOutput, RunRequest, SteerMessage,
    SteeringArbiter, SteeringDecision, SteeringInput,
};
use crate::common::db_id;
use crate::domains::plugins::models::PluginInstance;

/// Runner that reports a job, polls the control channel between fake turns,
/// and returns a fixed final response.
pub struct MockAgentRunner {
    pub final_response: Option<String>,
    /// How many directive polls to perform before finishing.
    pub turns: usize,
    pub calls: Mutex<Vec<RunRequest>>,
    pub steered_with: Mutex<Vec<Vec<SteerMessage>>>,
}

impl MockAgentRunner {
    pub fn replying(text: &str) -> Self {
        Self {
            final_response: Some(text.to_string()),
            turns: 1,
            calls: Mutex::new(Vec::new()),
            steered_with: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AgentRunner for MockAgentRunner {
    async fn run(
        &self,
        request: RunRequest,
        control: Arc<dyn RunControl>,
    ) -> Result<RunOutput, RunError> {
        self.calls.lock().unwrap().push(request);
        let job_id = db_id();
        control.job_started(job_id).await;

        for _ in 0..self.turns {
            match control.directive().await {
                RunControlDirective::Continue => {}
                RunControlDirective::Pause => {}
                RunControlDirective::Cancel => return Err(RunError::Cancelled),
                RunControlDirective::Steer { messages } => {
                    self.steered_with.lock().unwrap().push(messages);
                }
            }
        }

        Ok(RunOutput {
            job_id,
            final_response: self.final_response.clone(),
            hit_limit: false,
        })
    }
}

/// Channel handler with a scripted outcome that records every delivery.
pub struct MockChannelHandler {
    pub mode: ResponseMode,
    pub outcome: Mutex<DeliveryOutcome>,
    pub posts: Mutex<Vec<String>>,
}

impl MockChannelHandler {
    pub fn sending() -> Self {
        Self {
            mode: ResponseMode::Final,
            outcome: Mutex::new(DeliveryOutcome::Sent { provider_ref: None }),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_outcome(outcome: DeliveryOutcome) -> Self {
        Self {
            mode: ResponseMode::Final,
            outcome: Mutex::new(outcome),
            posts: Mutex::new(Vec::new()),
        }
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelHandler for MockChannelHandler {
    fn response_mode(&self) -> ResponseMode {
        self.mode
    }

    async fn post_response(
        &self,
        _instance: &PluginInstance,
        _work_item_id: Option<Uuid>,
        content: &str,
        _response_context: &Value,
        _options: &PostResponseOptions,
    ) -> Result<DeliveryOutcome> {
        self.posts.lock().unwrap().push(content.to_string());
        Ok(self.outcome.lock().unwrap().clone())
    }
}

/// Arbiter that replays a scripted decision sequence, then falls back to
/// `do_not_interrupt`.
pub struct ScriptedArbiter {
    decisions: Mutex<VecDeque<SteeringDecision>>,
    pub calls: AtomicUsize,
}

impl ScriptedArbiter {
    pub fn new(decisions: Vec<SteeringDecision>) -> Self {
        Self {
            decisions: Mutex::new(decisions.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SteeringArbiter for ScriptedArbiter {
    async fn decide(&self, _input: &SteeringInput) -> Result<SteeringDecision> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .decisions
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SteeringDecision {
                action: super::traits::SteeringAction::DoNotInterrupt,
                reason: "scripted default".into(),
            }))
    }
}

/// Probe returning a fixed record.
pub struct StaticProbe {
    pub probe_name: &'static str,
    pub value: Value,
}

#[async_trait]
impl Probe for StaticProbe {
    fn name(&self) -> &'static str {
        self.probe_name
    }

    async fn run(&self, _config: &Value) -> Result<Value> {
        Ok(self.value.clone())
    }
}
