//! Stand-in agent runner wired by the binary until a real agent
//! integration is registered.
//!
//! Acknowledges the coalesced input as its final response, honoring the
//! control channel, so the whole intake → dispatch → outbox → delivery
//! path can be exercised end to end on a fresh install.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::traits::{
    AgentRunner, RunControl, RunControlDirective, RunError, RunOutput, RunRequest,
};

pub struct EchoAgentRunner;

#[async_trait]
impl AgentRunner for EchoAgentRunner {
    async fn run(
        &self,
        request: RunRequest,
        control: Arc<dyn RunControl>,
    ) -> Result<RunOutput, RunError> {
        let job_id = Uuid::new_v4();
        control.job_started(job_id).await;

        let mut input = request.coalesced_text.unwrap_or_default();
        match control.directive().await {
            RunControlDirective::Cancel => return Err(RunError::Cancelled),
            RunControlDirective::Steer { messages } => {
                for message in messages {
                    input.push_str("\n\n");
                    input.push_str(&message.text);
                }
            }
            RunControlDirective::Continue | RunControlDirective::Pause => {}
        }

        let summary: String = input.chars().take(200).collect();
        Ok(RunOutput {
            job_id,
            final_response: Some(format!("Received: {summary}")),
            hit_limit: false,
        })
    }
}
