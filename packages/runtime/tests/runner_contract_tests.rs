//! Contract tests for the runner control channel: directives observed at
//! suspension points, cancellation as a typed error, and relay-depth
//! bounds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use runtime_core::domains::outbox::relay::{relay_depth_allowed, MAX_RELAY_DEPTH};
use runtime_core::kernel::{
    AgentRunner, MockAgentRunner, ResponseMode, RunControl, RunControlDirective, RunError,
    RunEvent, RunRequest, SteerMessage,
};
use uuid::Uuid;

struct ScriptedControl {
    directives: Mutex<VecDeque<RunControlDirective>>,
    jobs: Mutex<Vec<Uuid>>,
}

impl ScriptedControl {
    fn new(directives: Vec<RunControlDirective>) -> Arc<Self> {
        Arc::new(Self {
            directives: Mutex::new(directives.into()),
            jobs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl RunControl for ScriptedControl {
    async fn directive(&self) -> RunControlDirective {
        self.directives
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RunControlDirective::Continue)
    }

    async fn job_started(&self, job_id: Uuid) {
        self.jobs.lock().unwrap().push(job_id);
    }

    async fn event(&self, _event: RunEvent) {}
}

fn request(text: &str) -> RunRequest {
    RunRequest {
        dispatch_id: Uuid::new_v4(),
        agent_id: Uuid::new_v4(),
        work_item_id: Uuid::new_v4(),
        coalesced_text: Some(text.to_string()),
        resume_from_job_id: None,
        skip_triage: false,
        response_mode: ResponseMode::Final,
        team_context: None,
    }
}

#[tokio::test]
async fn runner_reports_its_job_before_polling() {
    let runner = MockAgentRunner::replying("done");
    let control = ScriptedControl::new(vec![]);

    let output = runner.run(request("hi"), control.clone()).await.unwrap();

    let jobs = control.jobs.lock().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0], output.job_id);
    assert_eq!(output.final_response.as_deref(), Some("done"));
}

#[tokio::test]
async fn cancel_directive_surfaces_as_typed_cancellation() {
    let runner = MockAgentRunner::replying("never sent");
    let control = ScriptedControl::new(vec![RunControlDirective::Cancel]);

    let err = runner.run(request("hi"), control).await.unwrap_err();
    assert!(matches!(err, RunError::Cancelled));
}

#[tokio::test]
async fn steer_directive_hands_messages_to_the_runner() {
    let runner = MockAgentRunner::replying("done");
    let steer = RunControlDirective::Steer {
        messages: vec![SteerMessage {
            id: Uuid::new_v4(),
            text: "urgent: prod is down".into(),
            sender_name: "mvasquez".into(),
        }],
    };
    let control = ScriptedControl::new(vec![steer]);

    runner.run(request("write the report"), control).await.unwrap();

    let steered = runner.steered_with.lock().unwrap();
    assert_eq!(steered.len(), 1);
    assert_eq!(steered[0][0].text, "urgent: prod is down");
}

#[test]
fn relay_chain_depth_is_bounded() {
    // A relay chain increments depth by exactly one per hop and stops at
    // the bound.
    let mut depth = 0;
    let mut hops = 0;
    while relay_depth_allowed(depth) {
        depth += 1;
        hops += 1;
        assert!(depth <= MAX_RELAY_DEPTH);
    }
    assert_eq!(hops, MAX_RELAY_DEPTH);
    assert_eq!(depth, MAX_RELAY_DEPTH);
}
