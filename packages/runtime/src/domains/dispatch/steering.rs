//! Steering: deciding whether newly-arrived input interrupts an in-flight
//! run.
//!
//! The worker polls for pending lane messages at every control-directive
//! request. Consecutive polls over the same pending set short-circuit on a
//! content signature so the arbiter is not re-consulted every tick.

use anyhow::Result;
use async_trait::async_trait;

use crate::common::{exact_hash, generate_content_hash};
use crate::domains::queue::models::QueueMessage;
use crate::kernel::{
    SteerMessage, SteeringAction, SteeringArbiter, SteeringDecision, SteeringInput,
};

/// Content signature of a pending message set.
pub fn steering_signature(pending: &[QueueMessage]) -> String {
    let parts: Vec<String> = pending
        .iter()
        .map(|m| format!("{}:{}", m.id, m.text))
        .collect();
    let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
    exact_hash(&refs)
}

pub fn build_steer_messages(pending: &[QueueMessage]) -> Vec<SteerMessage> {
    pending
        .iter()
        .map(|m| SteerMessage {
            id: m.id,
            text: m.text.clone(),
            sender_name: m.sender_name.clone(),
        })
        .collect()
}

/// A repeat poll over the same pending set only re-consults the arbiter if
/// the prior verdict was `interrupt_now` (which should have been consumed).
pub fn should_short_circuit(
    memo: &Option<(String, SteeringAction)>,
    signature: &str,
) -> bool {
    matches!(
        memo,
        Some((last_signature, last_action))
            if last_signature == signature && *last_action != SteeringAction::InterruptNow
    )
}

/// `control_reason` format written to the dispatch for observability.
pub fn format_control_reason(decision: &SteeringDecision) -> String {
    format!("arbiter:{}:{}", decision.action.as_str(), decision.reason)
}

/// Deterministic fallback arbiter.
///
/// An LLM-backed arbiter is an external collaborator behind the same trait;
/// this one keeps the runtime self-contained: urgency keywords interrupt,
/// near-duplicates of the current objective are dropped, everything else
/// waits for the next turn.
pub struct HeuristicArbiter;

const INTERRUPT_KEYWORDS: &[&str] = &["urgent", "stop", "cancel", "wait", "instead", "actually"];

#[async_trait]
impl SteeringArbiter for HeuristicArbiter {
    async fn decide(&self, input: &SteeringInput) -> Result<SteeringDecision> {
        // Same `sender: text` shape as the coalesced objective, so the
        // duplicate check compares like with like.
        let combined = input
            .pending
            .iter()
            .map(|m| format!("{}: {}", m.sender_name, m.text))
            .collect::<Vec<_>>()
            .join("\n");
        let lowered = combined.to_lowercase();

        if INTERRUPT_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return Ok(SteeringDecision {
                action: SteeringAction::InterruptNow,
                reason: "urgency keyword in new input".into(),
            });
        }

        if generate_content_hash(&combined) == generate_content_hash(&input.current_objective) {
            return Ok(SteeringDecision {
                action: SteeringAction::Ignore,
                reason: "duplicate of current objective".into(),
            });
        }

        Ok(SteeringDecision {
            action: SteeringAction::DoNotInterrupt,
            reason: "new input can wait for the next turn".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::db_id;
    use crate::domains::queue::models::QueueMessageStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(text: &str) -> QueueMessage {
        QueueMessage {
            id: db_id(),
            queue_key: "s:a".into(),
            work_item_id: Uuid::nil(),
            text: text.into(),
            sender_name: "user".into(),
            arrived_at: Utc::now(),
            status: QueueMessageStatus::Pending,
            dispatch_id: None,
            drop_reason: None,
        }
    }

    fn input(objective: &str, pending: Vec<QueueMessage>) -> SteeringInput {
        SteeringInput {
            agent_id: Uuid::nil(),
            agent_handle: "scout".into(),
            current_objective: objective.into(),
            pending: build_steer_messages(&pending),
            active_work: vec![],
        }
    }

    #[test]
    fn signature_changes_with_content() {
        let a = vec![message("one")];
        let b = vec![message("two")];
        assert_ne!(steering_signature(&a), steering_signature(&b));
    }

    #[test]
    fn signature_is_stable_for_same_rows() {
        let pending = vec![message("one"), message("two")];
        assert_eq!(steering_signature(&pending), steering_signature(&pending));
    }

    #[test]
    fn short_circuits_repeat_non_interrupt_polls() {
        let memo = Some(("sig".to_string(), SteeringAction::DoNotInterrupt));
        assert!(should_short_circuit(&memo, "sig"));
    }

    #[test]
    fn does_not_short_circuit_new_signatures() {
        let memo = Some(("sig".to_string(), SteeringAction::DoNotInterrupt));
        assert!(!should_short_circuit(&memo, "other"));
    }

    #[test]
    fn does_not_short_circuit_after_interrupt() {
        let memo = Some(("sig".to_string(), SteeringAction::InterruptNow));
        assert!(!should_short_circuit(&memo, "sig"));
    }

    #[test]
    fn does_not_short_circuit_first_poll() {
        assert!(!should_short_circuit(&None, "sig"));
    }

    #[test]
    fn control_reason_format() {
        let decision = SteeringDecision {
            action: SteeringAction::InterruptNow,
            reason: "supersedes current run".into(),
        };
        assert_eq!(
            format_control_reason(&decision),
            "arbiter:interrupt_now:supersedes current run"
        );
    }

    #[tokio::test]
    async fn heuristic_interrupts_on_urgency() {
        let decision = HeuristicArbiter
            .decide(&input("write the report", vec![message("URGENT: prod is down")]))
            .await
            .unwrap();
        assert_eq!(decision.action, SteeringAction::InterruptNow);
    }

    #[tokio::test]
    async fn heuristic_ignores_duplicates() {
        // Objective carries the coalesced `sender: text` shape.
        let decision = HeuristicArbiter
            .decide(&input("user: write the report", vec![message("Write the report!")]))
            .await
            .unwrap();
        assert_eq!(decision.action, SteeringAction::Ignore);
    }

    #[tokio::test]
    async fn heuristic_defers_unrelated_input() {
        let decision = HeuristicArbiter
            .decide(&input("write the report", vec![message("also book travel")]))
            .await
            .unwrap();
        assert_eq!(decision.action, SteeringAction::DoNotInterrupt);
    }
}
