//! Routine event worker: fans queued event envelopes out to matching
//! event-triggered routines.
//!
//! Events produced by routine firings are never fanned back into routines;
//! that recursion is blocked with an explicit skipped receipt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::models::{Routine, RoutineDecision, RoutineEvent, RoutineRun};
use super::rules::{evaluate, parse_rule, RuleScope};
use super::scheduler::fire_routine;
use crate::common::{is_schema_drift, warn_schema_drift_once};
use crate::domains::control::models::RuntimeControl;
use crate::kernel::{RuntimeKernel, Service};

const BUSY_POLL: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct RoutineEventWorker {
    kernel: Arc<RuntimeKernel>,
}

impl RoutineEventWorker {
    pub fn new(kernel: Arc<RuntimeKernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl Service for RoutineEventWorker {
    fn name(&self) -> &'static str {
        "routine-event-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("routine event worker starting");
        let mut poll = IDLE_POLL;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            let control = match RuntimeControl::get(&self.kernel.db_pool).await {
                Ok(control) => control,
                Err(e) => {
                    if is_schema_drift(&e) {
                        warn_schema_drift_once(&e);
                        return Ok(());
                    }
                    error!(error = %e, "failed to read runtime control");
                    poll = IDLE_POLL;
                    continue;
                }
            };
            if !control.processing_enabled {
                poll = IDLE_POLL;
                continue;
            }

            match RoutineEvent::next_queued(&self.kernel.db_pool).await {
                Ok(Some(event)) => {
                    if let Err(e) = fan_out_event(&self.kernel, &event).await {
                        error!(event_id = %event.id, error = %e, "event fan-out failed");
                        poll = IDLE_POLL;
                        continue;
                    }
                    poll = BUSY_POLL;
                }
                Ok(None) => poll = IDLE_POLL,
                Err(e) => {
                    error!(error = %e, "failed to read event queue");
                    poll = IDLE_POLL;
                }
            }
        }

        info!("routine event worker stopped");
        Ok(())
    }
}

pub async fn fan_out_event(kernel: &RuntimeKernel, event: &RoutineEvent) -> Result<()> {
    let routines = Routine::find_event_routines(&kernel.db_pool).await?;
    let envelope = event.envelope_value();
    let trigger_ref = format!("event:{}", event.id);

    for routine in routines {
        if RoutineRun::exists(routine.id, &trigger_ref, &kernel.db_pool).await? {
            continue;
        }

        if event.source == "routine" {
            RoutineRun::record(
                routine.id,
                "event",
                &trigger_ref,
                Some(envelope.clone()),
                RoutineDecision::Skipped,
                Some("recursion blocked"),
                None,
                &kernel.db_pool,
            )
            .await?;
            continue;
        }

        let matched = match routine.rule_json.as_ref() {
            Some(rule_value) => match parse_rule(rule_value, RuleScope::Envelope) {
                Ok(rule) => evaluate(&rule, &envelope),
                Err(e) => {
                    RoutineRun::record(
                        routine.id,
                        "event",
                        &trigger_ref,
                        Some(envelope.clone()),
                        RoutineDecision::Error,
                        Some(&format!("invalid rule: {e}")),
                        None,
                        &kernel.db_pool,
                    )
                    .await?;
                    continue;
                }
            },
            None => true,
        };

        if matched {
            fire_routine(kernel, &routine, "event", &trigger_ref, Some(envelope.clone()), None)
                .await?;
        } else {
            RoutineRun::record(
                routine.id,
                "event",
                &trigger_ref,
                Some(envelope.clone()),
                RoutineDecision::Skipped,
                Some("rule did not match"),
                None,
                &kernel.db_pool,
            )
            .await?;
        }
    }

    RoutineEvent::mark_processed(event.id, &kernel.db_pool).await?;
    debug!(event_id = %event.id, "event processed");
    Ok(())
}
