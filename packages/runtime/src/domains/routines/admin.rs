//! Routine creation with upfront validation.
//!
//! Cron expressions (cadence floor included) and rules are rejected at
//! submission time so the scheduler never has to babysit a routine that
//! could not possibly run.

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use thiserror::Error;
use uuid::Uuid;

use super::cron::{next_fire_after, validate_cron, CronError};
use super::models::{Routine, RoutineTriggerKind};
use super::rules::{parse_rule, RuleError, RuleScope};

#[derive(Debug, Error)]
pub enum RoutineValidationError {
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error(transparent)]
    Rule(#[from] RuleError),
    #[error("cron routines require a cron expression")]
    MissingCron,
    #[error("condition routines require a probe and a rule")]
    MissingCondition,
    #[error("event routines require a rule")]
    MissingEventRule,
}

#[derive(Debug, Clone)]
pub struct CreateRoutineParams {
    pub agent_id: Uuid,
    pub name: String,
    pub trigger_kind: RoutineTriggerKind,
    pub cron_expr: Option<String>,
    pub timezone: String,
    pub condition_probe: Option<String>,
    pub condition_config: Option<serde_json::Value>,
    pub rule_json: Option<serde_json::Value>,
}

/// Validate the trigger shape without touching the database.
pub fn validate_routine(params: &CreateRoutineParams) -> Result<(), RoutineValidationError> {
    match params.trigger_kind {
        RoutineTriggerKind::Cron => {
            let expr = params
                .cron_expr
                .as_deref()
                .ok_or(RoutineValidationError::MissingCron)?;
            validate_cron(expr, &params.timezone)?;
        }
        RoutineTriggerKind::Condition => {
            if params.condition_probe.is_none() || params.rule_json.is_none() {
                return Err(RoutineValidationError::MissingCondition);
            }
            parse_rule(params.rule_json.as_ref().unwrap(), RuleScope::Probe)?;
            // A cron cadence on a condition routine is optional but must
            // still be valid when present.
            if let Some(expr) = params.cron_expr.as_deref() {
                validate_cron(expr, &params.timezone)?;
            }
        }
        RoutineTriggerKind::Event => {
            let rule = params
                .rule_json
                .as_ref()
                .ok_or(RoutineValidationError::MissingEventRule)?;
            parse_rule(rule, RuleScope::Envelope)?;
        }
        RoutineTriggerKind::Oneshot => {}
    }
    Ok(())
}

/// Validate and persist a routine with its initial `next_run_at`.
pub async fn create_routine(
    params: CreateRoutineParams,
    pool: &PgPool,
) -> Result<Routine, anyhow::Error> {
    validate_routine(&params)?;

    let next_run_at = match (params.trigger_kind, params.cron_expr.as_deref()) {
        (RoutineTriggerKind::Cron, Some(expr)) => {
            next_fire_after(expr, &params.timezone, Utc::now())?
        }
        (RoutineTriggerKind::Cron, None) => None,
        (RoutineTriggerKind::Condition | RoutineTriggerKind::Oneshot, _) => Some(Utc::now()),
        (RoutineTriggerKind::Event, _) => None,
    };

    Routine::create(
        params.agent_id,
        &params.name,
        params.trigger_kind,
        params.cron_expr.as_deref(),
        &params.timezone,
        params.condition_probe.as_deref(),
        params.condition_config,
        params.rule_json,
        next_run_at,
        pool,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cron_params(expr: &str) -> CreateRoutineParams {
        CreateRoutineParams {
            agent_id: Uuid::new_v4(),
            name: "standup reminder".into(),
            trigger_kind: RoutineTriggerKind::Cron,
            cron_expr: Some(expr.into()),
            timezone: "UTC".into(),
            condition_probe: None,
            condition_config: None,
            rule_json: None,
        }
    }

    #[test]
    fn every_minute_cron_is_rejected_at_submission() {
        let err = validate_routine(&cron_params("* * * * *")).unwrap_err();
        assert!(err
            .to_string()
            .contains("must not run more than once every 5 minutes"));
    }

    #[test]
    fn five_minute_cron_is_accepted() {
        validate_routine(&cron_params("*/5 * * * *")).unwrap();
    }

    #[test]
    fn condition_routine_requires_probe_and_rule() {
        let mut params = cron_params("*/5 * * * *");
        params.trigger_kind = RoutineTriggerKind::Condition;
        params.cron_expr = None;
        let err = validate_routine(&params).unwrap_err();
        assert!(matches!(err, RoutineValidationError::MissingCondition));
    }

    #[test]
    fn event_rule_must_use_envelope_fields() {
        let mut params = cron_params("*/5 * * * *");
        params.trigger_kind = RoutineTriggerKind::Event;
        params.cron_expr = None;
        params.rule_json = Some(json!({"field": "ci.failure_rate", "op": "gt", "value": 0.5}));
        let err = validate_routine(&params).unwrap_err();
        assert!(matches!(
            err,
            RoutineValidationError::Rule(RuleError::FieldNotAllowed(_))
        ));
    }

    #[test]
    fn oneshot_needs_no_trigger_config() {
        let mut params = cron_params("*/5 * * * *");
        params.trigger_kind = RoutineTriggerKind::Oneshot;
        params.cron_expr = None;
        validate_routine(&params).unwrap();
    }
}
