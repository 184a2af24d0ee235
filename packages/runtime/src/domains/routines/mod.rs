// Routines domain: time/condition/event triggers, the rule language,
// probes, and the scheduler + event workers.

pub mod admin;
pub mod cron;
pub mod events_worker;
pub mod models;
pub mod probes;
pub mod rules;
pub mod scheduler;

pub use admin::{create_routine, validate_routine, CreateRoutineParams, RoutineValidationError};
pub use cron::{next_fire_after, validate_cron, CronError, MIN_RECURRENCE_SECONDS};
pub use events_worker::RoutineEventWorker;
pub use models::{Routine, RoutineDecision, RoutineEvent, RoutineRun, RoutineTriggerKind};
pub use probes::{CiFailureRate, GithubDependencyAlerts, GithubStalePrs};
pub use rules::{evaluate, parse_rule, Rule, RuleError, RuleOp, RuleScope};
pub use scheduler::RoutineSchedulerWorker;
