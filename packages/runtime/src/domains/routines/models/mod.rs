pub mod routine;
pub mod routine_event;
pub mod routine_run;

pub use routine::{Routine, RoutineTriggerKind};
pub use routine_event::{PublishOutcome, RoutineEvent, RoutineEventStatus};
pub use routine_run::{RecordOutcome, RoutineDecision, RoutineRun};
