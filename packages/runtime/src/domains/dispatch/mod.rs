// Dispatch domain: the dispatch table, lane promotion, the run worker, and
// steering.

pub mod control;
pub mod models;
pub mod promote;
pub mod steering;
pub mod worker;

pub use control::DispatchControlHandle;
pub use models::{ControlState, DispatchStatus, Job, JobStatus, RunDispatch};
pub use promote::promote_due_lanes;
pub use steering::HeuristicArbiter;
pub use worker::{RunDispatchWorker, RunDispatchWorkerConfig};
