pub mod job;
pub mod run_dispatch;

pub use job::{Job, JobStatus};
pub use run_dispatch::{ControlState, DispatchStatus, RunDispatch};
