// Runtime-control plane: processing gate, epoch counter, recovery,
// per-run operator actions.

pub mod models;
pub mod ops;
pub mod recovery;
pub mod worker;

pub use models::{PauseMode, RuntimeControl};
pub use ops::{cancel_run_by_job, pause_run_by_job, resume_run_by_job};
pub use recovery::{
    emergency_stop, force_terminate_all, recover_stale, startup_recovery, RecoveryReport,
    STALE_CUTOFF_SECONDS,
};
pub use worker::RecoveryWorker;
