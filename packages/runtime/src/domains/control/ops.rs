//! Per-run operator actions, addressed by runner job id.
//!
//! These only set the dispatch's control state; the running worker observes
//! it at the next control-directive poll. The lane is paused alongside so
//! no new dispatch claims it mid-transition.

use anyhow::{bail, Result};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::domains::dispatch::models::{ControlState, RunDispatch};
use crate::domains::queue::models::{Lane, LaneState, QueueMessage};

pub async fn pause_run_by_job(job_id: Uuid, reason: Option<&str>, pool: &PgPool) -> Result<()> {
    let dispatch = require_dispatch(job_id, pool).await?;
    RunDispatch::set_control_state(dispatch.id, ControlState::PauseRequested, reason, pool).await?;
    Lane::set_state(&dispatch.queue_key, LaneState::Paused, pool).await?;
    info!(job_id = %job_id, dispatch_id = %dispatch.id, "pause requested");
    Ok(())
}

pub async fn resume_run_by_job(job_id: Uuid, pool: &PgPool) -> Result<()> {
    let dispatch = require_dispatch(job_id, pool).await?;
    RunDispatch::set_control_state(dispatch.id, ControlState::ResumeRequested, None, pool).await?;
    Lane::set_state(&dispatch.queue_key, LaneState::Running, pool).await?;
    info!(job_id = %job_id, dispatch_id = %dispatch.id, "resume requested");
    Ok(())
}

pub async fn cancel_run_by_job(job_id: Uuid, reason: Option<&str>, pool: &PgPool) -> Result<()> {
    let dispatch = require_dispatch(job_id, pool).await?;
    RunDispatch::set_control_state(dispatch.id, ControlState::CancelRequested, reason, pool)
        .await?;
    // Pending steer input was aimed at the run being killed; discard it.
    QueueMessage::cancel_pending(&dispatch.queue_key, "run cancelled", pool).await?;
    info!(job_id = %job_id, dispatch_id = %dispatch.id, "cancel requested");
    Ok(())
}

async fn require_dispatch(job_id: Uuid, pool: &PgPool) -> Result<RunDispatch> {
    match RunDispatch::find_by_job(job_id, pool).await? {
        Some(dispatch) if !dispatch.status.is_terminal() => Ok(dispatch),
        Some(_) => bail!("job {job_id} already finished"),
        None => bail!("no dispatch for job {job_id}"),
    }
}
