//! Crash recovery and forced termination.
//!
//! Startup runs a stale-only pass and bumps the control epoch so every
//! pre-crash holder is preempted. The periodic pass (60 s) is identical but
//! leaves the epoch alone. Emergency stop terminates everything active.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{PauseMode, RuntimeControl};
use crate::domains::dispatch::models::{Job, RunDispatch};
use crate::domains::outbox::models::EffectOutbox;

/// Staleness cutoff applied by startup and periodic recovery.
pub const STALE_CUTOFF_SECONDS: i64 = 180;

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryReport {
    pub dispatches_terminated: u64,
    pub effects_marked_unknown: u64,
    pub jobs_reaped: u64,
    pub lanes_reset: u64,
}

/// Abandon every non-terminal dispatch, cancel its job, mark in-flight
/// sends ambiguous, and reset running lanes. Used by emergency stop.
pub async fn force_terminate_all(reason: &str, pool: &PgPool) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let mut tx = pool.begin().await?;

    let terminated = sqlx::query_as::<_, (Uuid, String)>(
        r#"
        UPDATE run_dispatches
        SET status = 'abandoned',
            claimed_epoch = claimed_epoch + 1,
            claimed_by = NULL,
            lease_expires_at = NULL,
            control_state = 'normal',
            error = COALESCE(error, $1),
            updated_at = NOW()
        WHERE status IN ('queued', 'running', 'paused')
        RETURNING id, queue_key
        "#,
    )
    .bind(reason)
    .fetch_all(&mut *tx)
    .await?;
    report.dispatches_terminated = terminated.len() as u64;

    let lanes_reset = sqlx::query(
        r#"
        UPDATE queue_lanes
        SET state = 'queued', active_dispatch_id = NULL, updated_at = NOW()
        WHERE state IN ('running', 'paused')
        "#,
    )
    .execute(&mut *tx)
    .await?;
    report.lanes_reset = lanes_reset.rows_affected();

    tx.commit().await?;

    let dispatch_ids: Vec<Uuid> = terminated.iter().map(|(id, _)| *id).collect();
    if !dispatch_ids.is_empty() {
        report.jobs_reaped = Job::cancel_for_dispatches(&dispatch_ids, pool).await?;
    }
    report.effects_marked_unknown = EffectOutbox::mark_sending_unknown(reason, pool).await?;

    warn!(
        dispatches = report.dispatches_terminated,
        effects = report.effects_marked_unknown,
        jobs = report.jobs_reaped,
        lanes = report.lanes_reset,
        reason,
        "forced termination of active runtime"
    );
    Ok(report)
}

/// Reap expired leases, zombie jobs, and stale in-flight sends.
pub async fn recover_stale(cutoff_seconds: i64, pool: &PgPool) -> Result<RecoveryReport> {
    let mut report = RecoveryReport::default();
    report.dispatches_terminated = RunDispatch::reap_expired(pool).await?;
    report.jobs_reaped = Job::reap_zombies(cutoff_seconds, pool).await?;
    report.effects_marked_unknown =
        EffectOutbox::mark_stale_sending_unknown(cutoff_seconds, pool).await?;

    if report.dispatches_terminated > 0 || report.jobs_reaped > 0 || report.effects_marked_unknown > 0
    {
        info!(
            dispatches = report.dispatches_terminated,
            jobs = report.jobs_reaped,
            effects = report.effects_marked_unknown,
            "recovered stale runtime state"
        );
    }
    Ok(report)
}

/// Startup pass: stale-only recovery, then an epoch bump that invalidates
/// any holder that survived the crash.
pub async fn startup_recovery(pool: &PgPool) -> Result<RecoveryReport> {
    let report = recover_stale(STALE_CUTOFF_SECONDS, pool).await?;
    let epoch = RuntimeControl::bump_epoch(pool).await?;
    info!(control_epoch = epoch, "startup recovery complete");
    Ok(report)
}

/// Emergency stop: hard pause, then terminate everything active and bump
/// the epoch so no in-flight worker can finalize anything.
pub async fn emergency_stop(pool: &PgPool) -> Result<RecoveryReport> {
    RuntimeControl::set_processing(false, PauseMode::Hard, pool).await?;
    let report = force_terminate_all("emergency stop", pool).await?;
    let epoch = RuntimeControl::bump_epoch(pool).await?;
    warn!(control_epoch = epoch, "emergency stop engaged");
    Ok(report)
}
