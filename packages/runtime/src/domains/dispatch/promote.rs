//! Promotion of due lanes into dispatches.
//!
//! Runs at the head of every dispatch-worker tick: each lane whose debounce
//! elapsed and which holds pending messages gets one queued dispatch with
//! the pending texts coalesced in arrival order. An unclaimed queued
//! dispatch already on the lane is folded in and marked `merged`.

use anyhow::Result;
use sqlx::PgPool;
use tracing::{debug, warn};

use super::models::RunDispatch;
use crate::domains::queue::models::{build_coalesced_text, Lane, QueueMessage};

const PROMOTE_BATCH: i64 = 20;

pub async fn promote_due_lanes(pool: &PgPool) -> Result<usize> {
    let lanes = Lane::find_due(PROMOTE_BATCH, pool).await?;
    let mut promoted = 0;
    for lane in lanes {
        match promote_lane(&lane, pool).await {
            Ok(true) => promoted += 1,
            Ok(false) => {}
            Err(e) => warn!(queue_key = %lane.queue_key, error = %e, "lane promotion failed"),
        }
    }
    Ok(promoted)
}

/// Coalesce one lane's pending messages into a queued dispatch.
///
/// Returns false when another promoter won the lane or nothing was pending.
async fn promote_lane(lane: &Lane, pool: &PgPool) -> Result<bool> {
    let mut tx = pool.begin().await?;

    // Re-check under lock; a concurrent claim may have flipped the lane.
    let locked = sqlx::query_as::<_, Lane>(
        r#"
        SELECT * FROM queue_lanes
        WHERE queue_key = $1 AND state = 'queued' AND debounce_until <= NOW()
        FOR UPDATE SKIP LOCKED
        "#,
    )
    .bind(&lane.queue_key)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(lane) = locked else {
        tx.rollback().await?;
        return Ok(false);
    };

    let mut pending = QueueMessage::lock_pending(&lane.queue_key, &mut *tx).await?;
    if pending.is_empty() {
        tx.rollback().await?;
        return Ok(false);
    }

    // Oldest surplus over max_queued is dropped, newest messages win.
    let max_queued = lane.max_queued.max(1) as usize;
    if pending.len() > max_queued {
        let surplus: Vec<_> = pending
            .drain(..pending.len() - max_queued)
            .map(|m| m.id)
            .collect();
        QueueMessage::mark_dropped(&surplus, "max_queued exceeded", &mut *tx).await?;
        warn!(
            queue_key = %lane.queue_key,
            dropped = surplus.len(),
            "dropped surplus queue messages"
        );
    }

    let merge_candidate = RunDispatch::find_queued_for_lane(&lane.queue_key, &mut *tx).await?;

    let mut coalesced_text = build_coalesced_text(&pending);
    if let Some(previous) = merge_candidate
        .as_ref()
        .and_then(|d| d.coalesced_text.as_deref())
    {
        coalesced_text = format!("{previous}\n\n{coalesced_text}");
    }

    let Some(last) = pending.last() else {
        tx.rollback().await?;
        return Ok(false);
    };
    let run_key = format!("{}:{}", lane.queue_key, last.id);

    let Some(dispatch) = RunDispatch::create_queued(
        &run_key,
        &lane.queue_key,
        last.work_item_id,
        lane.agent_id,
        Some(&last.text),
        &coalesced_text,
        None,
        &mut *tx,
    )
    .await?
    else {
        // run_key collision: someone else promoted this exact batch.
        tx.rollback().await?;
        return Ok(false);
    };

    if let Some(old) = merge_candidate {
        RunDispatch::mark_merged(old.id, &mut *tx).await?;
        QueueMessage::reassign_dispatch(old.id, dispatch.id, &mut *tx).await?;
        debug!(old = %old.id, new = %dispatch.id, "merged queued dispatch");
    }

    let included: Vec<_> = pending.iter().map(|m| m.id).collect();
    QueueMessage::mark_included(&included, dispatch.id, &mut *tx).await?;

    tx.commit().await?;
    debug!(
        queue_key = %lane.queue_key,
        dispatch_id = %dispatch.id,
        messages = included.len(),
        "lane promoted to dispatch"
    );
    Ok(true)
}
