//! Runtime control singleton.
//!
//! `control_epoch` is the global preemption counter: forced termination
//! bumps it (and each affected row's epoch), so any worker still holding a
//! pre-bump epoch finds all of its transitional writes turned into no-ops.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "pause_mode", rename_all = "snake_case")]
pub enum PauseMode {
    Soft,
    Hard,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RuntimeControl {
    pub id: i32,
    pub processing_enabled: bool,
    pub pause_mode: PauseMode,
    pub control_epoch: i64,
    pub max_concurrent_dispatches: i32,
    pub updated_at: DateTime<Utc>,
}

impl RuntimeControl {
    pub async fn get(pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM runtime_control WHERE id = 1")
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn set_processing(enabled: bool, mode: PauseMode, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE runtime_control
            SET processing_enabled = $1, pause_mode = $2, updated_at = NOW()
            WHERE id = 1
            RETURNING *
            "#,
        )
        .bind(enabled)
        .bind(mode)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    /// Monotone bump; returns the new epoch.
    pub async fn bump_epoch(pool: &PgPool) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE runtime_control
            SET control_epoch = control_epoch + 1, updated_at = NOW()
            WHERE id = 1
            RETURNING control_epoch
            "#,
        )
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn set_max_concurrent(max: i32, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            UPDATE runtime_control
            SET max_concurrent_dispatches = $1, updated_at = NOW()
            WHERE id = 1
            RETURNING *
            "#,
        )
        .bind(max)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }
}
