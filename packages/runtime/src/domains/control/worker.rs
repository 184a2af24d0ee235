//! Periodic recovery service.

use std::time::Duration;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::recovery::{recover_stale, STALE_CUTOFF_SECONDS};
use crate::kernel::Service;

pub struct RecoveryWorker {
    pool: PgPool,
    interval: Duration,
}

impl RecoveryWorker {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            interval: Duration::from_secs(60),
        }
    }

    pub fn with_interval(pool: PgPool, interval: Duration) -> Self {
        Self { pool, interval }
    }
}

#[async_trait::async_trait]
impl Service for RecoveryWorker {
    fn name(&self) -> &'static str {
        "recovery-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }

            // Same pass as startup, but without the epoch bump.
            if let Err(e) = recover_stale(STALE_CUTOFF_SECONDS, &self.pool).await {
                error!(error = %e, "periodic recovery failed");
            }
        }
        Ok(())
    }
}
