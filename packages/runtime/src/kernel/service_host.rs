//! Long-running service host with cooperative shutdown.
//!
//! Every worker in the runtime is a value implementing [`Service`]; the host
//! spawns each one with a shared `CancellationToken` and waits for all of
//! them to drain on shutdown. No worker state lives outside its own task.

use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A long-running background service.
#[async_trait::async_trait]
pub trait Service: Send + 'static {
    fn name(&self) -> &'static str;

    /// Run until the shutdown token fires. Implementations must stop
    /// claiming new work promptly once cancelled and then drain.
    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()>;
}

/// Hosts a set of services and coordinates their shutdown.
pub struct ServiceHost {
    services: Vec<Box<dyn Service>>,
    drain_timeout: Duration,
}

impl Default for ServiceHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceHost {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            drain_timeout: Duration::from_secs(25),
        }
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn add(mut self, service: impl Service) -> Self {
        self.services.push(Box::new(service));
        self
    }

    /// Spawn all services; returns a handle used to stop and drain them.
    pub fn start(self, shutdown: CancellationToken) -> ServiceHostHandle {
        let mut tasks = JoinSet::new();
        for service in self.services {
            let name = service.name();
            let token = shutdown.clone();
            tasks.spawn(async move {
                info!(service = name, "service starting");
                if let Err(e) = service.run(token).await {
                    error!(service = name, error = %e, "service exited with error");
                } else {
                    info!(service = name, "service stopped");
                }
                name
            });
        }
        ServiceHostHandle {
            tasks,
            shutdown,
            drain_timeout: self.drain_timeout,
        }
    }
}

pub struct ServiceHostHandle {
    tasks: JoinSet<&'static str>,
    shutdown: CancellationToken,
    drain_timeout: Duration,
}

impl ServiceHostHandle {
    /// Cancel every service and wait for them to drain, bounded by the
    /// drain timeout.
    pub async fn stop(mut self) {
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => {
                    match joined {
                        Some(_) => continue,
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(
                        remaining = self.tasks.len(),
                        "drain window elapsed, abandoning remaining services"
                    );
                    self.tasks.abort_all();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct TickUntilCancelled {
        stopped: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Service for TickUntilCancelled {
        fn name(&self) -> &'static str {
            "tick"
        }

        async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
            shutdown.cancelled().await;
            self.stopped.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn stop_cancels_and_drains_services() {
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = ServiceHost::new()
            .add(TickUntilCancelled {
                stopped: stopped.clone(),
            })
            .start(CancellationToken::new());

        handle.stop().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    struct NeverStops;

    #[async_trait::async_trait]
    impl Service for NeverStops {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn run(self: Box<Self>, _shutdown: CancellationToken) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn stuck_service_is_abandoned_after_drain_window() {
        let handle = ServiceHost::new()
            .with_drain_timeout(Duration::from_millis(50))
            .add(NeverStops)
            .start(CancellationToken::new());

        // Completes despite the stuck service.
        handle.stop().await;
    }
}
