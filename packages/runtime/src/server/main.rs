// Main entry point for the agent runtime daemon

use std::sync::Arc;

use anyhow::{Context, Result};
use runtime_core::common::SecretCipher;
use runtime_core::domains::control::startup_recovery;
use runtime_core::domains::control::RecoveryWorker;
use runtime_core::domains::dispatch::{HeuristicArbiter, RunDispatchWorker};
use runtime_core::domains::outbox::EffectOutboxWorker;
use runtime_core::domains::plugins::WebhookChannelHandler;
use runtime_core::domains::routines::{
    CiFailureRate, GithubDependencyAlerts, GithubStalePrs, RoutineEventWorker,
    RoutineSchedulerWorker,
};
use runtime_core::kernel::{
    ChannelRegistry, EchoAgentRunner, HookRegistry, ProbeRegistry, RuntimeKernel, ServiceHost,
};
use runtime_core::server::build_app;
use runtime_core::Config;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,runtime_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting agent runtime");

    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!("Configuration loaded");

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Database connected");

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;
    tracing::info!("Migrations complete");

    let cipher =
        SecretCipher::from_hex(&config.encryption_key).context("Invalid ENCRYPTION_KEY")?;

    let mut channels = ChannelRegistry::new();
    channels.register("webhook", Arc::new(WebhookChannelHandler::new(cipher.clone())));

    let mut probes = ProbeRegistry::new();
    probes.register(Arc::new(GithubStalePrs::new()));
    probes.register(Arc::new(GithubDependencyAlerts::new()));
    probes.register(Arc::new(CiFailureRate::new()));

    let kernel = Arc::new(RuntimeKernel::new(
        pool.clone(),
        config.clone(),
        cipher,
        Arc::new(EchoAgentRunner),
        channels,
        HookRegistry::new(),
        probes,
        Arc::new(HeuristicArbiter),
    ));

    // Reap anything a previous process left behind before claiming new work.
    let report = startup_recovery(&pool)
        .await
        .context("Startup recovery failed")?;
    tracing::info!(
        dispatches = report.dispatches_terminated,
        jobs = report.jobs_reaped,
        "startup recovery finished"
    );

    let shutdown = CancellationToken::new();
    let services = ServiceHost::new()
        .add(RunDispatchWorker::new(kernel.clone()))
        .add(EffectOutboxWorker::new(kernel.clone()))
        .add(RoutineSchedulerWorker::new(kernel.clone()))
        .add(RoutineEventWorker::new(kernel.clone()))
        .add(RecoveryWorker::new(pool.clone()))
        .start(shutdown.clone());

    let app = build_app(kernel);
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Stop claiming new work, then drain in-flight runs.
    services.stop().await;
    tracing::info!("Agent runtime stopped");

    Ok(())
}
