use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// 32-byte hex key for secret columns (plugin-instance settings).
    pub encryption_key: String,
    /// Shared secret for the operator HTTP surface.
    pub auth_secret: String,
    /// Base URL used when generating webhook URLs for plugin instances.
    pub app_base_url: String,
    pub max_concurrent_dispatches: i32,
    pub dispatch_lease_seconds: i64,
    /// Debounce applied when neither the agent nor the instance sets one.
    pub default_debounce_ms: i64,
    /// Inline @mention handoffs stay off until actor-envelope routing is
    /// hardened; the outbox relay path is the supported agent-to-agent hop.
    pub enable_agent_mention_handoffs: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            encryption_key: env::var("ENCRYPTION_KEY").context("ENCRYPTION_KEY must be set")?,
            auth_secret: env::var("AUTH_SECRET").context("AUTH_SECRET must be set")?,
            app_base_url: env::var("APP_BASE_URL").context("APP_BASE_URL must be set")?,
            max_concurrent_dispatches: env::var("MAX_CONCURRENT_DISPATCHES")
                .unwrap_or_else(|_| "8".to_string())
                .parse()
                .context("MAX_CONCURRENT_DISPATCHES must be a valid number")?,
            dispatch_lease_seconds: env::var("DISPATCH_LEASE_SECONDS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()
                .context("DISPATCH_LEASE_SECONDS must be a valid number")?,
            default_debounce_ms: env::var("DEFAULT_DEBOUNCE_MS")
                .unwrap_or_else(|_| "15000".to_string())
                .parse()
                .context("DEFAULT_DEBOUNCE_MS must be a valid number")?,
            enable_agent_mention_handoffs: env::var("ENABLE_AGENT_MENTION_HANDOFFS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}
