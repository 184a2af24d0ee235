// RuntimeKernel - core infrastructure with all dependencies
//
// The RuntimeKernel holds everything the workers need (database pool,
// collaborator trait objects, registries) and is shared behind an Arc.
// Kernel is for INFRASTRUCTURE only; domain logic lives in domains/*.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;

use super::hooks::HookRegistry;
use super::traits::{AgentRunner, ChannelHandler, Probe, SteeringArbiter};
use crate::common::SecretCipher;
use crate::config::Config;

/// Channel handlers keyed by plugin type (`telegram`, `slack`, `webhook`, ...).
#[derive(Default)]
pub struct ChannelRegistry {
    handlers: HashMap<String, Arc<dyn ChannelHandler>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_type: &str, handler: Arc<dyn ChannelHandler>) {
        self.handlers.insert(plugin_type.to_string(), handler);
    }

    pub fn get(&self, plugin_type: &str) -> Option<Arc<dyn ChannelHandler>> {
        self.handlers.get(plugin_type).cloned()
    }
}

/// Condition probes keyed by name.
#[derive(Default)]
pub struct ProbeRegistry {
    probes: HashMap<&'static str, Arc<dyn Probe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, probe: Arc<dyn Probe>) {
        self.probes.insert(probe.name(), probe);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(name).cloned()
    }
}

/// RuntimeKernel holds all runtime dependencies
pub struct RuntimeKernel {
    pub db_pool: PgPool,
    pub config: Config,
    pub cipher: SecretCipher,
    pub runner: Arc<dyn AgentRunner>,
    pub channels: ChannelRegistry,
    pub hooks: HookRegistry,
    pub probes: ProbeRegistry,
    pub arbiter: Arc<dyn SteeringArbiter>,
}

impl RuntimeKernel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db_pool: PgPool,
        config: Config,
        cipher: SecretCipher,
        runner: Arc<dyn AgentRunner>,
        channels: ChannelRegistry,
        hooks: HookRegistry,
        probes: ProbeRegistry,
        arbiter: Arc<dyn SteeringArbiter>,
    ) -> Self {
        Self {
            db_pool,
            config,
            cipher,
            runner,
            channels,
            hooks,
            probes,
            arbiter,
        }
    }
}
