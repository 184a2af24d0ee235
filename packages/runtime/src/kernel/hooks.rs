//! Plugin hooks dispatched at fixed points in the runtime.
//!
//! Hooks may veto (`Block`) or transform (`Replace`) the data at a point.
//! A hook that returns an error is logged and skipped; hook failures are
//! never fatal to the runtime path that fired them.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    WorkItemPreCreate,
    WorkItemPostCreate,
    ResponsePreDeliver,
    ResponsePostDeliver,
}

impl HookPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkItemPreCreate => "work_item.pre_create",
            Self::WorkItemPostCreate => "work_item.post_create",
            Self::ResponsePreDeliver => "response.pre_deliver",
            Self::ResponsePostDeliver => "response.post_deliver",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a single hook wants done with the data at its point.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Proceed,
    Replace(Value),
    Block { reason: String },
}

#[async_trait]
pub trait PluginHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on(&self, point: HookPoint, data: &Value) -> Result<HookOutcome>;
}

/// Aggregate result of dispatching one point across all registered hooks.
#[derive(Debug, Clone)]
pub enum HookDispatch {
    Proceed(Value),
    Blocked { hook: String, reason: String },
}

impl HookDispatch {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: Vec<Arc<dyn PluginHook>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn PluginHook>) {
        self.hooks.push(hook);
    }

    /// Run every hook at `point` over `data` in registration order.
    ///
    /// `Replace` feeds the transformed value to the next hook; the first
    /// `Block` wins and stops the chain; erroring hooks are skipped.
    pub async fn dispatch(&self, point: HookPoint, data: Value) -> HookDispatch {
        let mut current = data;
        for hook in &self.hooks {
            match hook.on(point, &current).await {
                Ok(HookOutcome::Proceed) => {}
                Ok(HookOutcome::Replace(value)) => current = value,
                Ok(HookOutcome::Block { reason }) => {
                    return HookDispatch::Blocked {
                        hook: hook.name().to_string(),
                        reason,
                    };
                }
                Err(e) => {
                    warn!(hook = hook.name(), point = %point, error = %e, "hook failed, skipping");
                }
            }
        }
        HookDispatch::Proceed(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct FixedHook {
        name: &'static str,
        outcome: HookOutcome,
    }

    #[async_trait]
    impl PluginHook for FixedHook {
        fn name(&self) -> &str {
            self.name
        }

        async fn on(&self, _point: HookPoint, _data: &Value) -> Result<HookOutcome> {
            Ok(self.outcome.clone())
        }
    }

    struct FailingHook;

    #[async_trait]
    impl PluginHook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }

        async fn on(&self, _point: HookPoint, _data: &Value) -> Result<HookOutcome> {
            anyhow::bail!("boom")
        }
    }

    #[tokio::test]
    async fn empty_registry_proceeds_with_original_data() {
        let registry = HookRegistry::new();
        let result = registry
            .dispatch(HookPoint::ResponsePreDeliver, json!({"content": "hi"}))
            .await;
        match result {
            HookDispatch::Proceed(value) => assert_eq!(value["content"], "hi"),
            HookDispatch::Blocked { .. } => panic!("should not block"),
        }
    }

    #[tokio::test]
    async fn first_block_wins() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(FixedHook {
            name: "censor",
            outcome: HookOutcome::Block {
                reason: "policy".into(),
            },
        }));
        registry.register(Arc::new(FixedHook {
            name: "later",
            outcome: HookOutcome::Proceed,
        }));
        let result = registry
            .dispatch(HookPoint::ResponsePreDeliver, json!({}))
            .await;
        match result {
            HookDispatch::Blocked { hook, reason } => {
                assert_eq!(hook, "censor");
                assert_eq!(reason, "policy");
            }
            HookDispatch::Proceed(_) => panic!("should block"),
        }
    }

    #[tokio::test]
    async fn replace_chains_through_hooks() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(FixedHook {
            name: "rewrite",
            outcome: HookOutcome::Replace(json!({"content": "rewritten"})),
        }));
        let result = registry
            .dispatch(HookPoint::ResponsePreDeliver, json!({"content": "orig"}))
            .await;
        match result {
            HookDispatch::Proceed(value) => assert_eq!(value["content"], "rewritten"),
            HookDispatch::Blocked { .. } => panic!("should not block"),
        }
    }

    #[tokio::test]
    async fn erroring_hook_is_skipped() {
        let mut registry = HookRegistry::new();
        registry.register(Arc::new(FailingHook));
        registry.register(Arc::new(FixedHook {
            name: "after",
            outcome: HookOutcome::Replace(json!({"ok": true})),
        }));
        let result = registry
            .dispatch(HookPoint::WorkItemPreCreate, json!({}))
            .await;
        match result {
            HookDispatch::Proceed(value) => assert_eq!(value["ok"], true),
            HookDispatch::Blocked { .. } => panic!("errors must not block"),
        }
    }
}
