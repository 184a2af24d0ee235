//! Effect-outbox delivery worker.
//!
//! Claims one pending effect at a time, routes it through the channel
//! handler, and records the tri-state outcome. A thrown delivery maps to
//! `unknown`: the send may have happened, so it is never retried.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::models::{EffectOutbox, EffectPayload};
use super::relay::{enqueue_agent_relay, RelayOutcome};
use crate::common::{is_schema_drift, warn_schema_drift_once};
use crate::domains::control::models::RuntimeControl;
use crate::domains::plugins::models::PluginInstance;
use crate::kernel::{
    DeliveryOutcome, HookDispatch, HookPoint, PostResponseOptions, RuntimeKernel, Service,
};

const BUSY_POLL: Duration = Duration::from_millis(100);
const IDLE_POLL: Duration = Duration::from_secs(1);

pub struct EffectOutboxWorker {
    kernel: Arc<RuntimeKernel>,
}

impl EffectOutboxWorker {
    pub fn new(kernel: Arc<RuntimeKernel>) -> Self {
        Self { kernel }
    }
}

#[async_trait::async_trait]
impl Service for EffectOutboxWorker {
    fn name(&self) -> &'static str {
        "effect-outbox-worker"
    }

    async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
        info!("effect-outbox worker starting");
        let mut poll = IDLE_POLL;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            let control = match RuntimeControl::get(&self.kernel.db_pool).await {
                Ok(control) => control,
                Err(e) => {
                    if is_schema_drift(&e) {
                        warn_schema_drift_once(&e);
                        return Ok(());
                    }
                    error!(error = %e, "failed to read runtime control");
                    poll = IDLE_POLL;
                    continue;
                }
            };
            if !control.processing_enabled {
                poll = IDLE_POLL;
                continue;
            }

            // One effect per tick; drain fast while there is work.
            match EffectOutbox::claim_next(&self.kernel.db_pool).await {
                Ok(Some(effect)) => {
                    if let Err(e) = deliver_effect(&self.kernel, &effect).await {
                        error!(effect_id = %effect.id, error = %e, "effect delivery pass failed");
                    }
                    poll = BUSY_POLL;
                }
                Ok(None) => poll = IDLE_POLL,
                Err(e) => {
                    error!(error = %e, "failed to claim effect");
                    poll = IDLE_POLL;
                }
            }
        }

        info!("effect-outbox worker stopped");
        Ok(())
    }
}

/// Deliver one claimed effect and record its outcome.
pub async fn deliver_effect(kernel: &RuntimeKernel, effect: &EffectOutbox) -> Result<()> {
    let pool = &kernel.db_pool;
    let epoch = effect.claimed_epoch;

    let mut payload = match effect.parsed_payload() {
        Ok(payload) => payload,
        Err(e) => {
            EffectOutbox::mark_failed(
                effect.id,
                &format!("invalid payload: {e}"),
                false,
                effect.attempt_count,
                epoch,
                pool,
            )
            .await?;
            return Ok(());
        }
    };

    // In-app effects have no channel adapter; the transcript row written at
    // finalize already is the delivery.
    let Some(instance_id) = effect.plugin_instance_id else {
        EffectOutbox::mark_sent(effect.id, None, epoch, pool).await?;
        return Ok(());
    };

    let instance = match PluginInstance::find_by_id(instance_id, pool).await {
        Ok(instance) => instance,
        Err(e) => {
            EffectOutbox::mark_failed(
                effect.id,
                &format!("plugin instance missing: {e}"),
                false,
                effect.attempt_count,
                epoch,
                pool,
            )
            .await?;
            return Ok(());
        }
    };

    let Some(handler) = kernel.channels.get(&instance.plugin_type) else {
        EffectOutbox::mark_failed(
            effect.id,
            &format!("no channel handler for plugin type '{}'", instance.plugin_type),
            false,
            effect.attempt_count,
            epoch,
            pool,
        )
        .await?;
        return Ok(());
    };

    match kernel
        .hooks
        .dispatch(
            HookPoint::ResponsePreDeliver,
            json!({
                "effect_id": effect.id,
                "channel": effect.channel,
                "kind": effect.kind,
                "content": payload.content,
            }),
        )
        .await
    {
        HookDispatch::Blocked { hook, reason } => {
            EffectOutbox::mark_failed(
                effect.id,
                &format!("blocked by hook {hook}: {reason}"),
                false,
                effect.attempt_count,
                epoch,
                pool,
            )
            .await?;
            return Ok(());
        }
        HookDispatch::Proceed(value) => {
            if let Some(content) = value.get("content").and_then(|c| c.as_str()) {
                payload.content = content.to_string();
            }
        }
    }

    // Best-effort read receipt; never affects the outcome.
    if let Err(e) = handler
        .acknowledge_receipt(&instance, &payload.response_context)
        .await
    {
        debug!(effect_id = %effect.id, error = %e, "acknowledge_receipt failed");
    }

    let options = PostResponseOptions {
        hit_limit: payload.hit_limit,
        idempotency_key: Some(effect.effect_key.clone()),
    };
    let delivery = handler
        .post_response(
            &instance,
            effect.work_item_id,
            &payload.content,
            &payload.response_context,
            &options,
        )
        .await;

    let sent = match delivery {
        Ok(DeliveryOutcome::Sent { provider_ref }) => {
            EffectOutbox::mark_sent(effect.id, provider_ref.as_deref(), epoch, pool).await?;
            debug!(effect_id = %effect.id, "effect delivered");
            true
        }
        Ok(DeliveryOutcome::Failed { retryable, error }) => {
            EffectOutbox::mark_failed(effect.id, &error, retryable, effect.attempt_count, epoch, pool)
                .await?;
            warn!(effect_id = %effect.id, retryable, error = %error, "effect delivery failed");
            false
        }
        Ok(DeliveryOutcome::Unknown { error }) => {
            EffectOutbox::mark_unknown(effect.id, &error, epoch, pool).await?;
            warn!(effect_id = %effect.id, error = %error, "effect delivery ambiguous");
            false
        }
        Err(e) => {
            // The transport threw after the send may have gone out.
            let error = format!("{e:#}");
            EffectOutbox::mark_unknown(effect.id, &error, epoch, pool).await?;
            warn!(effect_id = %effect.id, error = %error, "effect delivery threw, outcome unknown");
            false
        }
    };

    kernel
        .hooks
        .dispatch(
            HookPoint::ResponsePostDeliver,
            json!({
                "effect_id": effect.id,
                "channel": effect.channel,
                "sent": sent,
            }),
        )
        .await;

    if sent && effect.kind == "assistant_final_response" {
        relay_if_applicable(kernel, effect, &payload).await;
    }

    Ok(())
}

async fn relay_if_applicable(kernel: &RuntimeKernel, effect: &EffectOutbox, payload: &EffectPayload) {
    match enqueue_agent_relay(kernel, effect, payload).await {
        Ok(RelayOutcome::Enqueued { targets, .. }) => {
            debug!(effect_id = %effect.id, targets, "relayed agent response");
        }
        Ok(_) => {}
        Err(e) => warn!(effect_id = %effect.id, error = %e, "agent relay failed"),
    }
}
