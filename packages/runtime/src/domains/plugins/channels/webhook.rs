//! Webhook channel handler: delivers responses by POSTing JSON to the URL
//! configured on the plugin instance.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::common::SecretCipher;
use crate::domains::plugins::models::PluginInstance;
use crate::kernel::{ChannelHandler, DeliveryOutcome, PostResponseOptions, ResponseMode};

#[derive(Debug, Deserialize)]
struct WebhookSettings {
    url: String,
    #[serde(default)]
    secret: Option<String>,
}

pub struct WebhookChannelHandler {
    client: reqwest::Client,
    cipher: SecretCipher,
}

impl WebhookChannelHandler {
    pub fn new(cipher: SecretCipher) -> Self {
        Self {
            client: reqwest::Client::new(),
            cipher,
        }
    }

    fn settings(&self, instance: &PluginInstance) -> Result<WebhookSettings> {
        let raw = instance
            .settings(&self.cipher)?
            .ok_or_else(|| anyhow!("webhook instance has no settings"))?;
        serde_json::from_str(&raw).map_err(Into::into)
    }
}

#[async_trait]
impl ChannelHandler for WebhookChannelHandler {
    fn response_mode(&self) -> ResponseMode {
        ResponseMode::Final
    }

    async fn post_response(
        &self,
        instance: &PluginInstance,
        work_item_id: Option<Uuid>,
        content: &str,
        response_context: &Value,
        options: &PostResponseOptions,
    ) -> Result<DeliveryOutcome> {
        // Config problems are the caller's fault, not the transport's:
        // surface them as non-retryable failures rather than unknowns.
        let settings = match self.settings(instance) {
            Ok(settings) => settings,
            Err(e) => {
                return Ok(DeliveryOutcome::Failed {
                    retryable: false,
                    error: format!("invalid webhook settings: {e}"),
                })
            }
        };

        let body = json!({
            "content": content,
            "work_item_id": work_item_id,
            "response_context": response_context,
            "hit_limit": options.hit_limit,
        });
        let mut request = self.client.post(&settings.url).json(&body);
        if let Some(secret) = &settings.secret {
            request = request.header("X-Webhook-Secret", secret);
        }
        if let Some(key) = &options.idempotency_key {
            request = request.header("Idempotency-Key", key);
        }

        // A transport error after the request left is ambiguous: the
        // receiver may have processed it.
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return Ok(DeliveryOutcome::Unknown {
                    error: e.to_string(),
                })
            }
        };

        let status = response.status();
        if status.is_success() {
            let provider_ref = response
                .headers()
                .get("X-Delivery-Id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(DeliveryOutcome::Sent { provider_ref })
        } else {
            Ok(DeliveryOutcome::Failed {
                retryable: status.is_server_error() || status.as_u16() == 429,
                error: format!("webhook returned {status}"),
            })
        }
    }
}
