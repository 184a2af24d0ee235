use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::Agent;
use crate::common::{db_id, SecretCipher};

/// One configured channel integration (a Telegram bot, a Slack workspace,
/// a webhook endpoint). Settings are encrypted at rest.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PluginInstance {
    pub id: Uuid,
    pub plugin_type: String,
    pub name: String,
    pub settings_encrypted: Option<String>,
    pub public_channel: bool,
    pub default_debounce_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PluginInstance {
    pub async fn create(
        plugin_type: &str,
        name: &str,
        settings: Option<&str>,
        public_channel: bool,
        default_debounce_ms: Option<i64>,
        cipher: &SecretCipher,
        pool: &PgPool,
    ) -> Result<Self> {
        let encrypted = settings.map(|s| cipher.encrypt(s)).transpose()?;
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO plugin_instances (
                id, plugin_type, name, settings_encrypted, public_channel, default_debounce_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(db_id())
        .bind(plugin_type)
        .bind(name)
        .bind(encrypted)
        .bind(public_channel)
        .bind(default_debounce_ms)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: Uuid, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>("SELECT * FROM plugin_instances WHERE id = $1")
            .bind(id)
            .fetch_one(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn list(pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM plugin_instances ORDER BY created_at")
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }

    /// Decrypt the settings blob, if present.
    pub fn settings(&self, cipher: &SecretCipher) -> Result<Option<String>> {
        self.settings_encrypted
            .as_deref()
            .map(|s| cipher.decrypt(s))
            .transpose()
    }

    /// Agents assigned to this instance, in stagger order.
    pub async fn assigned_agents(&self, pool: &PgPool) -> Result<Vec<Agent>> {
        sqlx::query_as::<_, Agent>(
            r#"
            SELECT a.* FROM agents a
            JOIN plugin_instance_agents pia ON pia.agent_id = a.id
            WHERE pia.plugin_instance_id = $1 AND a.enabled = TRUE
            ORDER BY pia.position, a.created_at
            "#,
        )
        .bind(self.id)
        .fetch_all(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn assign_agent(&self, agent_id: Uuid, position: i32, pool: &PgPool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_instance_agents (plugin_instance_id, agent_id, position)
            VALUES ($1, $2, $3)
            ON CONFLICT (plugin_instance_id, agent_id) DO UPDATE SET position = EXCLUDED.position
            "#,
        )
        .bind(self.id)
        .bind(agent_id)
        .bind(position)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Webhook ingest URL for this instance.
    pub fn ingest_url(&self, app_base_url: &str) -> String {
        format!("{}/ingest/{}", app_base_url.trim_end_matches('/'), self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_instance() -> PluginInstance {
        PluginInstance {
            id: Uuid::nil(),
            plugin_type: "webhook".into(),
            name: "ops".into(),
            settings_encrypted: None,
            public_channel: false,
            default_debounce_ms: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn ingest_url_strips_trailing_slash() {
        let instance = sample_instance();
        assert_eq!(
            instance.ingest_url("https://runtime.example.com/"),
            format!("https://runtime.example.com/ingest/{}", Uuid::nil())
        );
    }

    #[test]
    fn settings_round_trip_through_cipher() {
        let cipher = SecretCipher::from_hex(
            "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f",
        )
        .unwrap();
        let mut instance = sample_instance();
        instance.settings_encrypted = Some(cipher.encrypt(r#"{"token":"t"}"#).unwrap());
        assert_eq!(
            instance.settings(&cipher).unwrap().unwrap(),
            r#"{"token":"t"}"#
        );
    }
}
