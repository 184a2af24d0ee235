//! Actor envelope: the structured identity of whoever produced an input.
//!
//! Serialized into work-item payloads. The `agent` variant drives
//! origin-agent exclusion: an agent never gets its own prior output
//! dispatched back to itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorEnvelope {
    Human {
        #[serde(skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        external_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    Agent {
        agent_id: Uuid,
        handle: String,
        display_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    System {
        #[serde(skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
}

impl ActorEnvelope {
    pub fn system(source: &str) -> Self {
        Self::System {
            source: Some(source.to_string()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Human { .. } => "human",
            Self::Agent { .. } => "agent",
            Self::System { .. } => "system",
        }
    }

    /// The originating agent id, if the actor is an agent.
    pub fn agent_id(&self) -> Option<Uuid> {
        match self {
            Self::Agent { agent_id, .. } => Some(*agent_id),
            _ => None,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Agent { handle, .. } => Some(handle),
            _ => None,
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            Self::Human { display_name, .. } => display_name.as_deref(),
            Self::Agent { display_name, .. } => Some(display_name),
            Self::System { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kind_tag() {
        let actor = ActorEnvelope::Agent {
            agent_id: Uuid::nil(),
            handle: "scout".into(),
            display_name: "Scout".into(),
            source: Some("slack".into()),
        };
        let json = serde_json::to_value(&actor).unwrap();
        assert_eq!(json["kind"], "agent");
        assert_eq!(json["handle"], "scout");
    }

    #[test]
    fn round_trips_human_without_optionals() {
        let actor = ActorEnvelope::Human {
            display_name: None,
            external_id: None,
            source: None,
        };
        let json = serde_json::to_string(&actor).unwrap();
        assert_eq!(json, r#"{"kind":"human"}"#);
        let back: ActorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, actor);
    }

    #[test]
    fn agent_id_only_for_agents() {
        assert!(ActorEnvelope::system("scheduler").agent_id().is_none());
        let id = Uuid::new_v4();
        let agent = ActorEnvelope::Agent {
            agent_id: id,
            handle: "ops".into(),
            display_name: "Ops".into(),
            source: None,
        };
        assert_eq!(agent.agent_id(), Some(id));
    }
}
