// Queue domain: per-conversation lanes and debounced message coalescing.

pub mod enqueue;
pub mod models;

pub use enqueue::{compose_debounce_ms, enqueue_for_agents, FAIR_SHARE_STAGGER_MS};
pub use models::{build_coalesced_text, Lane, LaneMode, LaneState, QueueMessage, QueueMessageStatus};
