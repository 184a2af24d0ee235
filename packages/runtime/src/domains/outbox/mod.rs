// Effect-outbox domain: deferred side-effects with at-most-once delivery
// and the agent relay.

pub mod models;
pub mod relay;
pub mod worker;

pub use models::{EffectOutbox, EffectPayload, EffectStatus};
pub use relay::{enqueue_agent_relay, RelayOutcome, MAX_RELAY_DEPTH};
pub use worker::EffectOutboxWorker;
