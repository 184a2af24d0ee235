pub mod effect_outbox;

pub use effect_outbox::{
    backoff_seconds, failure_notice_effect_key, final_response_effect_key, EffectOutbox,
    EffectPayload, EffectStatus,
};
