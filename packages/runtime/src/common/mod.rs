// Common types and utilities shared across the runtime

pub mod actor;
pub mod crypto;
pub mod hash;
pub mod schema;

pub use actor::ActorEnvelope;
pub use crypto::SecretCipher;
pub use hash::{db_id, exact_hash, generate_content_hash};
pub use schema::{is_schema_drift, warn_schema_drift_once};
