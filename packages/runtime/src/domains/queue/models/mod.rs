pub mod lane;
pub mod queue_message;

pub use lane::{Lane, LaneMode, LaneState};
pub use queue_message::{build_coalesced_text, QueueMessage, QueueMessageStatus};
