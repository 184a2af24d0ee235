pub mod message;
pub mod work_item;

pub use message::{summarize_recent, Message};
pub use work_item::{CreateResult, WorkItem, WorkItemPayload, WorkItemStatus};
