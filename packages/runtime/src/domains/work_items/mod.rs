// Work-items domain: inbound units of work and their intake path.

pub mod intake;
pub mod models;

pub use intake::{ingest_work_item, IngestOutcome, IntakeRequest};
pub use models::{Message, WorkItem, WorkItemPayload, WorkItemStatus};
