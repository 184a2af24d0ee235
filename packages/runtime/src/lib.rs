// Agent runtime - control plane core
//
// A multi-agent execution runtime: inbound work (webhooks, chat, routine
// triggers, agent relays) flows through per-conversation lanes into a
// dispatch table; workers claim dispatches under leases, drive the agent
// runner with a steerable control channel, and defer side-effects to a
// durable outbox with at-most-once delivery. All coordination goes through
// the transactional store; epochs make preemption safe.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::*;
