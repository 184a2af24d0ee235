// Domain layers. Each domain owns its models and workers; cross-domain
// access goes through model APIs, never raw SQL from another domain.

pub mod control;
pub mod dispatch;
pub mod outbox;
pub mod plugins;
pub mod queue;
pub mod routines;
pub mod work_items;
