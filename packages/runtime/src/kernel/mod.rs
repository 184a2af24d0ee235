// Kernel - core infrastructure with dependency injection
//
// The RuntimeKernel holds all runtime dependencies (database, collaborator
// traits, registries) and provides dependency injection for testability.
//
// IMPORTANT: Kernel is for INFRASTRUCTURE only, not business logic.
// Business logic belongs in domain layers.

pub mod echo_runner;
pub mod hooks;
pub mod runtime_kernel;
pub mod service_host;
pub mod test_dependencies;
pub mod traits;

pub use echo_runner::EchoAgentRunner;
pub use hooks::{HookDispatch, HookOutcome, HookPoint, HookRegistry, PluginHook};
pub use runtime_kernel::{ChannelRegistry, ProbeRegistry, RuntimeKernel};
pub use service_host::{Service, ServiceHost, ServiceHostHandle};
pub use test_dependencies::{MockAgentRunner, MockChannelHandler, ScriptedArbiter, StaticProbe};
pub use traits::*;
