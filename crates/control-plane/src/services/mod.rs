//! Service layer for the Conduit Control Plane.
//!
//! Services wire the engine to its surroundings: the run queue, the event
//! bus, the outgoing hook task service and the background loops.

pub mod dispatcher;
pub mod events;
pub mod hooks;
pub mod queue;
pub mod reconciler;
pub mod run;

pub use dispatcher::Dispatcher;
pub use events::{EventPublisher, NoopPublisher};
pub use hooks::{DisabledHookService, HookService, HttpHookService};
pub use queue::{ChannelQueue, RunQueue};
pub use reconciler::Reconciler;
pub use run::RunService;
