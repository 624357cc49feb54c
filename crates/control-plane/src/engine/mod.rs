//! Workflow run engine.
//!
//! - **Orchestrator**: DAG processing, trigger fan-out and joins
//! - **Node**: node run state machine over stages
//! - **Job**: job run state machine and agent-facing transitions
//! - **Params / Evaluator**: parameter resolution and run conditions
//! - **State**: statuses and their aggregation
//! - **Report**: events and follow-up requests gathered per transaction
//! - **Stop**: stopping node runs and whole runs on request
//! - **Bookings**: advisory job reservations

pub mod bookings;
pub mod evaluator;
pub mod job;
mod node;
pub mod orchestrator;
pub mod params;
pub mod report;
pub mod state;
mod stop;

#[cfg(test)]
pub(crate) mod testing;

pub use bookings::{JobBookings, MemoryBookings};
pub use evaluator::ConditionEvaluator;
pub use job::{check_transition, Transition};
pub use orchestrator::{ProcessStart, WorkflowOrchestrator};
pub use params::ParameterResolver;
pub use report::{ProcessorReport, RunEvent, RunRequest};
pub use state::{Status, StatusCounter};
