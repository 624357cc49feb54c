//! Conduit Control Plane Library
//!
//! The run engine of the Conduit continuous delivery orchestrator:
//!
//! - **DAG processing**: start a workflow run, trigger children as parents
//!   finish, fork and join branches, restart from any node
//! - **Node runs**: walk pipeline stages in order, queue jobs, honor node
//!   mutexes and dispatch outgoing hooks
//! - **Job runs**: validate agent status reports and feed them back into
//!   the DAG
//! - **Parameters and conditions**: build the parameter set of each node
//!   run and evaluate its run conditions
//! - **Background loops**: a dispatcher for run change notifications and a
//!   reconciler for dead jobs and stuck runs
//!
//! ## Architecture
//!
//! Every operation runs inside one store transaction, with row locks on the
//! run and node run it touches. Engine calls collect their side effects in
//! a [`engine::ProcessorReport`]; events are published and follow-up
//! requests queued only after the transaction commits.
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from environment variables
//! - [`db`]: PostgreSQL store, models and queries
//! - [`engine`]: Status rules, DAG processor, node and job state machines
//! - [`error`]: Custom error types
//! - [`nats`]: JetStream run queue and event publisher
//! - [`services`]: Run service, dispatcher, reconciler, hook client
//! - [`state`]: Shared application state
//! - [`store`]: Transactional storage seam and in-memory store
//! - [`template`]: Parameter interpolation
//! - [`workflow`]: Workflow definitions and DAG helpers
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use conduit_control_plane::{
//!     config::AppConfig,
//!     services::{ChannelQueue, DisabledHookService, NoopPublisher, RunService},
//!     state::AppState,
//!     store::MemoryStore,
//! };
//!
//! let state = AppState::new(
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(ChannelQueue::new()),
//!     Arc::new(NoopPublisher),
//!     Arc::new(DisabledHookService),
//!     AppConfig::default(),
//! );
//! let runs = RunService::new(state);
//! let run = runs.start_run(workflow, trigger).await?;
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod nats;
pub mod services;
pub mod state;
pub mod store;
pub mod template;
pub mod workflow;

pub use error::{AppError, AppResult};
