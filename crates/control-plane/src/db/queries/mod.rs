//! Database queries for the run engine.
//!
//! Every function takes a connection so it can run inside the caller's
//! transaction.

pub mod agent;
pub mod job_run;
pub mod node_run;
pub mod run;
