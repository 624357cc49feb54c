//! Workflow DAG definitions.
//!
//! - **Types**: nodes, node kinds, pipelines, stages, jobs and conditions
//! - **Graph**: parent/ancestor queries and validation

mod graph;
pub mod types;

#[cfg(test)]
pub(crate) mod fixtures;

pub use types::{
    Application, ConditionOperator, Conditions, Environment, JobDef, Node, NodeContext, NodeId,
    NodeKind, OutgoingHookConfig, Parameter, Pipeline, PlainCondition, StageDef, Workflow,
};
