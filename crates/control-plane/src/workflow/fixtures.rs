//! Workflow definitions shared by engine tests.

use std::collections::BTreeMap;

use crate::workflow::types::{
    Application, Environment, JobDef, Node, NodeContext, NodeId, NodeKind, OutgoingHookConfig,
    Parameter, Pipeline, StageDef, Workflow,
};

pub fn pipeline(id: i64, name: &str, stages: &[(&str, &[&str])]) -> Pipeline {
    let mut job_id = id * 100;
    Pipeline {
        id,
        name: name.to_string(),
        parameters: vec![Parameter::new("image", "alpine:3")],
        stages: stages
            .iter()
            .enumerate()
            .map(|(idx, (stage, jobs))| StageDef {
                id: id * 10 + idx as i64,
                name: stage.to_string(),
                enabled: true,
                conditions: Default::default(),
                jobs: jobs
                    .iter()
                    .map(|job| {
                        job_id += 1;
                        JobDef {
                            id: job_id,
                            name: job.to_string(),
                            enabled: true,
                            parameters: Vec::new(),
                        }
                    })
                    .collect(),
            })
            .collect(),
    }
}

pub fn pipeline_node(id: NodeId, name: &str, pipeline_id: i64, triggers: &[NodeId]) -> Node {
    Node {
        id,
        name: name.to_string(),
        kind: NodeKind::Pipeline { pipeline_id },
        context: NodeContext {
            application_id: Some(100),
            ..Default::default()
        },
        triggers: triggers.to_vec(),
    }
}

fn base(nodes: Vec<Node>, pipelines: Vec<Pipeline>) -> Workflow {
    Workflow {
        id: 7,
        name: "release".to_string(),
        project_key: "PROJ".to_string(),
        root_id: 1,
        nodes: nodes.into_iter().map(|n| (n.id, n)).collect(),
        pipelines: pipelines.into_iter().map(|p| (p.id, p)).collect(),
        applications: BTreeMap::from([(
            100,
            Application {
                id: 100,
                name: "api".to_string(),
                repository: Some("acme/api".to_string()),
                variables: vec![Parameter::new("port", "8080")],
            },
        )]),
        environments: BTreeMap::from([(
            200,
            Environment {
                id: 200,
                name: "prod".to_string(),
                variables: vec![Parameter::new("url", "https://api.example.com")],
            },
        )]),
        project_variables: vec![Parameter::new("registry", "registry.example.com")],
    }
}

/// root(1, build) -> child(2, deploy), one stage and one job each.
pub fn linear_workflow() -> Workflow {
    base(
        vec![
            pipeline_node(1, "build", 10, &[2]),
            pipeline_node(2, "deploy", 20, &[]),
        ],
        vec![
            pipeline(10, "build", &[("compile", &["make"])]),
            pipeline(20, "deploy", &[("ship", &["push"])]),
        ],
    )
}

/// root(1) -> a(2), b(3); join(4) over [a, b] -> end(5).
pub fn join_workflow() -> Workflow {
    let join = Node {
        id: 4,
        name: "join".to_string(),
        kind: NodeKind::Join {
            parents: vec![2, 3],
        },
        context: NodeContext::default(),
        triggers: vec![5],
    };
    base(
        vec![
            pipeline_node(1, "root", 10, &[2, 3]),
            pipeline_node(2, "a", 20, &[]),
            pipeline_node(3, "b", 30, &[]),
            join,
            pipeline_node(5, "end", 50, &[]),
        ],
        vec![
            pipeline(10, "root", &[("init", &["setup"])]),
            pipeline(20, "a", &[("run", &["test-a"])]),
            pipeline(30, "b", &[("run", &["test-b"])]),
            pipeline(50, "end", &[("finish", &["publish"])]),
        ],
    )
}

/// root(1) -> fork(2) -> [left(3), right(4)].
pub fn fork_workflow() -> Workflow {
    let fork = Node {
        id: 2,
        name: "fork".to_string(),
        kind: NodeKind::Fork,
        context: NodeContext::default(),
        triggers: vec![3, 4],
    };
    base(
        vec![
            pipeline_node(1, "root", 10, &[2]),
            fork,
            pipeline_node(3, "left", 30, &[]),
            pipeline_node(4, "right", 40, &[]),
        ],
        vec![
            pipeline(10, "root", &[("init", &["setup"])]),
            pipeline(30, "left", &[("run", &["left-job"])]),
            pipeline(40, "right", &[("run", &["right-job"])]),
        ],
    )
}

/// root(1) -> notify(2, outgoing hook) -> after(3).
pub fn hook_workflow() -> Workflow {
    let hook = Node {
        id: 2,
        name: "notify".to_string(),
        kind: NodeKind::OutgoingHook(OutgoingHookConfig {
            model: "webhook".to_string(),
            config: BTreeMap::from([("url".to_string(), "https://hooks.example.com".to_string())]),
        }),
        context: NodeContext::default(),
        triggers: vec![3],
    };
    base(
        vec![
            pipeline_node(1, "root", 10, &[2]),
            hook,
            pipeline_node(3, "after", 30, &[]),
        ],
        vec![
            pipeline(10, "root", &[("init", &["setup"])]),
            pipeline(30, "after", &[("run", &["after-job"])]),
        ],
    )
}
