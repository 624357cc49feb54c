//! Parameter resolution for node runs and jobs.
//!
//! Parameters are collected into a flat name/value list, later sources
//! overriding earlier ones, then interpolated until values stop changing.
//! Every parameter that fails to interpolate is reported in one
//! [`MultiError`].

use std::collections::BTreeMap;

use crate::db::models::{ManualTrigger, NodeRun, Stage, WorkflowRun};
use crate::engine::evaluator::STATUS_PARAMETER;
use crate::engine::state::Status;
use crate::error::MultiError;
use crate::template::{contains_template_syntax, ParameterScope, TemplateRenderer};
use crate::workflow::{JobDef, Node, NodeKind, Parameter};

const MAX_INTERPOLATION_PASSES: usize = 10;

/// Everything a node run's parameters are computed from.
pub struct NodeRunContext<'a> {
    pub run: &'a WorkflowRun,
    pub node: &'a Node,
    pub sub_number: i64,
    /// Upstream node runs, in declaration order.
    pub parents: &'a [&'a NodeRun],
    /// Flattened trigger payload.
    pub payload: &'a BTreeMap<String, String>,
    pub manual: Option<&'a ManualTrigger>,
}

impl NodeRunContext<'_> {
    /// `Fail` or `Stopped` when any parent ended that way, `Success` otherwise.
    pub fn parent_status(&self) -> Status {
        self.parents
            .iter()
            .map(|p| p.status.propagated())
            .find(|s| *s != Status::Success)
            .unwrap_or(Status::Success)
    }
}

/// Set `name` to `value`, replacing an existing entry in place.
pub fn upsert(params: &mut Vec<Parameter>, name: &str, value: &str) {
    match params.iter_mut().find(|p| p.name == name) {
        Some(existing) => existing.value = value.to_string(),
        None => params.push(Parameter::new(name, value)),
    }
}

/// Flatten a JSON payload into lowercase dotted keys.
pub fn flatten_payload(payload: &serde_json::Value) -> BTreeMap<String, String> {
    fn walk(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, String>) {
        let join = |key: &str| {
            let key = key.to_lowercase();
            if prefix.is_empty() {
                key
            } else {
                format!("{}.{}", prefix, key)
            }
        };
        match value {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    walk(&join(k), v, out);
                }
            }
            serde_json::Value::Array(items) => {
                for (idx, v) in items.iter().enumerate() {
                    walk(&join(&idx.to_string()), v, out);
                }
            }
            serde_json::Value::String(s) => {
                out.insert(prefix.to_string(), s.clone());
            }
            serde_json::Value::Null => {
                out.insert(prefix.to_string(), String::new());
            }
            other => {
                out.insert(prefix.to_string(), other.to_string());
            }
        }
    }

    let mut out = BTreeMap::new();
    if payload.is_object() || payload.is_array() {
        walk("", payload, &mut out);
    }
    out
}

/// Computes node run and job parameters.
#[derive(Default)]
pub struct ParameterResolver {
    renderer: TemplateRenderer,
}

impl ParameterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the parameters of a node run about to be created.
    pub fn resolve_node_run_parameters(
        &self,
        ctx: &NodeRunContext<'_>,
    ) -> Result<Vec<Parameter>, (Vec<Parameter>, MultiError)> {
        let raw = self.node_run_parameters(ctx);
        self.interpolate(raw)
    }

    /// Resolve the parameters of one job, on top of its node run's.
    pub fn resolve_job_parameters(
        &self,
        params: &[Parameter],
        stage: &Stage,
        job: &JobDef,
    ) -> Result<Vec<Parameter>, MultiError> {
        let mut raw = params.to_vec();
        upsert(&mut raw, "cds.stage", &stage.name);
        upsert(&mut raw, "cds.job", &job.name);
        for param in &job.parameters {
            upsert(&mut raw, &param.name, &param.value);
        }
        self.interpolate(raw).map_err(|(_, errors)| errors)
    }

    /// Collect the uninterpolated parameter list of a node run.
    pub fn node_run_parameters(&self, ctx: &NodeRunContext<'_>) -> Vec<Parameter> {
        let run = ctx.run;
        let workflow = &run.workflow;
        let node = ctx.node;
        let mut params = Vec::new();

        // Parent parameters merge left to right underneath the node's own.
        for parent in ctx.parents {
            for param in parent
                .build_parameters
                .iter()
                .filter(|p| !p.name.starts_with("cds."))
            {
                upsert(&mut params, &param.name, &param.value);
            }
        }

        upsert(&mut params, "cds.project", &workflow.project_key);
        upsert(&mut params, "cds.workflow", &workflow.name);
        upsert(&mut params, "cds.workflow.id", &workflow.id.to_string());
        upsert(&mut params, "cds.version", &run.number.to_string());
        upsert(
            &mut params,
            "cds.run",
            &format!("{}.{}", run.number, ctx.sub_number),
        );
        upsert(&mut params, "cds.run.number", &run.number.to_string());
        upsert(&mut params, "cds.run.subnumber", &ctx.sub_number.to_string());
        upsert(&mut params, "cds.node", &node.name);
        upsert(&mut params, "cds.node.kind", node.kind.name());

        for var in &workflow.project_variables {
            upsert(&mut params, &format!("cds.proj.{}", var.name), &var.value);
        }

        if let Some(app) = node
            .context
            .application_id
            .and_then(|id| workflow.applications.get(&id))
        {
            upsert(&mut params, "cds.application", &app.name);
            for var in &app.variables {
                upsert(&mut params, &format!("cds.app.{}", var.name), &var.value);
            }
            if let Some(repo) = &app.repository {
                upsert(&mut params, "git.repository", repo);
            }
        }

        if let Some(env) = node
            .context
            .environment_id
            .and_then(|id| workflow.environments.get(&id))
        {
            upsert(&mut params, "cds.environment", &env.name);
            for var in &env.variables {
                upsert(&mut params, &format!("cds.env.{}", var.name), &var.value);
            }
        }

        if let NodeKind::Pipeline { pipeline_id } = &node.kind {
            if let Some(pipeline) = workflow.pipelines.get(pipeline_id) {
                upsert(&mut params, "cds.pipeline", &pipeline.name);
                for param in &pipeline.parameters {
                    upsert(&mut params, &format!("cds.pip.{}", param.name), &param.value);
                }
            }
            for param in &node.context.default_pipeline_parameters {
                upsert(&mut params, &format!("cds.pip.{}", param.name), &param.value);
            }
        }

        for parent in ctx.parents {
            for param in parent
                .build_parameters
                .iter()
                .filter(|p| !p.name.starts_with("workflow."))
            {
                upsert(
                    &mut params,
                    &format!("workflow.{}.{}", parent.node_name, param.name),
                    &param.value,
                );
            }
            upsert(
                &mut params,
                &format!("workflow.{}.status", parent.node_name),
                parent.status.as_str(),
            );
        }

        for (key, value) in ctx.payload {
            upsert(&mut params, key, value);
        }

        match ctx.manual {
            Some(manual) => {
                upsert(&mut params, "cds.manual", "true");
                upsert(&mut params, "cds.triggered_by.username", &manual.username);
                upsert(&mut params, "cds.triggered_by.fullname", &manual.fullname);
                upsert(&mut params, "cds.triggered_by.email", &manual.email);
                for param in &manual.pipeline_parameters {
                    upsert(&mut params, &format!("cds.pip.{}", param.name), &param.value);
                }
            }
            None => upsert(&mut params, "cds.manual", "false"),
        }

        upsert(&mut params, STATUS_PARAMETER, ctx.parent_status().as_str());
        params
    }

    /// Interpolate values against the list itself until nothing changes.
    ///
    /// On failure the partially interpolated list is returned with the errors.
    pub fn interpolate(
        &self,
        params: Vec<Parameter>,
    ) -> Result<Vec<Parameter>, (Vec<Parameter>, MultiError)> {
        let mut current = params;
        for _ in 0..MAX_INTERPOLATION_PASSES {
            let scope = ParameterScope::from_parameters(&current);
            let mut errors = MultiError::new();
            let mut changed = false;

            for param in current.iter_mut() {
                if !contains_template_syntax(&param.value) {
                    continue;
                }
                match self.renderer.interpolate(&param.value, &scope) {
                    Ok(value) => {
                        if value != param.value {
                            param.value = value;
                            changed = true;
                        }
                    }
                    Err(e) => errors.push(param.name.clone(), e.to_string()),
                }
            }

            if !changed {
                return if errors.is_empty() {
                    Ok(current)
                } else {
                    Err((current, errors))
                };
            }
        }

        let mut errors = MultiError::new();
        for param in current
            .iter()
            .filter(|p| contains_template_syntax(&p.value))
        {
            errors.push(param.name.clone(), "interpolation does not converge");
        }
        if errors.is_empty() {
            Ok(current)
        } else {
            Err((current, errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::fixtures;

    fn value<'a>(params: &'a [Parameter], name: &str) -> Option<&'a str> {
        params
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_str())
    }

    #[test]
    fn test_flatten_payload() {
        let payload = serde_json::json!({
            "Git": {"Branch": "main", "hash": "abc"},
            "tags": ["a", "b"],
            "count": 3,
            "empty": null
        });
        let flat = flatten_payload(&payload);
        assert_eq!(flat.get("git.branch").map(String::as_str), Some("main"));
        assert_eq!(flat.get("tags.1").map(String::as_str), Some("b"));
        assert_eq!(flat.get("count").map(String::as_str), Some("3"));
        assert_eq!(flat.get("empty").map(String::as_str), Some(""));
    }

    #[test]
    fn test_node_run_parameters() {
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&2).unwrap().context.environment_id = Some(200);
        let mut run = WorkflowRun::new(wf, 4);
        run.id = 1;
        let node = run.workflow.nodes[&2].clone();
        let payload = BTreeMap::from([("git.branch".to_string(), "main".to_string())]);
        let manual = ManualTrigger {
            username: "jdoe".to_string(),
            ..Default::default()
        };
        let ctx = NodeRunContext {
            run: &run,
            node: &node,
            sub_number: 1,
            parents: &[],
            payload: &payload,
            manual: Some(&manual),
        };

        let params = ParameterResolver::new()
            .resolve_node_run_parameters(&ctx)
            .unwrap();
        assert_eq!(value(&params, "cds.run"), Some("4.1"));
        assert_eq!(value(&params, "cds.pipeline"), Some("deploy"));
        assert_eq!(value(&params, "cds.pip.image"), Some("alpine:3"));
        assert_eq!(value(&params, "cds.env.url"), Some("https://api.example.com"));
        assert_eq!(value(&params, "cds.app.port"), Some("8080"));
        assert_eq!(value(&params, "cds.proj.registry"), Some("registry.example.com"));
        assert_eq!(value(&params, "git.branch"), Some("main"));
        assert_eq!(value(&params, "git.repository"), Some("acme/api"));
        assert_eq!(value(&params, "cds.triggered_by.username"), Some("jdoe"));
        assert_eq!(value(&params, "cds.status"), Some("Success"));
    }

    #[test]
    fn test_interpolation_follows_references() {
        let resolver = ParameterResolver::new();
        let params = vec![
            Parameter::new("image", "{{ cds.proj.registry }}/api:{{ tag }}"),
            Parameter::new("tag", "{{ git.branch }}-{{ cds.run.number }}"),
            Parameter::new("cds.proj.registry", "registry.example.com"),
            Parameter::new("git.branch", "main"),
            Parameter::new("cds.run.number", "4"),
        ];
        let resolved = resolver.interpolate(params).unwrap();
        assert_eq!(
            value(&resolved, "image"),
            Some("registry.example.com/api:main-4")
        );
    }

    #[test]
    fn test_interpolation_reports_every_failure() {
        let resolver = ParameterResolver::new();
        let params = vec![
            Parameter::new("a", "{{ missing.one }}"),
            Parameter::new("b", "ok"),
            Parameter::new("c", "{{ missing_two }}"),
        ];
        let (partial, errors) = resolver.interpolate(params).unwrap_err();
        assert_eq!(errors.len(), 2);
        let names: Vec<&str> = errors.errors().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
        assert_eq!(value(&partial, "b"), Some("ok"));
    }

    #[test]
    fn test_self_reference_does_not_converge() {
        let resolver = ParameterResolver::new();
        let params = vec![Parameter::new("grow", "x{{ grow }}")];
        let (_, errors) = resolver.interpolate(params).unwrap_err();
        assert_eq!(errors.errors()[0].name, "grow");
    }

    #[test]
    fn test_job_parameters() {
        let resolver = ParameterResolver::new();
        let mut stage = Stage::from(&fixtures::pipeline(10, "build", &[("compile", &["make"])]).stages[0]);
        stage.jobs[0].parameters = vec![Parameter::new("target", "{{ cds.stage }}-{{ cds.job }}")];
        let job = stage.jobs[0].clone();
        let params = resolver
            .resolve_job_parameters(&[Parameter::new("cds.run", "1.0")], &stage, &job)
            .unwrap();
        assert_eq!(value(&params, "target"), Some("compile-make"));
    }
}
