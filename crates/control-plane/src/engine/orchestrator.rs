//! Workflow run processing.
//!
//! Processing a run walks the DAG until nothing more can start:
//! - terminal node runs trigger their children at the same sub number
//! - joins fire once the latest run of every parent is terminal
//! - the run status is recomputed from the latest node runs
//!
//! Every step checks for an existing node run first, so processing the same
//! run twice creates nothing new.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::models::{
    HookCallback, ManualTrigger, NodeRun, OutgoingHookRun, RunMessage, RunTrigger, Stage, VcsInfo,
    WorkflowRun,
};
use crate::engine::evaluator::ConditionEvaluator;
use crate::engine::params::{flatten_payload, NodeRunContext, ParameterResolver};
use crate::engine::report::ProcessorReport;
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::services::hooks::{HookService, HookTaskRequest};
use crate::store::StoreTx;
use crate::workflow::{Node, NodeId, NodeKind, OutgoingHookConfig, Parameter};

/// Where a processing call starts.
#[derive(Debug, Clone)]
pub enum ProcessStart {
    /// Only fan out from what already ran.
    Resume,
    /// First processing of a new run: create the root node run.
    Root(RunTrigger),
    /// Re-run a node in a new sub number.
    FromNode {
        node_id: NodeId,
        trigger: Option<RunTrigger>,
    },
}

/// How a node run is being created.
struct NodeStart {
    sub_number: i64,
    /// Node run IDs it is started from.
    parents: Vec<i64>,
    trigger: Option<RunTrigger>,
    /// Propagation from a parent, as opposed to a root start or a restart.
    automatic: bool,
}

/// Drives runs through the DAG and their node and job state machines.
pub struct WorkflowOrchestrator {
    pub(crate) evaluator: ConditionEvaluator,
    pub(crate) resolver: ParameterResolver,
    pub(crate) hooks: Arc<dyn HookService>,
}

impl WorkflowOrchestrator {
    pub fn new(hooks: Arc<dyn HookService>) -> Self {
        Self {
            evaluator: ConditionEvaluator::new(),
            resolver: ParameterResolver::new(),
            hooks,
        }
    }

    /// Process a run from `start`.
    ///
    /// Returns `false` when the starting node's conditions kept it from
    /// running. The caller holds the run lock and persists nothing else.
    pub async fn process(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        start: ProcessStart,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        run.last_sub_number = run.last_sub_number.max(run.max_sub_number());

        let started = match start {
            ProcessStart::Resume => true,
            ProcessStart::Root(trigger) => self.start_root(tx, run, trigger, report).await?,
            ProcessStart::FromNode { node_id, trigger } => {
                self.start_from_node(tx, run, node_id, trigger, report)
                    .await?
            }
        };

        self.fan_out(tx, run, report).await?;
        self.update_run_status(tx, run, report).await?;
        Ok(started)
    }

    async fn start_root(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        trigger: RunTrigger,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        if !run.node_runs.is_empty() {
            debug!(run_id = run.id, "Root already started");
            return Ok(true);
        }

        run.add_info(
            RunMessage::WorkflowStarting {
                workflow: run.workflow.name.clone(),
                number: run.number,
            },
            0,
        );
        let root = run.workflow.root()?.clone();
        let start = NodeStart {
            sub_number: 0,
            parents: Vec::new(),
            trigger: Some(trigger),
            automatic: false,
        };
        Ok(self
            .create_node_run(tx, run, &root, start, report)
            .await?
            .is_some())
    }

    async fn start_from_node(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        node_id: NodeId,
        trigger: Option<RunTrigger>,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        let node = run.workflow.node(node_id)?.clone();

        let mut sources = Vec::new();
        for ancestor in run.workflow.ancestors(node_id) {
            match run.latest_node_run(ancestor) {
                Some(nr) if nr.status.is_terminal() => sources.push(nr.id),
                Some(nr) => {
                    return Err(AppError::ParentNotRun(format!(
                        "{} is still {}",
                        nr.node_name, nr.status
                    )))
                }
                None => {
                    let name = run.workflow.node(ancestor)?.name.clone();
                    return Err(AppError::ParentNotRun(format!("{} has not run", name)));
                }
            }
        }

        let sub_number = if run.node_runs.contains_key(&node_id) {
            run.last_sub_number + 1
        } else {
            run.last_sub_number
        };
        info!(
            run_id = run.id,
            node = %node.name,
            sub_number,
            "Restarting from node"
        );

        let start = NodeStart {
            sub_number,
            parents: sources,
            trigger,
            automatic: false,
        };
        Ok(self
            .create_node_run(tx, run, &node, start, report)
            .await?
            .is_some())
    }

    /// Create children of terminal node runs and fire ready joins until
    /// nothing new starts.
    async fn fan_out(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        loop {
            let mut created = false;

            let finished: Vec<(NodeId, i64, i64)> = run
                .node_runs
                .values()
                .flat_map(|runs| runs.iter())
                .filter(|nr| nr.status.is_terminal() && nr.status != Status::NeverBuilt)
                .map(|nr| (nr.node_id, nr.id, nr.sub_number))
                .collect();

            for (node_id, node_run_id, sub_number) in finished {
                let children = run.workflow.node(node_id)?.triggers.clone();
                for child_id in children {
                    let decided = run
                        .find_node_run(node_run_id)
                        .map_or(true, |nr| nr.triggers_run.contains_key(&child_id));
                    if decided || run.node_run_at(child_id, sub_number).is_some() {
                        continue;
                    }
                    let child = run.workflow.node(child_id)?.clone();
                    let start = NodeStart {
                        sub_number,
                        parents: vec![node_run_id],
                        trigger: None,
                        automatic: true,
                    };
                    if self
                        .create_node_run(tx, run, &child, start, report)
                        .await?
                        .is_some()
                    {
                        created = true;
                    }
                }
            }

            let joins: Vec<Node> = run.workflow.joins().map(|(n, _)| n.clone()).collect();
            for join in joins {
                if self.try_join(tx, run, &join, report).await? {
                    created = true;
                }
            }

            if !created {
                return Ok(());
            }
        }
    }

    async fn try_join(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        join: &Node,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        let NodeKind::Join { parents } = &join.kind else {
            return Ok(false);
        };

        let mut sources = Vec::with_capacity(parents.len());
        let mut sub_number = 0;
        let mut decided = true;
        for parent in parents {
            match run.latest_node_run(*parent) {
                Some(nr) if nr.status.is_terminal() && nr.status != Status::NeverBuilt => {
                    sources.push(nr.id);
                    sub_number = sub_number.max(nr.sub_number);
                    decided &= nr.triggers_run.contains_key(&join.id);
                }
                _ => return Ok(false),
            }
        }

        if decided || run.node_run_at(join.id, sub_number).is_some() {
            return Ok(false);
        }

        let start = NodeStart {
            sub_number,
            parents: sources,
            trigger: None,
            automatic: true,
        };
        Ok(self
            .create_node_run(tx, run, join, start, report)
            .await?
            .is_some())
    }

    /// Create and start one node run.
    ///
    /// Returns `None` when the node already ran at this sub number or its
    /// conditions do not hold.
    async fn create_node_run(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        node: &Node,
        start: NodeStart,
        report: &mut ProcessorReport,
    ) -> AppResult<Option<i64>> {
        if run.node_run_at(node.id, start.sub_number).is_some()
            || tx
                .node_run_exists(run.id, node.id, start.sub_number)
                .await?
        {
            debug!(
                run_id = run.id,
                node = %node.name,
                sub_number = start.sub_number,
                "Node run already exists"
            );
            return Ok(None);
        }

        let parents: Vec<NodeRun> = start
            .parents
            .iter()
            .filter_map(|id| run.find_node_run(*id).cloned())
            .collect();
        let parent_refs: Vec<&NodeRun> = parents.iter().collect();

        let mut payload = node
            .context
            .default_payload
            .as_ref()
            .map(flatten_payload)
            .unwrap_or_default();
        for parent in &parents {
            payload.extend(parent.payload.clone());
        }
        let (manual, hook_event) = match start.trigger.clone() {
            Some(RunTrigger::Manual(manual)) => {
                if let Some(extra) = &manual.payload {
                    payload.extend(flatten_payload(extra));
                }
                (Some(manual), None)
            }
            Some(RunTrigger::Hook(event)) => {
                payload.extend(event.payload.clone());
                (None, Some(event))
            }
            None => (None, None),
        };

        let ctx = NodeRunContext {
            run,
            node,
            sub_number: start.sub_number,
            parents: &parent_refs,
            payload: &payload,
            manual: manual.as_ref(),
        };
        let (params, param_errors) = match self.resolver.resolve_node_run_parameters(&ctx) {
            Ok(params) => (params, None),
            Err((params, errors)) => (params, Some(errors)),
        };

        if !self.check_conditions(run, node, &start, &params) {
            info!(
                run_id = run.id,
                node = %node.name,
                sub_number = start.sub_number,
                "Conditions not met, node not started"
            );
            self.record_trigger(
                tx,
                run,
                &start.parents,
                node.id,
                start.sub_number,
                Status::NeverBuilt,
            )
            .await?;
            return Ok(None);
        }

        let mut node_run =
            self.new_node_run(run, node, &start, params, payload, manual, hook_event)?;
        if let Some(errors) = param_errors {
            warn!(
                run_id = run.id,
                node = %node.name,
                %errors,
                "Node parameters could not be resolved"
            );
            run.add_info(
                RunMessage::ParameterError {
                    node: node.name.clone(),
                    errors: errors.to_string(),
                },
                start.sub_number,
            );
            node_run.set_status(Status::Fail);
        }

        tx.insert_node_run(&mut node_run).await?;
        node_run
            .build_parameters
            .push(Parameter::new("cds.node.id", node_run.id.to_string()));
        self.tag_run(run, &node_run);
        info!(
            run_id = run.id,
            node_run_id = node_run.id,
            node = %node.name,
            sub_number = node_run.sub_number,
            "Node run created"
        );

        if node_run.status == Status::Waiting {
            match &node.kind {
                NodeKind::Fork | NodeKind::Join { .. } => node_run.set_status(Status::Success),
                NodeKind::Pipeline { .. } => {
                    if !self.mutex_blocked(tx, run, node, &node_run).await? {
                        self.execute_node_run(tx, &mut node_run, report).await?;
                    }
                }
                NodeKind::OutgoingHook(config) => {
                    self.dispatch_hook(run, &mut node_run, config).await;
                }
            }
        }

        tx.update_node_run(&node_run).await?;
        report.add_node_run(&node_run);
        self.record_trigger(
            tx,
            run,
            &start.parents,
            node.id,
            node_run.sub_number,
            node_run.status,
        )
        .await?;

        let id = node_run.id;
        run.put_node_run(node_run.clone());
        if node_run.status.is_terminal() {
            self.on_node_run_terminal(tx, run, &node_run, report).await?;
        }
        Ok(Some(id))
    }

    /// Automatic propagation applies the default success policy; root starts
    /// and restarts only honor explicit conditions.
    fn check_conditions(
        &self,
        run: &mut WorkflowRun,
        node: &Node,
        start: &NodeStart,
        params: &[Parameter],
    ) -> bool {
        let conditions = &node.context.conditions;
        let result = if start.automatic {
            self.evaluator.should_propagate(conditions, params)
        } else if conditions.is_empty() {
            Ok(true)
        } else {
            self.evaluator.evaluate(conditions, params)
        };

        match result {
            Ok(ok) => ok,
            Err(e) => {
                warn!(run_id = run.id, node = %node.name, error = %e, "Condition evaluation failed");
                run.add_info(
                    RunMessage::ConditionError {
                        node: node.name.clone(),
                        error: e.to_string(),
                    },
                    start.sub_number,
                );
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn new_node_run(
        &self,
        run: &WorkflowRun,
        node: &Node,
        start: &NodeStart,
        params: Vec<Parameter>,
        payload: std::collections::BTreeMap<String, String>,
        manual: Option<ManualTrigger>,
        hook_event: Option<crate::db::models::HookEvent>,
    ) -> AppResult<NodeRun> {
        let stages = match &node.kind {
            NodeKind::Pipeline { pipeline_id } => run
                .workflow
                .pipeline(*pipeline_id)?
                .stages
                .iter()
                .map(Stage::from)
                .collect(),
            _ => Vec::new(),
        };

        let param = |name: &str| {
            params
                .iter()
                .find(|p| p.name == name)
                .map(|p| p.value.clone())
                .filter(|v| !v.is_empty())
        };
        let vcs = VcsInfo {
            repository: param("git.repository"),
            branch: param("git.branch"),
            tag: param("git.tag"),
            hash: param("git.hash"),
            author: param("git.author"),
            message: param("git.message"),
        };

        let now = chrono::Utc::now();
        Ok(NodeRun {
            id: 0,
            workflow_run_id: run.id,
            workflow_id: run.workflow_id,
            node_id: node.id,
            node_name: node.name.clone(),
            number: run.number,
            sub_number: start.sub_number,
            status: Status::Waiting,
            stages,
            build_parameters: params,
            payload,
            manual,
            hook_event,
            source_node_runs: start.parents.clone(),
            triggers_run: Default::default(),
            vcs,
            outgoing_hook: None,
            start: now,
            done: None,
            last_modified: now,
        })
    }

    fn tag_run(&self, run: &mut WorkflowRun, node_run: &NodeRun) {
        let vcs = &node_run.vcs;
        for (key, value) in [
            ("git.repository", &vcs.repository),
            ("git.branch", &vcs.branch),
            ("git.tag", &vcs.tag),
            ("git.hash", &vcs.hash),
            ("git.author", &vcs.author),
        ] {
            if let Some(value) = value {
                run.tag(key, value);
            }
        }
        if let Some(env) = node_run.parameter("cds.environment") {
            run.tag("environment", env);
        }
        if let Some(manual) = &node_run.manual {
            run.tag("triggered_by", &manual.username);
        }
    }

    /// Remember on each parent what became of a child started at
    /// `sub_number`. Parents from an earlier sub number are left as they were.
    async fn record_trigger(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        parents: &[i64],
        child: NodeId,
        sub_number: i64,
        status: Status,
    ) -> AppResult<()> {
        for parent_id in parents {
            let Some(parent) = run.find_node_run_mut(*parent_id) else {
                continue;
            };
            if parent.sub_number != sub_number {
                debug!(
                    node_run_id = parent.id,
                    parent_sub_number = parent.sub_number,
                    sub_number,
                    "Trigger not recorded on earlier sub number"
                );
                continue;
            }
            parent.triggers_run.insert(child, status);
            tx.update_node_run(parent).await?;
        }
        Ok(())
    }

    async fn dispatch_hook(
        &self,
        run: &mut WorkflowRun,
        node_run: &mut NodeRun,
        config: &OutgoingHookConfig,
    ) {
        let uuid = Uuid::new_v4().to_string();
        let request = HookTaskRequest {
            uuid: uuid.clone(),
            run_id: run.id,
            run_number: run.number,
            sub_number: node_run.sub_number,
            node: node_run.node_name.clone(),
            hook: config.clone(),
            parameters: node_run.build_parameters.clone(),
        };
        let mut hook_run = OutgoingHookRun {
            uuid,
            hook: config.clone(),
            execution_id: None,
            callback: None,
        };

        match self.hooks.execute(&request).await {
            Ok(task) => {
                info!(
                    run_id = run.id,
                    node = %node_run.node_name,
                    execution_id = %task.execution_id,
                    "Outgoing hook dispatched"
                );
                hook_run.execution_id = Some(task.execution_id);
            }
            Err(e) => {
                warn!(run_id = run.id, node = %node_run.node_name, error = %e, "Outgoing hook failed");
                run.add_info(
                    RunMessage::HookFailed {
                        node: node_run.node_name.clone(),
                        error: e.to_string(),
                    },
                    node_run.sub_number,
                );
                node_run.set_status(Status::Fail);
            }
        }
        node_run.outgoing_hook = Some(hook_run);
    }

    /// Apply the task service's terminal report on an outgoing hook run.
    ///
    /// Returns `false` when the hook run was already terminal.
    pub async fn complete_outgoing_hook(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        hook_uuid: &str,
        callback: HookCallback,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        if !callback.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "hook callback status must be terminal, got {}",
                callback.status
            )));
        }

        let mut node_run = run
            .node_runs
            .values()
            .flat_map(|runs| runs.iter())
            .find(|nr| {
                nr.outgoing_hook
                    .as_ref()
                    .map_or(false, |h| h.uuid == hook_uuid)
            })
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("outgoing hook {}", hook_uuid)))?;

        if node_run.status.is_terminal() {
            debug!(run_id = run.id, hook_uuid, "Hook callback on a finished node run ignored");
            return Ok(false);
        }

        let status = callback.status;
        if let Some(hook) = node_run.outgoing_hook.as_mut() {
            hook.callback = Some(callback);
        }
        node_run.set_status(status);
        tx.update_node_run(&node_run).await?;
        report.add_node_run(&node_run);
        info!(
            run_id = run.id,
            node = %node_run.node_name,
            %status,
            "Outgoing hook completed"
        );

        run.put_node_run(node_run);
        self.process(tx, run, ProcessStart::Resume, report).await?;
        Ok(true)
    }

    /// Recompute and persist the run status.
    pub(crate) async fn update_run_status(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        let status = run.compute_status();
        if status != run.status {
            info!(run_id = run.id, from = %run.status, to = %status, "Run status changed");
            run.status = status;
            report.add_run(run);
        }
        tx.update_run(run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::JobRun;
    use crate::engine::testing::{job_for, orchestrator, start_run, ScriptedHooks};
    use crate::store::{MemoryStore, Store};
    use crate::workflow::{fixtures, ConditionOperator, Conditions, PlainCondition};
    use tokio_test::{assert_err, assert_ok};

    async fn finish_job(
        store: &MemoryStore,
        engine: &WorkflowOrchestrator,
        job_id: i64,
        status: Status,
    ) {
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let mut job: JobRun = tx.load_job_run(job_id).await.unwrap();
        if job.status == Status::Waiting {
            engine
                .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
                .await
                .unwrap();
        }
        engine
            .update_job_status(tx.as_mut(), &mut job, status, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    async fn load(store: &MemoryStore, run_id: i64) -> WorkflowRun {
        let mut tx = store.begin().await.unwrap();
        tx.load_run(run_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_root_start_queues_first_job() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.status, Status::Building);
        assert_eq!(run.node_runs.len(), 1);
        let root = run.latest_node_run(1).unwrap();
        assert_eq!(root.sub_number, 0);
        assert_eq!(root.stages[0].status, Some(Status::Waiting));
        assert!(matches!(
            run.infos[0].message,
            RunMessage::WorkflowStarting { .. }
        ));

        let jobs = store.job_runs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, Status::Waiting);
        assert_eq!(run.tags.get("git.repository").map(String::as_str), Some("acme/api"));
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;

        let root_job = job_for(&store, "make").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let run = load(&store, run_id).await;
        let deploy = run.latest_node_run(2).unwrap();
        assert_eq!(deploy.sub_number, 0);
        assert_eq!(deploy.source_node_runs, vec![run.latest_node_run(1).unwrap().id]);
        assert_eq!(
            deploy.parameter("workflow.build.status"),
            Some("Success")
        );
        assert_eq!(
            run.latest_node_run(1).unwrap().triggers_run.get(&2),
            Some(&Status::Waiting)
        );

        let push = job_for(&store, "push").unwrap();
        finish_job(&store, &engine, push.id, Status::Success).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.status, Status::Success);
        assert!(store.job_runs().is_empty());
    }

    #[tokio::test]
    async fn test_failed_parent_does_not_trigger_child() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;

        let root_job = job_for(&store, "make").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Fail).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.status, Status::Fail);
        assert!(run.latest_node_run(2).is_none());
        assert_eq!(
            run.latest_node_run(1).unwrap().triggers_run.get(&2),
            Some(&Status::NeverBuilt)
        );
    }

    #[tokio::test]
    async fn test_explicit_condition_runs_on_failure() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&2).unwrap().context.conditions = Conditions {
            plain: vec![PlainCondition::new("cds.status", ConditionOperator::Eq, "Fail")],
            expression: None,
        };
        let run_id = start_run(&store, &engine, wf).await;

        let root_job = job_for(&store, "make").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Fail).await;

        let run = load(&store, run_id).await;
        assert!(run.latest_node_run(2).is_some());
    }

    #[tokio::test]
    async fn test_processing_twice_creates_nothing() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::fork_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let before = store.node_runs().len();
        assert_eq!(before, 4);
        for _ in 0..2 {
            let mut tx = store.begin().await.unwrap();
            let mut run = tx.load_run(run_id).await.unwrap();
            let mut report = ProcessorReport::new();
            engine
                .process(tx.as_mut(), &mut run, ProcessStart::Resume, &mut report)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }
        assert_eq!(store.node_runs().len(), before);
        assert_eq!(store.job_runs().len(), 2);
    }

    #[tokio::test]
    async fn test_fork_completes_immediately() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::fork_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(2).unwrap().status, Status::Success);
        assert!(run.latest_node_run(3).is_some());
        assert!(run.latest_node_run(4).is_some());
        assert_eq!(run.status, Status::Building);
    }

    #[tokio::test]
    async fn test_join_waits_for_every_parent() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::join_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let a = job_for(&store, "test-a").unwrap();
        finish_job(&store, &engine, a.id, Status::Success).await;
        assert!(load(&store, run_id).await.latest_node_run(4).is_none());

        let b = job_for(&store, "test-b").unwrap();
        finish_job(&store, &engine, b.id, Status::Success).await;

        let run = load(&store, run_id).await;
        let join = run.latest_node_run(4).unwrap();
        assert_eq!(join.status, Status::Success);
        assert_eq!(join.source_node_runs.len(), 2);
        assert!(run.latest_node_run(5).is_some());
    }

    #[tokio::test]
    async fn test_join_does_not_fire_on_failed_parent() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::join_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let a = job_for(&store, "test-a").unwrap();
        finish_job(&store, &engine, a.id, Status::Success).await;
        let b = job_for(&store, "test-b").unwrap();
        finish_job(&store, &engine, b.id, Status::Fail).await;

        let run = load(&store, run_id).await;
        assert!(run.latest_node_run(4).is_none());
        assert!(run.latest_node_run(5).is_none());
        assert_eq!(run.status, Status::Fail);
    }

    #[tokio::test]
    async fn test_restart_uses_next_sub_number() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;
        let root_job = job_for(&store, "make").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;
        let push = job_for(&store, "push").unwrap();
        finish_job(&store, &engine, push.id, Status::Fail).await;
        assert_eq!(load(&store, run_id).await.status, Status::Fail);

        let mut tx = store.begin().await.unwrap();
        let mut run = tx.load_run(run_id).await.unwrap();
        let mut report = ProcessorReport::new();
        let start = ProcessStart::FromNode {
            node_id: 2,
            trigger: Some(RunTrigger::Manual(ManualTrigger {
                username: "jdoe".to_string(),
                ..Default::default()
            })),
        };
        let started = assert_ok!(engine.process(tx.as_mut(), &mut run, start, &mut report).await);
        assert!(started);
        tx.commit().await.unwrap();

        let run = load(&store, run_id).await;
        let deploy = run.latest_node_run(2).unwrap();
        assert_eq!(deploy.sub_number, 1);
        assert_eq!(deploy.parameter("cds.manual"), Some("true"));
        assert_eq!(run.node_runs[&2].len(), 2);
        assert_eq!(run.last_sub_number, 1);
        assert_eq!(run.status, Status::Building);
    }

    async fn restart(
        store: &MemoryStore,
        engine: &WorkflowOrchestrator,
        run_id: i64,
        node_id: NodeId,
    ) -> bool {
        let mut tx = store.begin().await.unwrap();
        let mut run = tx.load_run(run_id).await.unwrap();
        let mut report = ProcessorReport::new();
        let start = ProcessStart::FromNode {
            node_id,
            trigger: Some(RunTrigger::Manual(ManualTrigger {
                username: "jdoe".to_string(),
                ..Default::default()
            })),
        };
        let started = assert_ok!(engine.process(tx.as_mut(), &mut run, start, &mut report).await);
        tx.commit().await.unwrap();
        started
    }

    async fn resume(store: &MemoryStore, engine: &WorkflowOrchestrator, run_id: i64) {
        let mut tx = store.begin().await.unwrap();
        let mut run = tx.load_run(run_id).await.unwrap();
        let mut report = ProcessorReport::new();
        engine
            .process(tx.as_mut(), &mut run, ProcessStart::Resume, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_root_reruns_children_once() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;
        for name in ["make", "push"] {
            let job = job_for(&store, name).unwrap();
            finish_job(&store, &engine, job.id, Status::Success).await;
        }

        assert!(restart(&store, &engine, run_id, 1).await);
        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(1).unwrap().sub_number, 1);
        assert_eq!(run.node_runs[&2].len(), 1);

        let make = job_for(&store, "make").unwrap();
        finish_job(&store, &engine, make.id, Status::Success).await;
        resume(&store, &engine, run_id).await;

        let run = load(&store, run_id).await;
        let deploys: Vec<i64> = run.node_runs[&2].iter().map(|nr| nr.sub_number).collect();
        assert_eq!(deploys, vec![1, 0]);
        assert_eq!(
            run.latest_node_run(2).unwrap().source_node_runs,
            vec![run.latest_node_run(1).unwrap().id]
        );
        assert_eq!(store.job_runs().len(), 1);

        let before = store.node_runs().len();
        resume(&store, &engine, run_id).await;
        assert_eq!(store.node_runs().len(), before);

        let push = job_for(&store, "push").unwrap();
        finish_job(&store, &engine, push.id, Status::Success).await;
        let run = load(&store, run_id).await;
        assert_eq!(run.status, Status::Success);
        assert_eq!(run.node_runs[&2].len(), 2);
    }

    #[tokio::test]
    async fn test_restart_branch_joins_with_earlier_sub_number() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::join_workflow()).await;
        for name in ["setup", "test-a", "test-b", "publish"] {
            let job = job_for(&store, name).unwrap();
            finish_job(&store, &engine, job.id, Status::Success).await;
        }
        assert_eq!(load(&store, run_id).await.status, Status::Success);

        assert!(restart(&store, &engine, run_id, 2).await);
        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(2).unwrap().sub_number, 1);
        assert_eq!(run.node_runs[&4].len(), 1);

        let a = job_for(&store, "test-a").unwrap();
        finish_job(&store, &engine, a.id, Status::Success).await;

        let run = load(&store, run_id).await;
        let a1 = run.node_run_at(2, 1).unwrap();
        let b0 = run.node_run_at(3, 0).unwrap();
        assert!(run.node_run_at(3, 1).is_none());
        assert!(run.node_run_at(1, 1).is_none());

        let join = run.node_run_at(4, 1).unwrap();
        assert_eq!(join.status, Status::Success);
        assert_eq!(join.source_node_runs, vec![a1.id, b0.id]);
        assert_eq!(run.node_runs[&4].len(), 2);
        assert_eq!(run.node_runs[&5].len(), 2);
        assert_eq!(run.latest_node_run(5).unwrap().sub_number, 1);
        assert_eq!(
            run.latest_node_run(5).unwrap().source_node_runs,
            vec![join.id]
        );

        let before = store.node_runs().len();
        resume(&store, &engine, run_id).await;
        assert_eq!(store.node_runs().len(), before);

        let publish = job_for(&store, "publish").unwrap();
        finish_job(&store, &engine, publish.id, Status::Success).await;
        assert_eq!(load(&store, run_id).await.status, Status::Success);
    }

    #[tokio::test]
    async fn test_restart_leaves_earlier_sub_number_untouched() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&2).unwrap().context.conditions = Conditions {
            plain: vec![PlainCondition::new("cds.manual", ConditionOperator::Eq, "false")],
            expression: None,
        };
        let run_id = start_run(&store, &engine, wf).await;
        for name in ["make", "push"] {
            let job = job_for(&store, name).unwrap();
            finish_job(&store, &engine, job.id, Status::Success).await;
        }
        let build = load(&store, run_id).await.latest_node_run(1).unwrap().clone();
        assert_eq!(build.triggers_run.get(&2), Some(&Status::Waiting));

        assert!(!restart(&store, &engine, run_id, 2).await);

        let run = load(&store, run_id).await;
        assert_eq!(run.node_runs[&2].len(), 1);
        let build_after = run.latest_node_run(1).unwrap();
        assert_eq!(build_after.sub_number, 0);
        assert_eq!(build_after.triggers_run, build.triggers_run);
        assert_eq!(build_after.last_modified, build.last_modified);
    }

    #[tokio::test]
    async fn test_restart_requires_ancestors_to_have_run() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::linear_workflow()).await;

        let mut tx = store.begin().await.unwrap();
        let mut run = tx.load_run(run_id).await.unwrap();
        let mut report = ProcessorReport::new();
        let start = ProcessStart::FromNode {
            node_id: 2,
            trigger: None,
        };
        let err = assert_err!(engine.process(tx.as_mut(), &mut run, start, &mut report).await);
        assert!(matches!(err, AppError::ParentNotRun(_)));
    }

    #[tokio::test]
    async fn test_parameter_error_fails_node() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&1).unwrap().context.default_pipeline_parameters =
            vec![Parameter::new("target", "{{ cds.missing.value }}")];
        let run_id = start_run(&store, &engine, wf).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(1).unwrap().status, Status::Fail);
        assert_eq!(run.status, Status::Fail);
        assert!(run
            .infos
            .iter()
            .any(|i| matches!(i.message, RunMessage::ParameterError { .. }) && i.is_error));
        assert!(store.job_runs().is_empty());
    }

    #[tokio::test]
    async fn test_outgoing_hook_success_continues() {
        let store = MemoryStore::new();
        let hooks = ScriptedHooks::accepting();
        let engine = orchestrator(hooks.clone());
        let run_id = start_run(&store, &engine, fixtures::hook_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let run = load(&store, run_id).await;
        let notify = run.latest_node_run(2).unwrap();
        assert_eq!(notify.status, Status::Waiting);
        let hook = notify.outgoing_hook.clone().unwrap();
        assert!(hook.execution_id.is_some());
        assert_eq!(hooks.requests().len(), 1);

        let mut tx = store.begin().await.unwrap();
        let mut run = tx.load_run(run_id).await.unwrap();
        let mut report = ProcessorReport::new();
        let callback = HookCallback {
            status: Status::Success,
            log: "200 OK".to_string(),
            done: chrono::Utc::now(),
        };
        assert!(engine
            .complete_outgoing_hook(tx.as_mut(), &mut run, &hook.uuid, callback.clone(), &mut report)
            .await
            .unwrap());
        assert!(!engine
            .complete_outgoing_hook(tx.as_mut(), &mut run, &hook.uuid, callback, &mut report)
            .await
            .unwrap());
        tx.commit().await.unwrap();

        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(2).unwrap().status, Status::Success);
        assert!(run.latest_node_run(3).is_some());
    }

    #[tokio::test]
    async fn test_outgoing_hook_failure_fails_node() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::failing());
        let run_id = start_run(&store, &engine, fixtures::hook_workflow()).await;
        let root_job = job_for(&store, "setup").unwrap();
        finish_job(&store, &engine, root_job.id, Status::Success).await;

        let run = load(&store, run_id).await;
        assert_eq!(run.latest_node_run(2).unwrap().status, Status::Fail);
        assert!(run.latest_node_run(3).is_none());
        assert!(run
            .infos
            .iter()
            .any(|i| matches!(i.message, RunMessage::HookFailed { .. })));
    }
}
