//! Node run state machine.
//!
//! A pipeline node run walks its stages in order. A stage is initialized on
//! first visit, which queues its jobs, and is then synced from the job rows
//! until every job is terminal. A failed or stopped stage ends the node run.

use tracing::{debug, info};

use crate::db::models::{JobRun, NodeRun, RunJob, RunMessage, SpawnMessage, Stage, WorkflowRun};
use crate::engine::orchestrator::{ProcessStart, WorkflowOrchestrator};
use crate::engine::report::{ProcessorReport, RunRequest};
use crate::engine::state::{stage_status, Status, StatusCounter};
use crate::error::AppResult;
use crate::store::StoreTx;
use crate::workflow::Node;

impl WorkflowOrchestrator {
    /// Move a node run forward and, once it is terminal, propagate through
    /// the DAG. Returns the node run as persisted.
    pub async fn advance_node_run(
        &self,
        tx: &mut dyn StoreTx,
        mut node_run: NodeRun,
        report: &mut ProcessorReport,
    ) -> AppResult<NodeRun> {
        if node_run.status.is_terminal() {
            debug!(node_run_id = node_run.id, status = %node_run.status, "Node run already terminal");
            return Ok(node_run);
        }

        let mut run = tx.load_run(node_run.workflow_run_id).await?;
        let node = run.workflow.node(node_run.node_id)?.clone();

        if node.kind.completes_immediately() || node_run.outgoing_hook.is_some() {
            return Ok(node_run);
        }
        if self.mutex_blocked(tx, &mut run, &node, &node_run).await? {
            tx.update_run(&run).await?;
            return Ok(node_run);
        }

        self.execute_node_run(tx, &mut node_run, report).await?;
        tx.update_node_run(&node_run).await?;
        run.put_node_run(node_run.clone());

        if node_run.status.is_terminal() {
            self.on_node_run_terminal(tx, &run, &node_run, report)
                .await?;
            self.process(tx, &mut run, ProcessStart::Resume, report)
                .await?;
        } else {
            self.update_run_status(tx, &mut run, report).await?;
        }
        Ok(node_run)
    }

    /// Walk the stages of a node run and derive its status.
    ///
    /// Only the node run value changes; callers persist it.
    pub(crate) async fn execute_node_run(
        &self,
        tx: &mut dyn StoreTx,
        node_run: &mut NodeRun,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        if node_run.status.is_terminal() {
            return Ok(());
        }

        let mut halted = None;
        for idx in 0..node_run.stages.len() {
            if node_run.stages[idx].status.is_none() {
                self.add_jobs_to_queue(tx, node_run, idx, report).await?;
            }

            let stage = &mut node_run.stages[idx];
            match stage.status {
                Some(Status::Waiting) => break,
                Some(Status::Building) => {
                    if !sync_stage(tx, stage).await? {
                        break;
                    }
                }
                _ => {}
            }

            if let Some(status @ (Status::Fail | Status::Stopped)) = stage.status {
                info!(
                    node_run_id = node_run.id,
                    stage = %stage.name,
                    %status,
                    "Stage ended node run"
                );
                halted = Some(status);
                break;
            }
        }

        let status = match halted {
            Some(status) => status,
            None => self.derive_node_status(node_run),
        };
        if status != node_run.status {
            debug!(
                node_run_id = node_run.id,
                from = %node_run.status,
                to = %status,
                "Node run status changed"
            );
            node_run.set_status(status);
            report.add_node_run(node_run);
        }
        Ok(())
    }

    fn derive_node_status(&self, node_run: &NodeRun) -> Status {
        let all_terminal = node_run
            .stages
            .iter()
            .all(|s| s.status.map_or(false, |s| s.is_terminal()));
        if all_terminal {
            if node_run.stages.is_empty() {
                return Status::Success;
            }
            let counter: StatusCounter = node_run.stages.iter().filter_map(|s| s.status).collect();
            return counter.status();
        }

        let started = node_run
            .stages
            .iter()
            .any(|s| s.status == Some(Status::Building));
        if started || node_run.status == Status::Building {
            Status::Building
        } else {
            Status::Waiting
        }
    }

    /// First visit of a stage: evaluate its conditions and create its jobs.
    async fn add_jobs_to_queue(
        &self,
        tx: &mut dyn StoreTx,
        node_run: &mut NodeRun,
        idx: usize,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        let params = node_run.build_parameters.clone();
        let node_run_id = node_run.id;
        let run_id = node_run.workflow_run_id;
        let stage = &mut node_run.stages[idx];

        if !stage.enabled {
            info!(node_run_id, stage = %stage.name, "Stage disabled");
            stage.status = Some(Status::Disabled);
            return Ok(());
        }

        let mut condition_error = None;
        if !stage.conditions.is_empty() {
            match self.evaluator.evaluate(&stage.conditions, &params) {
                Ok(true) => {}
                Ok(false) => {
                    info!(node_run_id, stage = %stage.name, "Stage conditions not met");
                    stage.status = Some(Status::Skipped);
                    return Ok(());
                }
                Err(e) => condition_error = Some(e.to_string()),
            }
        }

        let jobs = stage.jobs.clone();
        for def in jobs {
            let mut job = JobRun::new(node_run_id, run_id, stage.id, def.clone());
            if !def.enabled {
                job.status = Status::Disabled;
                job.done = Some(job.queued);
            } else if let Some(error) = &condition_error {
                job.status = Status::Fail;
                job.done = Some(job.queued);
                job.add_spawn_info(SpawnMessage::JobError {
                    errors: error.clone(),
                });
            } else {
                match self.resolver.resolve_job_parameters(&params, stage, &def) {
                    Ok(resolved) => {
                        job.parameters = resolved;
                        job.add_spawn_info(SpawnMessage::JobInQueue);
                    }
                    Err(errors) => {
                        job.status = Status::Fail;
                        job.done = Some(job.queued);
                        job.add_spawn_info(SpawnMessage::JobError {
                            errors: errors.to_string(),
                        });
                    }
                }
            }

            tx.insert_job_run(&mut job).await?;
            debug!(
                node_run_id,
                job_run_id = job.id,
                job = %job.job.name,
                status = %job.status,
                "Job queued"
            );
            report.add_job_run(&job);
            stage.run_jobs.push(RunJob::from(&job));
        }

        stage.status = Some(if stage.run_jobs.iter().all(|j| j.status.is_terminal()) {
            stage_status(stage.run_jobs.iter().map(|j| j.status))
        } else {
            Status::Waiting
        });
        Ok(())
    }

    /// Whether a mutex node must wait for another run of the same node.
    ///
    /// Records a run info while blocked and a release info once it may go.
    pub(crate) async fn mutex_blocked(
        &self,
        tx: &mut dyn StoreTx,
        run: &mut WorkflowRun,
        node: &Node,
        node_run: &NodeRun,
    ) -> AppResult<bool> {
        if !node.context.mutex || node_run.stages.iter().any(|s| s.status.is_some()) {
            return Ok(false);
        }

        let building = tx
            .count_building_node_runs(run.workflow_id, node.id, run.id)
            .await?;
        let waiting_info = RunMessage::NodeMutex {
            node: node.name.clone(),
        };
        if building > 0 {
            info!(run_id = run.id, node = %node.name, building, "Node waiting on mutex");
            run.add_info(waiting_info, node_run.sub_number);
            return Ok(true);
        }

        let was_waiting = run
            .infos
            .iter()
            .any(|i| i.sub_number == node_run.sub_number && i.message == waiting_info);
        if was_waiting {
            run.add_info(
                RunMessage::NodeMutexRelease {
                    node: node.name.clone(),
                },
                node_run.sub_number,
            );
        }
        Ok(false)
    }

    /// Cleanup once a node run is terminal: purge its job rows and wake the
    /// next run waiting on the node's mutex.
    pub(crate) async fn on_node_run_terminal(
        &self,
        tx: &mut dyn StoreTx,
        run: &WorkflowRun,
        node_run: &NodeRun,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        let purged = tx.delete_job_runs(node_run.id).await?;
        info!(
            run_id = run.id,
            node_run_id = node_run.id,
            node = %node_run.node_name,
            status = %node_run.status,
            purged,
            "Node run finished"
        );

        let node = run.workflow.node(node_run.node_id)?;
        if node.context.mutex {
            if let Some(waiter) = tx
                .next_mutex_waiter(run.workflow_id, node.id, run.id)
                .await?
            {
                debug!(
                    node = %node.name,
                    waiting_run_id = waiter.workflow_run_id,
                    "Releasing node mutex"
                );
                report.enqueue(RunRequest::node_run(waiter.workflow_run_id, waiter.id));
            }
        }
        Ok(())
    }
}

/// Refresh a building stage from its job rows.
///
/// Returns `true` once every job is terminal, with the stage status set.
async fn sync_stage(tx: &mut dyn StoreTx, stage: &mut Stage) -> AppResult<bool> {
    for run_job in stage.run_jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
        let job = tx.load_job_run(run_job.job_run_id).await?;
        *run_job = RunJob::from(&job);
    }

    let done = stage.run_jobs.iter().all(|j| j.status.is_terminal());
    if done {
        stage.status = Some(stage_status(stage.run_jobs.iter().map(|j| j.status)));
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{job_for, orchestrator, start_run, ScriptedHooks};
    use crate::store::{MemoryStore, Store};
    use crate::workflow::{fixtures, ConditionOperator, Conditions, PlainCondition};

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.pipelines.insert(
            10,
            fixtures::pipeline(10, "build", &[("compile", &["make", "lint"]), ("package", &["tar"])]),
        );
        start_run(&store, &engine, wf).await;

        assert!(job_for(&store, "tar").is_none());
        for name in ["make", "lint"] {
            let job = job_for(&store, name).unwrap();
            let mut tx = store.begin().await.unwrap();
            let mut report = ProcessorReport::new();
            let mut job = tx.load_job_run(job.id).await.unwrap();
            engine
                .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
                .await
                .unwrap();
            engine
                .update_job_status(tx.as_mut(), &mut job, Status::Success, &mut report)
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let tar = job_for(&store, "tar").unwrap();
        assert_eq!(tar.status, Status::Waiting);
        let node_run = store
            .node_runs()
            .into_iter()
            .find(|nr| nr.node_id == 1)
            .unwrap();
        assert_eq!(node_run.status, Status::Building);
        assert_eq!(node_run.stages[0].status, Some(Status::Success));
        assert_eq!(node_run.stages[1].status, Some(Status::Waiting));
    }

    #[tokio::test]
    async fn test_skipped_stage_creates_no_jobs() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        let mut pipeline =
            fixtures::pipeline(10, "build", &[("compile", &["make"]), ("package", &["tar"])]);
        pipeline.stages[0].conditions = Conditions {
            plain: vec![PlainCondition::new("git.branch", ConditionOperator::Eq, "main")],
            expression: None,
        };
        wf.pipelines.insert(10, pipeline);
        start_run(&store, &engine, wf).await;

        assert!(job_for(&store, "make").is_none());
        assert!(job_for(&store, "tar").is_some());
        let node_run = store
            .node_runs()
            .into_iter()
            .find(|nr| nr.node_id == 1)
            .unwrap();
        assert_eq!(node_run.stages[0].status, Some(Status::Skipped));
    }

    #[tokio::test]
    async fn test_all_disabled_pipeline_finishes_at_creation() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.pipelines.get_mut(&10).unwrap().stages[0].jobs[0].enabled = false;
        let run_id = start_run(&store, &engine, wf).await;

        let mut tx = store.begin().await.unwrap();
        let run = tx.load_run(run_id).await.unwrap();
        let build = run.latest_node_run(1).unwrap();
        assert_eq!(build.stages[0].status, Some(Status::Disabled));
        assert_eq!(build.status, Status::Disabled);
        // Disabled propagates as success.
        assert!(run.latest_node_run(2).is_some());
    }

    #[tokio::test]
    async fn test_mutex_node_waits_for_other_run() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.nodes.get_mut(&1).unwrap().context.mutex = true;

        let first = start_run(&store, &engine, wf.clone()).await;
        let job = job_for(&store, "make").unwrap();
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let mut job = tx.load_job_run(job.id).await.unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let second = start_run(&store, &engine, wf).await;
        let mut tx = store.begin().await.unwrap();
        let run = tx.load_run(second).await.unwrap();
        let blocked = run.latest_node_run(1).unwrap().clone();
        assert_eq!(blocked.status, Status::Waiting);
        assert!(blocked.stages[0].status.is_none());
        assert!(run
            .infos
            .iter()
            .any(|i| matches!(i.message, RunMessage::NodeMutex { .. })));
        drop(tx);

        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Success, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(report
            .requests()
            .contains(&RunRequest::node_run(second, blocked.id)));

        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let node_run = tx.lock_node_run(blocked.id).await.unwrap();
        let node_run = engine
            .advance_node_run(tx.as_mut(), node_run, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(node_run.stages[0].status, Some(Status::Waiting));
        assert_ne!(first, second);
    }
}
