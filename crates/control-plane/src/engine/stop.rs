//! Stopping node runs and runs on request.
//!
//! Unfinished jobs go through the job state machine as `Stopped`, so stages
//! and the node run end the same way as when an agent reports a stop.
//! Stages that never started and pending outgoing hooks are stopped in
//! place.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::db::models::{HookCallback, NodeRun, RunMessage, SpawnMessage, WorkflowRun};
use crate::engine::orchestrator::{ProcessStart, WorkflowOrchestrator};
use crate::engine::report::ProcessorReport;
use crate::engine::state::Status;
use crate::error::AppResult;
use crate::store::StoreTx;

impl WorkflowOrchestrator {
    /// Stop one node run, then process its run again.
    ///
    /// Returns `false` when the node run was already terminal. The caller
    /// holds the run lock.
    pub async fn stop_node_run(
        &self,
        tx: &mut dyn StoreTx,
        node_run_id: i64,
        reason: &str,
        report: &mut ProcessorReport,
    ) -> AppResult<bool> {
        let node_run = tx.lock_node_run(node_run_id).await?;
        if node_run.status.is_terminal() {
            debug!(node_run_id, status = %node_run.status, "Node run already finished");
            return Ok(false);
        }
        info!(
            run_id = node_run.workflow_run_id,
            node_run_id,
            node = %node_run.node_name,
            reason,
            "Stopping node run"
        );

        let live_jobs: Vec<i64> = node_run
            .stages
            .iter()
            .flat_map(|s| s.run_jobs.iter())
            .filter(|j| !j.status.is_terminal())
            .map(|j| j.job_run_id)
            .collect();
        for job_id in live_jobs {
            // The last stopped job ends the node run and purges the rest.
            if tx.load_node_run(node_run_id).await?.status.is_terminal() {
                break;
            }
            self.stop_job_run(tx, job_id, reason, report).await?;
        }

        let mut node_run = tx.load_node_run(node_run_id).await?;
        let stages_stopped = stop_stages(&mut node_run);
        if node_run.status.is_terminal() {
            if stages_stopped {
                tx.update_node_run(&node_run).await?;
            }
            return Ok(true);
        }

        if let Some(hook) = node_run.outgoing_hook.as_mut() {
            if let Some(execution_id) = &hook.execution_id {
                if let Err(e) = self.hooks.stop(&hook.uuid, execution_id).await {
                    warn!(node_run_id, error = %e, "Failed to stop outgoing hook task");
                }
            }
            let log = hook
                .callback
                .as_ref()
                .map(|c| format!("{}\nStopped", c.log))
                .unwrap_or_else(|| "Stopped".to_string());
            hook.callback = Some(HookCallback {
                status: Status::Stopped,
                log,
                done: Utc::now(),
            });
        }

        node_run.set_status(Status::Stopped);
        tx.update_node_run(&node_run).await?;
        report.add_node_run(&node_run);

        let mut run = tx.load_run(node_run.workflow_run_id).await?;
        run.put_node_run(node_run.clone());
        self.on_node_run_terminal(tx, &run, &node_run, report).await?;
        self.process(tx, &mut run, ProcessStart::Resume, report)
            .await?;
        Ok(true)
    }

    /// Stop every unfinished node run of a run.
    ///
    /// The caller holds the run lock.
    pub async fn stop_run(
        &self,
        tx: &mut dyn StoreTx,
        run_id: i64,
        by: &str,
        report: &mut ProcessorReport,
    ) -> AppResult<WorkflowRun> {
        let mut run = tx.load_run(run_id).await?;
        run.add_info(
            RunMessage::WorkflowStopped { by: by.to_string() },
            run.last_sub_number,
        );
        tx.update_run(&run).await?;

        let reason = format!("stopped by {}", by);
        let mut stopped = HashSet::new();
        loop {
            let live: Vec<i64> = run
                .node_runs
                .values()
                .flat_map(|runs| runs.iter())
                .filter(|nr| !nr.status.is_terminal() && !stopped.contains(&nr.id))
                .map(|nr| nr.id)
                .collect();
            if live.is_empty() {
                break;
            }
            for node_run_id in live {
                stopped.insert(node_run_id);
                self.stop_node_run(tx, node_run_id, &reason, report).await?;
            }
            run = tx.load_run(run_id).await?;
        }

        self.update_run_status(tx, &mut run, report).await?;
        info!(run_id, status = %run.status, by, "Run stopped");
        Ok(run)
    }

    async fn stop_job_run(
        &self,
        tx: &mut dyn StoreTx,
        job_id: i64,
        reason: &str,
        report: &mut ProcessorReport,
    ) -> AppResult<()> {
        if tx.lock_job_run_status(job_id).await?.is_terminal() {
            return Ok(());
        }
        self.add_spawn_infos(
            tx,
            job_id,
            vec![SpawnMessage::JobStopped {
                reason: reason.to_string(),
            }],
        )
        .await?;
        let mut job = tx.load_job_run(job_id).await?;
        self.update_job_status(tx, &mut job, Status::Stopped, report)
            .await?;
        Ok(())
    }
}

/// Mark unfinished stages and their unfinished jobs as stopped.
fn stop_stages(node_run: &mut NodeRun) -> bool {
    let now = Utc::now();
    let mut changed = false;
    for stage in &mut node_run.stages {
        for run_job in stage.run_jobs.iter_mut().filter(|j| !j.status.is_terminal()) {
            run_job.status = Status::Stopped;
            run_job.done = Some(now);
            changed = true;
        }
        if !stage.status.map_or(false, |s| s.is_terminal()) {
            stage.status = Some(Status::Stopped);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{job_for, orchestrator, start_run, ScriptedHooks};
    use crate::store::{MemoryStore, Store};
    use crate::workflow::fixtures;
    use tokio_test::assert_ok;

    async fn stop(
        store: &MemoryStore,
        engine: &WorkflowOrchestrator,
        node_run_id: i64,
    ) -> (bool, ProcessorReport) {
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let stopped = assert_ok!(
            engine
                .stop_node_run(tx.as_mut(), node_run_id, "stopped by jdoe", &mut report)
                .await
        );
        tx.commit().await.unwrap();
        (stopped, report)
    }

    async fn load(store: &MemoryStore, run_id: i64) -> WorkflowRun {
        let mut tx = store.begin().await.unwrap();
        tx.load_run(run_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_stop_building_node_run_purges_jobs() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let mut wf = fixtures::linear_workflow();
        wf.pipelines.insert(
            10,
            fixtures::pipeline(10, "build", &[("compile", &["make", "lint"]), ("package", &["tar"])]),
        );
        let run_id = start_run(&store, &engine, wf).await;

        let make = job_for(&store, "make").unwrap();
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let mut job = tx.load_job_run(make.id).await.unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let build_id = load(&store, run_id).await.latest_node_run(1).unwrap().id;
        let (stopped, report) = stop(&store, &engine, build_id).await;
        assert!(stopped);
        assert!(store.job_runs().is_empty());

        let run = load(&store, run_id).await;
        assert_eq!(run.status, Status::Stopped);
        let build = run.latest_node_run(1).unwrap();
        assert_eq!(build.status, Status::Stopped);
        assert_eq!(build.stages[0].status, Some(Status::Stopped));
        assert_eq!(build.stages[1].status, Some(Status::Stopped));
        assert!(build.stages[0]
            .run_jobs
            .iter()
            .all(|j| j.status == Status::Stopped));
        assert!(run.latest_node_run(2).is_none());
        assert_eq!(build.triggers_run.get(&2), Some(&Status::NeverBuilt));
        assert!(!report.events().is_empty());

        let (again, _) = stop(&store, &engine, build_id).await;
        assert!(!again);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_outgoing_hook() {
        let store = MemoryStore::new();
        let hooks = ScriptedHooks::accepting();
        let engine = orchestrator(hooks.clone());
        let run_id = start_run(&store, &engine, fixtures::hook_workflow()).await;
        let setup = job_for(&store, "setup").unwrap();
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let mut job = tx.load_job_run(setup.id).await.unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
            .await
            .unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Success, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let notify = load(&store, run_id).await.latest_node_run(2).unwrap().clone();
        let execution_id = notify.outgoing_hook.as_ref().unwrap().execution_id.clone().unwrap();
        let (stopped, _) = stop(&store, &engine, notify.id).await;
        assert!(stopped);
        assert_eq!(hooks.stopped(), vec![execution_id]);

        let run = load(&store, run_id).await;
        let notify = run.latest_node_run(2).unwrap();
        assert_eq!(notify.status, Status::Stopped);
        let callback = notify.outgoing_hook.as_ref().unwrap().callback.as_ref().unwrap();
        assert_eq!(callback.status, Status::Stopped);
        assert!(run.latest_node_run(3).is_none());
        assert_eq!(run.status, Status::Stopped);
    }

    #[tokio::test]
    async fn test_stop_run_stops_every_live_node_run() {
        let store = MemoryStore::new();
        let engine = orchestrator(ScriptedHooks::accepting());
        let run_id = start_run(&store, &engine, fixtures::join_workflow()).await;
        let setup = job_for(&store, "setup").unwrap();
        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let mut job = tx.load_job_run(setup.id).await.unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Building, &mut report)
            .await
            .unwrap();
        engine
            .update_job_status(tx.as_mut(), &mut job, Status::Success, &mut report)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut report = ProcessorReport::new();
        let run = assert_ok!(engine.stop_run(tx.as_mut(), run_id, "jdoe", &mut report).await);
        tx.commit().await.unwrap();

        assert_eq!(run.status, Status::Stopped);
        assert_eq!(run.latest_node_run(1).unwrap().status, Status::Success);
        assert_eq!(run.latest_node_run(2).unwrap().status, Status::Stopped);
        assert_eq!(run.latest_node_run(3).unwrap().status, Status::Stopped);
        assert!(run.latest_node_run(4).is_none());
        assert!(run
            .infos
            .iter()
            .any(|i| i.message == RunMessage::WorkflowStopped { by: "jdoe".to_string() }));
        assert!(store.job_runs().is_empty());
    }
}
