//! Helpers shared by engine and service tests.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::db::models::{JobRun, ManualTrigger, RunTrigger, WorkflowRun};
use crate::engine::orchestrator::{ProcessStart, WorkflowOrchestrator};
use crate::engine::report::ProcessorReport;
use crate::error::{AppError, AppResult};
use crate::services::hooks::{HookService, HookTask, HookTaskRequest};
use crate::store::{MemoryStore, Store};
use crate::workflow::Workflow;

/// Hook service answering every request the same way.
#[derive(Clone)]
pub struct ScriptedHooks {
    fail: bool,
    requests: Arc<Mutex<Vec<HookTaskRequest>>>,
    stopped: Arc<Mutex<Vec<String>>>,
}

impl ScriptedHooks {
    pub fn accepting() -> Self {
        Self {
            fail: false,
            requests: Arc::default(),
            stopped: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            requests: Arc::default(),
            stopped: Arc::default(),
        }
    }

    pub fn requests(&self) -> Vec<HookTaskRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Execution IDs asked to stop.
    pub fn stopped(&self) -> Vec<String> {
        self.stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl HookService for ScriptedHooks {
    async fn execute(&self, request: &HookTaskRequest) -> AppResult<HookTask> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        if self.fail {
            return Err(AppError::ExternalService("task service unavailable".into()));
        }
        Ok(HookTask {
            execution_id: format!("exec-{}", request.uuid),
        })
    }

    async fn stop(&self, _uuid: &str, execution_id: &str) -> AppResult<()> {
        self.stopped
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(execution_id.to_string());
        Ok(())
    }
}

pub fn orchestrator(hooks: ScriptedHooks) -> WorkflowOrchestrator {
    WorkflowOrchestrator::new(Arc::new(hooks))
}

/// Create a run and process its root, returning the run ID.
pub async fn start_run(store: &MemoryStore, engine: &WorkflowOrchestrator, workflow: Workflow) -> i64 {
    let mut tx = store.begin().await.unwrap();
    let number = tx.next_run_number(workflow.id).await.unwrap();
    let mut run = WorkflowRun::new(workflow, number);
    tx.insert_run(&mut run).await.unwrap();
    let trigger = RunTrigger::Manual(ManualTrigger {
        username: "jdoe".to_string(),
        ..Default::default()
    });
    let mut report = ProcessorReport::new();
    engine
        .process(tx.as_mut(), &mut run, ProcessStart::Root(trigger), &mut report)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    run.id
}

/// Live job row for a job name.
pub fn job_for(store: &MemoryStore, name: &str) -> Option<JobRun> {
    store.job_runs().into_iter().find(|j| j.job.name == name)
}
