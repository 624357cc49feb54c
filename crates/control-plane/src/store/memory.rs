//! In-memory store.
//!
//! Transactions read through a private overlay of their own writes and
//! publish it on commit. Row locks live in a table shared by all
//! transactions and are released on commit, rollback or drop.
//!
//! Column-scoped job writes are kept as patches and replayed on the
//! committed row at commit, the way an `UPDATE ... SET col = ...` lands on
//! whatever the row holds by then.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::models::{Agent, DeadJob, DeadReason, JobRun, NodeRun, SpawnInfo, WorkflowRun};
use crate::engine::state::Status;
use crate::error::{AppError, AppResult};
use crate::store::{Store, StoreTx};
use crate::workflow::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LockKey {
    Run(i64),
    NodeRun(i64),
}

#[derive(Debug, Default, Clone)]
struct MemoryState {
    /// Runs stored without their node runs.
    runs: BTreeMap<i64, WorkflowRun>,
    node_runs: BTreeMap<i64, NodeRun>,
    job_runs: BTreeMap<i64, JobRun>,
    agents: BTreeMap<String, Agent>,
    run_numbers: HashMap<i64, i64>,
    next_id: i64,
}

impl MemoryState {
    fn allocate_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Clone)]
enum JobPatch {
    LogAt(DateTime<Utc>),
    SpawnInfos(Vec<SpawnInfo>),
}

impl JobPatch {
    fn apply(&self, job: &mut JobRun) {
        match self {
            Self::LogAt(at) => {
                if job.status == Status::Building {
                    job.last_log_at = Some(*at);
                }
            }
            Self::SpawnInfos(infos) => job.spawn_infos.extend(infos.iter().cloned()),
        }
    }
}

/// Pending writes of one transaction. `None` marks a deleted job row.
///
/// Patches only exist for job rows the transaction did not write whole.
#[derive(Debug, Default)]
struct Overlay {
    runs: BTreeMap<i64, WorkflowRun>,
    node_runs: BTreeMap<i64, NodeRun>,
    job_runs: BTreeMap<i64, Option<JobRun>>,
    job_patches: Vec<(i64, JobPatch)>,
    run_numbers: HashMap<i64, i64>,
}

impl Overlay {
    fn apply(self, state: &mut MemoryState) {
        state.runs.extend(self.runs);
        state.node_runs.extend(self.node_runs);
        for (id, job) in self.job_runs {
            match job {
                Some(job) => {
                    state.job_runs.insert(id, job);
                }
                None => {
                    state.job_runs.remove(&id);
                }
            }
        }
        for (id, patch) in self.job_patches {
            if let Some(job) = state.job_runs.get_mut(&id) {
                patch.apply(job);
            }
        }
        for (workflow_id, number) in self.run_numbers {
            let current = state.run_numbers.entry(workflow_id).or_default();
            *current = (*current).max(number);
        }
    }
}

/// Store kept in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<Mutex<HashSet<LockKey>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register or refresh an execution agent.
    pub fn upsert_agent(&self, id: &str, name: &str) {
        self.state().agents.insert(
            id.to_string(),
            Agent {
                id: id.to_string(),
                name: name.to_string(),
                disabled: false,
                last_beat: Utc::now(),
            },
        );
    }

    pub fn disable_agent(&self, id: &str) {
        if let Some(agent) = self.state().agents.get_mut(id) {
            agent.disabled = true;
        }
    }

    pub fn remove_agent(&self, id: &str) {
        self.state().agents.remove(id);
    }

    /// Committed job rows, for inspection.
    pub fn job_runs(&self) -> Vec<JobRun> {
        self.state().job_runs.values().cloned().collect()
    }

    /// Committed node runs, for inspection.
    pub fn node_runs(&self) -> Vec<NodeRun> {
        self.state().node_runs.values().cloned().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> AppResult<Box<dyn StoreTx>> {
        Ok(Box::new(MemoryTx {
            state: self.state.clone(),
            locks: self.locks.clone(),
            held: Vec::new(),
            overlay: Overlay::default(),
        }))
    }
}

struct MemoryTx {
    state: Arc<Mutex<MemoryState>>,
    locks: Arc<Mutex<HashSet<LockKey>>>,
    held: Vec<LockKey>,
    overlay: Overlay,
}

impl MemoryTx {
    fn shared(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self, run_id: i64) -> Option<WorkflowRun> {
        self.overlay
            .runs
            .get(&run_id)
            .cloned()
            .or_else(|| self.shared().runs.get(&run_id).cloned())
    }

    fn node_run(&self, node_run_id: i64) -> Option<NodeRun> {
        self.overlay
            .node_runs
            .get(&node_run_id)
            .cloned()
            .or_else(|| self.shared().node_runs.get(&node_run_id).cloned())
    }

    fn job_run(&self, job_id: i64) -> Option<JobRun> {
        match self.overlay.job_runs.get(&job_id) {
            Some(job) => job.clone(),
            None => {
                let mut job = self.shared().job_runs.get(&job_id).cloned()?;
                self.apply_patches(&mut job);
                Some(job)
            }
        }
    }

    fn apply_patches(&self, job: &mut JobRun) {
        let job_id = job.id;
        for (_, patch) in self.overlay.job_patches.iter().filter(|(id, _)| *id == job_id) {
            patch.apply(job);
        }
    }

    fn patch_job(&mut self, job_id: i64, patch: JobPatch) {
        match self.overlay.job_runs.get_mut(&job_id) {
            Some(Some(job)) => patch.apply(job),
            Some(None) => {}
            None => self.overlay.job_patches.push((job_id, patch)),
        }
    }

    fn all_node_runs(&self) -> Vec<NodeRun> {
        let mut merged = self.shared().node_runs.clone();
        merged.extend(
            self.overlay
                .node_runs
                .iter()
                .map(|(id, nr)| (*id, nr.clone())),
        );
        merged.into_values().collect()
    }

    fn all_job_runs(&self) -> Vec<JobRun> {
        let mut merged = self.shared().job_runs.clone();
        for job in merged.values_mut() {
            self.apply_patches(job);
        }
        for (id, job) in &self.overlay.job_runs {
            match job {
                Some(job) => {
                    merged.insert(*id, job.clone());
                }
                None => {
                    merged.remove(id);
                }
            }
        }
        merged.into_values().collect()
    }

    fn acquire(&mut self, key: LockKey) -> AppResult<()> {
        if self.held.contains(&key) {
            return Ok(());
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if !locks.insert(key) {
            return Err(AppError::Locked(format!("{:?}", key)));
        }
        self.held.push(key);
        Ok(())
    }

    fn release(&mut self) {
        if self.held.is_empty() {
            return;
        }
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        for key in self.held.drain(..) {
            locks.remove(&key);
        }
    }
}

impl Drop for MemoryTx {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl StoreTx for MemoryTx {
    async fn next_run_number(&mut self, workflow_id: i64) -> AppResult<i64> {
        let committed = self
            .shared()
            .run_numbers
            .get(&workflow_id)
            .copied()
            .unwrap_or(0);
        let pending = self.overlay.run_numbers.get(&workflow_id).copied().unwrap_or(0);
        let number = committed.max(pending) + 1;
        self.overlay.run_numbers.insert(workflow_id, number);
        Ok(number)
    }

    async fn insert_run(&mut self, run: &mut WorkflowRun) -> AppResult<()> {
        run.id = self.shared().allocate_id();
        let mut stored = run.clone();
        stored.node_runs.clear();
        self.overlay.runs.insert(run.id, stored);
        Ok(())
    }

    async fn load_run(&mut self, run_id: i64) -> AppResult<WorkflowRun> {
        let mut run = self
            .run(run_id)
            .ok_or_else(|| AppError::NotFound(format!("workflow run {}", run_id)))?;
        for node_run in self
            .all_node_runs()
            .into_iter()
            .filter(|nr| nr.workflow_run_id == run_id)
        {
            run.put_node_run(node_run);
        }
        Ok(run)
    }

    async fn lock_run(&mut self, run_id: i64) -> AppResult<()> {
        if self.run(run_id).is_none() {
            return Err(AppError::NotFound(format!("workflow run {}", run_id)));
        }
        self.acquire(LockKey::Run(run_id))
    }

    async fn update_run(&mut self, run: &WorkflowRun) -> AppResult<()> {
        if self.run(run.id).is_none() {
            return Err(AppError::NotFound(format!("workflow run {}", run.id)));
        }
        let mut stored = run.clone();
        stored.node_runs.clear();
        stored.last_modified = Utc::now();
        self.overlay.runs.insert(run.id, stored);
        Ok(())
    }

    async fn node_run_exists(
        &mut self,
        run_id: i64,
        node_id: NodeId,
        sub_number: i64,
    ) -> AppResult<bool> {
        Ok(self.all_node_runs().iter().any(|nr| {
            nr.workflow_run_id == run_id && nr.node_id == node_id && nr.sub_number == sub_number
        }))
    }

    async fn insert_node_run(&mut self, node_run: &mut NodeRun) -> AppResult<()> {
        if self
            .node_run_exists(node_run.workflow_run_id, node_run.node_id, node_run.sub_number)
            .await?
        {
            return Err(AppError::Conflict(format!(
                "node run for node {} sub number {} already exists",
                node_run.node_id, node_run.sub_number
            )));
        }
        node_run.id = self.shared().allocate_id();
        self.overlay.node_runs.insert(node_run.id, node_run.clone());
        Ok(())
    }

    async fn load_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun> {
        self.node_run(node_run_id)
            .ok_or_else(|| AppError::NotFound(format!("node run {}", node_run_id)))
    }

    async fn lock_node_run(&mut self, node_run_id: i64) -> AppResult<NodeRun> {
        let node_run = self.load_node_run(node_run_id).await?;
        self.acquire(LockKey::NodeRun(node_run_id))?;
        Ok(node_run)
    }

    async fn update_node_run(&mut self, node_run: &NodeRun) -> AppResult<()> {
        if self.node_run(node_run.id).is_none() {
            return Err(AppError::NotFound(format!("node run {}", node_run.id)));
        }
        self.overlay.node_runs.insert(node_run.id, node_run.clone());
        Ok(())
    }

    async fn count_building_node_runs(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<i64> {
        let count = self
            .all_node_runs()
            .iter()
            .filter(|nr| {
                nr.workflow_id == workflow_id
                    && nr.node_id == node_id
                    && nr.workflow_run_id != exclude_run_id
                    && nr.status == Status::Building
            })
            .count();
        Ok(count as i64)
    }

    async fn next_mutex_waiter(
        &mut self,
        workflow_id: i64,
        node_id: NodeId,
        exclude_run_id: i64,
    ) -> AppResult<Option<NodeRun>> {
        Ok(self
            .all_node_runs()
            .into_iter()
            .filter(|nr| {
                nr.workflow_id == workflow_id
                    && nr.node_id == node_id
                    && nr.workflow_run_id != exclude_run_id
                    && nr.status == Status::Waiting
                    && nr.stages.iter().all(|s| s.status.is_none())
            })
            .min_by_key(|nr| (nr.number, nr.sub_number)))
    }

    async fn find_stuck_node_runs(&mut self, older_than: DateTime<Utc>) -> AppResult<Vec<NodeRun>> {
        let jobs = self.all_job_runs();
        Ok(self
            .all_node_runs()
            .into_iter()
            .filter(|nr| !nr.status.is_terminal() && nr.last_modified < older_than)
            .filter(|nr| {
                !jobs
                    .iter()
                    .any(|j| j.node_run_id == nr.id && !j.status.is_terminal())
            })
            .collect())
    }

    async fn insert_job_run(&mut self, job: &mut JobRun) -> AppResult<()> {
        job.id = self.shared().allocate_id();
        self.overlay.job_runs.insert(job.id, Some(job.clone()));
        Ok(())
    }

    async fn load_job_run(&mut self, job_id: i64) -> AppResult<JobRun> {
        self.job_run(job_id)
            .ok_or_else(|| AppError::NotFound(format!("job run {}", job_id)))
    }

    async fn lock_job_run_status(&mut self, job_id: i64) -> AppResult<Status> {
        self.load_job_run(job_id).await.map(|job| job.status)
    }

    async fn update_job_run(&mut self, job: &JobRun) -> AppResult<()> {
        if self.job_run(job.id).is_none() {
            return Err(AppError::NotFound(format!("job run {}", job.id)));
        }
        self.overlay.job_patches.retain(|(id, _)| *id != job.id);
        self.overlay.job_runs.insert(job.id, Some(job.clone()));
        Ok(())
    }

    async fn touch_job_run_log(&mut self, job_id: i64, at: DateTime<Utc>) -> AppResult<bool> {
        match self.job_run(job_id) {
            Some(job) if job.status == Status::Building => {
                self.patch_job(job_id, JobPatch::LogAt(at));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_job_spawn_infos(&mut self, job_id: i64, infos: &[SpawnInfo]) -> AppResult<()> {
        if self.job_run(job_id).is_none() {
            return Err(AppError::NotFound(format!("job run {}", job_id)));
        }
        self.patch_job(job_id, JobPatch::SpawnInfos(infos.to_vec()));
        Ok(())
    }

    async fn delete_job_runs(&mut self, node_run_id: i64) -> AppResult<u64> {
        let ids: Vec<i64> = self
            .all_job_runs()
            .iter()
            .filter(|j| j.node_run_id == node_run_id)
            .map(|j| j.id)
            .collect();
        for id in &ids {
            self.overlay.job_runs.insert(*id, None);
        }
        Ok(ids.len() as u64)
    }

    async fn find_dead_jobs(&mut self, stale_before: DateTime<Utc>) -> AppResult<Vec<DeadJob>> {
        let agents = self.shared().agents.clone();
        Ok(self
            .all_job_runs()
            .into_iter()
            .filter(|j| j.status == Status::Building)
            .filter_map(|job| {
                let agent_alive = job
                    .agent
                    .as_ref()
                    .and_then(|a| agents.get(&a.id))
                    .map_or(false, |a| !a.disabled);
                let reason = if !agent_alive {
                    DeadReason::AgentGone
                } else if job.last_activity() < stale_before {
                    DeadReason::NoLogs
                } else {
                    return None;
                };
                Some(DeadJob { job, reason })
            })
            .collect())
    }

    async fn commit(mut self: Box<Self>) -> AppResult<()> {
        let overlay = std::mem::take(&mut self.overlay);
        overlay.apply(&mut self.shared());
        self.release();
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> AppResult<()> {
        self.overlay = Overlay::default();
        self.release();
        Ok(())
    }
}
