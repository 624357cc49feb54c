//! Dead run reconciler.
//!
//! Two periodic sweeps repair what the event flow cannot:
//! - building jobs whose agent vanished or went silent are requeued, then
//!   stopped once they exhausted their retries
//! - non-terminal node runs that nothing touched for a long time are sent
//!   back through the dispatcher
//!
//! Every job is handled in its own transaction. A job whose run is locked
//! is left for the next sweep.

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::db::models::{DeadJob, SpawnMessage};
use crate::engine::{ProcessorReport, RunRequest, Status};
use crate::error::AppResult;
use crate::state::AppState;

pub struct Reconciler {
    state: AppState,
}

impl Reconciler {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Run both sweeps on their intervals until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut jobs = tokio::time::interval(self.state.config.job_sweep_interval());
        jobs.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stuck = tokio::time::interval(self.state.config.stuck_run_sweep_interval());
        stuck.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            job_sweep_secs = self.state.config.job_sweep_interval,
            stuck_sweep_secs = self.state.config.stuck_run_sweep_interval,
            "Reconciler started"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = jobs.tick() => match self.sweep_dead_jobs().await {
                    Ok(0) => {}
                    Ok(handled) => info!(handled, "Dead jobs handled"),
                    Err(e) => error!(error = %e, "Dead job sweep failed"),
                },
                _ = stuck.tick() => match self.sweep_stuck_runs().await {
                    Ok(0) => {}
                    Ok(requeued) => info!(requeued, "Stuck node runs requeued"),
                    Err(e) => error!(error = %e, "Stuck run sweep failed"),
                },
            }
        }
        info!("Reconciler stopped");
    }

    /// Requeue or stop building jobs that lost their agent.
    pub async fn sweep_dead_jobs(&self) -> AppResult<usize> {
        let expired = self.state.bookings.purge_expired().await?;
        if expired > 0 {
            debug!(expired, "Expired job bookings dropped");
        }

        let stale_before =
            Utc::now() - chrono::Duration::seconds(self.state.config.job_stale_threshold as i64);
        let mut tx = self.state.store.begin().await?;
        let dead = tx.find_dead_jobs(stale_before).await?;
        tx.rollback().await?;

        let mut handled = 0;
        for dead_job in dead {
            let job_id = dead_job.job.id;
            match self.handle_dead_job(dead_job).await {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(e) if e.is_retryable() => {
                    debug!(job_id, "Run locked, dead job left for next sweep");
                }
                Err(e) => warn!(job_id, error = %e, "Failed to handle dead job"),
            }
        }
        Ok(handled)
    }

    async fn handle_dead_job(&self, dead: DeadJob) -> AppResult<bool> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(dead.job.workflow_run_id).await?;
        tx.lock_node_run(dead.job.node_run_id).await?;

        tx.lock_job_run_status(dead.job.id).await?;
        let mut job = tx.load_job_run(dead.job.id).await?;
        if job.status != Status::Building {
            tx.rollback().await?;
            return Ok(false);
        }

        let reason = dead.reason.to_string();
        let mut report = ProcessorReport::new();
        if job.retry < self.state.config.max_job_retry {
            self.state
                .engine
                .restart_job(tx.as_mut(), &mut job, &reason, &mut report)
                .await?;
        } else {
            warn!(job_run_id = job.id, retry = job.retry, %reason, "Stopping dead job");
            self.state
                .engine
                .add_spawn_infos(tx.as_mut(), job.id, vec![SpawnMessage::JobStopped { reason }])
                .await?;
            self.state
                .engine
                .update_job_status(tx.as_mut(), &mut job, Status::Stopped, &mut report)
                .await?;
        }
        self.state.commit(tx, report).await?;

        if self.state.bookings.free(job.id).await.is_ok() {
            debug!(job_run_id = job.id, "Booking released");
        }
        Ok(true)
    }

    /// Send long-idle node runs back to the dispatcher.
    pub async fn sweep_stuck_runs(&self) -> AppResult<usize> {
        let older_than =
            Utc::now() - chrono::Duration::seconds(self.state.config.stuck_run_threshold as i64);
        let mut tx = self.state.store.begin().await?;
        let stuck = tx.find_stuck_node_runs(older_than).await?;
        tx.rollback().await?;

        for node_run in &stuck {
            debug!(
                run_id = node_run.workflow_run_id,
                node_run_id = node_run.id,
                node = %node_run.node_name,
                "Requeueing stuck node run"
            );
            self.state
                .queue
                .produce(RunRequest::node_run(node_run.workflow_run_id, node_run.id))
                .await?;
        }
        Ok(stuck.len())
    }
}
