//! Run dispatcher.
//!
//! Consumes run requests and processes each run under its row lock. A
//! request that finds the run locked is produced again after a short delay,
//! so two control planes never process the same run at once and no request
//! is lost.

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::{ProcessStart, ProcessorReport, RunRequest};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub struct Dispatcher {
    state: AppState,
}

impl Dispatcher {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Consume requests until shutdown is signalled.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Run dispatcher started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                request = self.state.queue.consume() => match request {
                    Ok(Some(request)) => self.dispatch(request).await,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(error = %e, "Failed to consume run request");
                        tokio::time::sleep(self.state.config.lock_retry_delay()).await;
                    }
                },
            }
        }
        info!("Run dispatcher stopped");
    }

    /// Handle one request, requeueing it when the run is locked.
    pub async fn dispatch(&self, request: RunRequest) {
        match self.handle(request).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() => {
                debug!(run_id = request.run_id, "Run locked, request requeued");
                let queue = self.state.queue.clone();
                let delay = self.state.config.lock_retry_delay();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Err(e) = queue.produce(request).await {
                        warn!(run_id = request.run_id, error = %e, "Failed to requeue run request");
                    }
                });
            }
            Err(AppError::NotFound(what)) => {
                warn!(run_id = request.run_id, %what, "Run request dropped");
            }
            Err(e) => {
                error!(
                    run_id = request.run_id,
                    node_run_id = ?request.node_run_id,
                    error = %e,
                    "Run processing failed"
                );
            }
        }
    }

    /// Process one request in its own transaction.
    pub async fn handle(&self, request: RunRequest) -> AppResult<()> {
        let mut tx = self.state.store.begin().await?;
        tx.lock_run(request.run_id).await?;

        let mut report = ProcessorReport::new();
        match request.node_run_id {
            Some(node_run_id) => {
                let node_run = tx.lock_node_run(node_run_id).await?;
                self.state
                    .engine
                    .advance_node_run(tx.as_mut(), node_run, &mut report)
                    .await?;
            }
            None => {
                let mut run = tx.load_run(request.run_id).await?;
                self.state
                    .engine
                    .process(tx.as_mut(), &mut run, ProcessStart::Resume, &mut report)
                    .await?;
            }
        }

        self.state.commit(tx, report).await
    }
}
