//! Application state for the Conduit Control Plane.
//!
//! One `AppState` is built at startup and cloned into the dispatcher, the
//! reconciler and every [`crate::services::RunService`].

use std::sync::Arc;

use crate::config::AppConfig;
use crate::engine::{JobBookings, MemoryBookings, ProcessorReport, WorkflowOrchestrator};
use crate::error::AppResult;
use crate::services::events::{publish_report, EventPublisher};
use crate::services::hooks::HookService;
use crate::services::queue::RunQueue;
use crate::store::{Store, StoreTx};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Transactional run storage
    pub store: Arc<dyn Store>,

    /// Run request queue
    pub queue: Arc<dyn RunQueue>,

    /// Observability event sink
    pub events: Arc<dyn EventPublisher>,

    /// Run engine
    pub engine: Arc<WorkflowOrchestrator>,

    /// Advisory job bookings
    pub bookings: Arc<dyn JobBookings>,

    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn RunQueue>,
        events: Arc<dyn EventPublisher>,
        hooks: Arc<dyn HookService>,
        config: AppConfig,
    ) -> Self {
        Self {
            store,
            queue,
            events,
            engine: Arc::new(WorkflowOrchestrator::new(hooks)),
            bookings: Arc::new(MemoryBookings::new(config.booking_ttl())),
            config: Arc::new(config),
            start_time: std::time::Instant::now(),
        }
    }

    /// Replace the in-process bookings, e.g. with ones shared over NATS.
    pub fn with_bookings(mut self, bookings: Arc<dyn JobBookings>) -> Self {
        self.bookings = bookings;
        self
    }

    /// Get the uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Commit a transaction, then publish its events and enqueue its
    /// follow-up requests.
    ///
    /// Nothing is published for a transaction that fails to commit.
    pub async fn commit(&self, tx: Box<dyn StoreTx>, report: ProcessorReport) -> AppResult<()> {
        tx.commit().await?;
        publish_report(self.events.as_ref(), &report).await;
        for request in report.requests() {
            if let Err(e) = self.queue.produce(*request).await {
                tracing::warn!(
                    run_id = request.run_id,
                    error = %e,
                    "Failed to enqueue run request"
                );
            }
        }
        Ok(())
    }
}
