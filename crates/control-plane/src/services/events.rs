//! Run events for observers.
//!
//! Publishing is best effort: a failed publish is logged and never undoes
//! the committed change it describes.

use async_trait::async_trait;

use crate::engine::{ProcessorReport, RunEvent};
use crate::error::AppResult;

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &RunEvent) -> AppResult<()>;
}

/// Drops events; used when no event bus is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl EventPublisher for NoopPublisher {
    async fn publish(&self, event: &RunEvent) -> AppResult<()> {
        tracing::trace!(subject = event.subject(), "Event dropped, no event bus");
        Ok(())
    }
}

/// Publish every event of a committed report.
pub async fn publish_report(publisher: &dyn EventPublisher, report: &ProcessorReport) {
    for event in report.events() {
        if let Err(e) = publisher.publish(event).await {
            tracing::warn!(subject = event.subject(), error = %e, "Failed to publish run event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::db::models::WorkflowRun;
    use crate::engine::{RunRequest, Status};
    use crate::error::AppError;
    use crate::workflow::fixtures;

    struct FlakyPublisher {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl EventPublisher for FlakyPublisher {
        async fn publish(&self, _event: &RunEvent) -> AppResult<()> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::Nats("connection reset".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_publish_does_not_stop_the_rest() {
        let publisher = FlakyPublisher {
            attempts: AtomicUsize::new(0),
        };
        let mut report = ProcessorReport::new();
        report.enqueue(RunRequest::run(1));
        let mut run = WorkflowRun::new(fixtures::linear_workflow(), 1);
        run.status = Status::Building;
        report.add_run(&run);
        run.status = Status::Success;
        report.add_run(&run);

        publish_report(&publisher, &report).await;
        assert_eq!(publisher.attempts.load(Ordering::SeqCst), 2);
    }
}
