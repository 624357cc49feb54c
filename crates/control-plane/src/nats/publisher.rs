//! NATS run event publisher.
//!
//! Events land on `<prefix>.run`, `<prefix>.node_run` and `<prefix>.job_run`
//! in a JetStream stream named after the prefix, so observers can replay
//! recent history.

use std::time::Duration;

use async_nats::jetstream::{self, Context};
use async_trait::async_trait;
use thiserror::Error;

use crate::engine::RunEvent;
use crate::error::{AppError, AppResult};
use crate::services::events::EventPublisher;

/// Errors that can occur during NATS operations.
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("Publish error: {0}")]
    Publish(String),

    #[error("Consume error: {0}")]
    Consume(String),

    #[error("K/V error: {0}")]
    KeyValue(String),
}

impl From<NatsError> for AppError {
    fn from(err: NatsError) -> Self {
        AppError::Nats(err.to_string())
    }
}

/// Ensure the JetStream stream exists.
pub(crate) async fn ensure_stream(
    js: &Context,
    stream: &str,
    subjects: Vec<String>,
    max_age: Duration,
) -> Result<(), NatsError> {
    match js.get_stream(stream).await {
        Ok(_) => {
            tracing::debug!(stream = %stream, "Using existing NATS stream");
            Ok(())
        }
        Err(_) => {
            let config = jetstream::stream::Config {
                name: stream.to_string(),
                subjects: subjects.clone(),
                max_age,
                storage: jetstream::stream::StorageType::File,
                ..Default::default()
            };

            js.create_stream(config)
                .await
                .map_err(|e| NatsError::JetStream(e.to_string()))?;

            tracing::info!(stream = %stream, subjects = ?subjects, "Created NATS stream");
            Ok(())
        }
    }
}

/// Stream name for a subject prefix (`conduit.events` -> `conduit_events`).
pub fn stream_name(prefix: &str) -> String {
    prefix.replace(['.', '*', '>'], "_")
}

/// JetStream publisher for run events.
#[derive(Clone)]
pub struct NatsEventPublisher {
    js: Context,
    prefix: String,
}

impl NatsEventPublisher {
    /// Create a publisher and make sure its stream exists.
    pub async fn new(client: async_nats::Client, prefix: &str) -> Result<Self, NatsError> {
        let js = jetstream::new(client);
        let prefix = prefix.trim_end_matches('.').to_string();
        ensure_stream(
            &js,
            &stream_name(&prefix),
            vec![format!("{}.>", prefix)],
            Duration::from_secs(24 * 3600),
        )
        .await?;
        Ok(Self { js, prefix })
    }

    pub fn subject_for(&self, event: &RunEvent) -> String {
        format!("{}.{}", self.prefix, event.subject())
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(&self, event: &RunEvent) -> AppResult<()> {
        let payload = serde_json::to_vec(event)?;
        let subject = self.subject_for(event);

        self.js
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;

        tracing::debug!(subject = %subject, "Published run event");
        Ok(())
    }
}
