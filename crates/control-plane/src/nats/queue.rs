//! NATS JetStream run queue.
//!
//! Every control plane pulls from one durable consumer, so a request is
//! handled by a single instance. Messages are acknowledged on receipt: a
//! request lost to a crash is recovered by the stuck run sweep.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as ConsumerConfig, Consumer},
    Context,
};
use async_trait::async_trait;
use futures::StreamExt;

use crate::engine::RunRequest;
use crate::error::AppResult;
use crate::nats::publisher::{ensure_stream, NatsError};
use crate::services::queue::RunQueue;

/// How long one pull waits for a request.
const POLL_WINDOW: Duration = Duration::from_secs(5);

pub struct NatsRunQueue {
    js: Context,
    subject: String,
    consumer: Consumer<ConsumerConfig>,
}

impl NatsRunQueue {
    /// Create or attach to the run request stream and its durable consumer.
    pub async fn connect(
        client: async_nats::Client,
        subject: &str,
        stream: &str,
        consumer: &str,
    ) -> Result<Self, NatsError> {
        let js = jetstream::new(client);
        ensure_stream(&js, stream, vec![subject.to_string()], Duration::from_secs(3600)).await?;

        let handle = js
            .get_stream(stream)
            .await
            .map_err(|e| NatsError::JetStream(e.to_string()))?;
        let consumer = match handle.get_consumer(consumer).await {
            Ok(existing) => existing,
            Err(_) => {
                let config = ConsumerConfig {
                    durable_name: Some(consumer.to_string()),
                    filter_subject: subject.to_string(),
                    ..Default::default()
                };
                let created = handle
                    .create_consumer(config)
                    .await
                    .map_err(|e| NatsError::JetStream(e.to_string()))?;
                tracing::info!(consumer = %consumer, "Created NATS consumer");
                created
            }
        };

        Ok(Self {
            js,
            subject: subject.to_string(),
            consumer,
        })
    }
}

#[async_trait]
impl RunQueue for NatsRunQueue {
    async fn produce(&self, request: RunRequest) -> AppResult<()> {
        let payload = serde_json::to_vec(&request)?;
        self.js
            .publish(self.subject.clone(), payload.into())
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?
            .await
            .map_err(|e| NatsError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(&self) -> AppResult<Option<RunRequest>> {
        let mut messages = self
            .consumer
            .batch()
            .max_messages(1)
            .expires(POLL_WINDOW)
            .messages()
            .await
            .map_err(|e| NatsError::Consume(e.to_string()))?;

        let Some(message) = messages.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| NatsError::Consume(e.to_string()))?;
        message
            .ack()
            .await
            .map_err(|e| NatsError::Consume(format!("Failed to ack message: {}", e)))?;

        match serde_json::from_slice::<RunRequest>(&message.payload) {
            Ok(request) => Ok(Some(request)),
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed run request");
                Ok(None)
            }
        }
    }
}
