//! Job bookings shared through a NATS JetStream K/V bucket.
//!
//! One key per job (`job.<id>`) holding the booking agent. The bucket's
//! `max_age` is the booking lifetime, so NATS expires stale bookings and
//! every control plane on the server sees the same reservations.

use std::time::Duration;

use async_nats::jetstream::{
    self,
    kv::{self, CreateErrorKind},
};
use async_trait::async_trait;

use crate::db::models::AgentRef;
use crate::engine::bookings::{already_booked, JobBookings};
use crate::error::{AppError, AppResult};
use crate::nats::publisher::NatsError;

pub(crate) fn booking_key(job_id: i64) -> String {
    format!("job.{}", job_id)
}

/// Bookings backed by NATS JetStream K/V
#[derive(Clone)]
pub struct NatsJobBookings {
    store: kv::Store,
    bucket: String,
}

impl NatsJobBookings {
    /// Attach to the bookings bucket, creating it with `ttl` as entry lifetime.
    pub async fn connect(
        client: async_nats::Client,
        bucket: &str,
        ttl: Duration,
    ) -> Result<Self, NatsError> {
        let js = jetstream::new(client);
        let store = match js.get_key_value(bucket).await {
            Ok(store) => {
                tracing::debug!(bucket = %bucket, "Using existing K/V bucket");
                store
            }
            Err(_) => {
                let store = js
                    .create_key_value(kv::Config {
                        bucket: bucket.to_string(),
                        description: "Advisory job bookings".to_string(),
                        max_value_size: 1024,
                        history: 1,
                        max_age: ttl,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| NatsError::KeyValue(e.to_string()))?;
                tracing::info!(bucket = %bucket, ttl_secs = ttl.as_secs(), "Created K/V bucket");
                store
            }
        };

        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    async fn holder(&self, key: &str) -> AppResult<Option<AgentRef>> {
        let entry = self
            .store
            .get(key)
            .await
            .map_err(|e| NatsError::KeyValue(e.to_string()))?;
        let Some(bytes) = entry else {
            return Ok(None);
        };

        match serde_json::from_slice::<AgentRef>(&bytes) {
            Ok(agent) => Ok(Some(agent)),
            Err(e) => {
                tracing::warn!(bucket = %self.bucket, key, error = %e, "Ignoring malformed booking");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl JobBookings for NatsJobBookings {
    async fn book(&self, job_id: i64, agent: &AgentRef) -> AppResult<()> {
        let key = booking_key(job_id);
        let value = serde_json::to_vec(agent)?;

        match self.store.create(&key, value.clone().into()).await {
            Ok(_) => {}
            Err(e) if matches!(e.kind(), CreateErrorKind::AlreadyExists) => {
                match self.holder(&key).await? {
                    Some(holder) if holder.id != agent.id => {
                        return Err(already_booked(job_id, &holder));
                    }
                    _ => {
                        self.store
                            .put(&key, value.into())
                            .await
                            .map_err(|e| NatsError::KeyValue(e.to_string()))?;
                    }
                }
            }
            Err(e) => return Err(NatsError::KeyValue(e.to_string()).into()),
        }

        tracing::debug!(job_id, agent = %agent.name, "Job booked");
        Ok(())
    }

    async fn booked_by(&self, job_id: i64) -> AppResult<Option<AgentRef>> {
        self.holder(&booking_key(job_id)).await
    }

    async fn free(&self, job_id: i64) -> AppResult<()> {
        let key = booking_key(job_id);
        if self.holder(&key).await?.is_none() {
            return Err(AppError::NotFound(format!("booking for job {}", job_id)));
        }
        self.store
            .delete(&key)
            .await
            .map_err(|e| NatsError::KeyValue(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_booking_key() {
        assert_eq!(booking_key(42), "job.42");
    }
}
