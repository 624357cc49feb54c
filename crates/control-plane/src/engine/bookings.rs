//! Advisory job bookings.
//!
//! An agent books a waiting job before taking it so that other agents skip
//! it. A booking expires on its own and never changes the job status.
//!
//! Control planes sharing a NATS server share bookings through a JetStream
//! K/V bucket ([`crate::nats::NatsJobBookings`]); [`MemoryBookings`] is the
//! single-instance fallback.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::db::models::AgentRef;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait JobBookings: Send + Sync {
    /// Reserve a job for an agent. Re-booking by the same agent refreshes it.
    async fn book(&self, job_id: i64, agent: &AgentRef) -> AppResult<()>;

    /// Agent currently holding a booking on the job.
    async fn booked_by(&self, job_id: i64) -> AppResult<Option<AgentRef>>;

    async fn free(&self, job_id: i64) -> AppResult<()>;

    /// Drop expired bookings. Backends with native expiry have nothing to do.
    async fn purge_expired(&self) -> AppResult<usize> {
        Ok(0)
    }
}

pub(crate) fn already_booked(job_id: i64, holder: &AgentRef) -> AppError {
    AppError::AlreadyTaken(format!("job {} is booked by {}", job_id, holder.name))
}

#[derive(Debug, Clone)]
struct Booking {
    agent: AgentRef,
    expires_at: Instant,
}

/// Bookings kept in process memory.
#[derive(Debug)]
pub struct MemoryBookings {
    ttl: Duration,
    entries: Mutex<HashMap<i64, Booking>>,
}

impl MemoryBookings {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl JobBookings for MemoryBookings {
    async fn book(&self, job_id: i64, agent: &AgentRef) -> AppResult<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(&job_id) {
            if existing.expires_at > now && existing.agent.id != agent.id {
                return Err(already_booked(job_id, &existing.agent));
            }
        }
        entries.insert(
            job_id,
            Booking {
                agent: agent.clone(),
                expires_at: now + self.ttl,
            },
        );
        tracing::debug!(job_id, agent = %agent.name, "Job booked");
        Ok(())
    }

    async fn booked_by(&self, job_id: i64) -> AppResult<Option<AgentRef>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries
            .get(&job_id)
            .filter(|b| b.expires_at > Instant::now())
            .map(|b| b.agent.clone()))
    }

    async fn free(&self, job_id: i64) -> AppResult<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.remove(&job_id) {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound(format!("booking for job {}", job_id))),
        }
    }

    async fn purge_expired(&self) -> AppResult<usize> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, b| b.expires_at > now);
        Ok(before - entries.len())
    }
}
