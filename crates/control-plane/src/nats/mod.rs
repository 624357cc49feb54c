//! NATS JetStream integration for the Conduit Control Plane.
//!
//! - **Queue**: durable run request queue shared by every control plane
//! - **Publisher**: run, node run and job run events for observers
//! - **Bookings**: job reservations in a K/V bucket with expiring entries
//!
//! All are optional; without `CONDUIT_NATS_URL` the control plane uses an
//! in-process queue and drops events.

pub mod bookings;
pub mod publisher;
pub mod queue;

pub use bookings::NatsJobBookings;
pub use publisher::{NatsError, NatsEventPublisher};
pub use queue::NatsRunQueue;
