//! PostgreSQL persistence for the run engine.
//!
//! [`PgStore`] implements [`crate::store::Store`] on top of the query
//! functions in [`queries`]; the schema lives in `schema.sql` and is applied
//! at startup.

pub mod models;
pub mod pool;
pub mod postgres;
pub mod queries;

pub use pool::{create_pool, DbPool};
pub use postgres::PgStore;
