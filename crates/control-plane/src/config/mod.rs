//! Configuration module for the Conduit Control Plane.
//!
//! This module provides configuration loading from environment variables
//! using the `envy` crate for type-safe environment variable parsing.

mod app;
mod database;

pub use app::{AppConfig, LogFormat};
pub use database::DatabaseConfig;
