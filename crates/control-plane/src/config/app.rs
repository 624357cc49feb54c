//! Engine configuration for the Conduit Control Plane.

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `CONDUIT_`:
/// - `CONDUIT_JOB_SWEEP_INTERVAL`: Dead job sweep period in seconds (default: 30)
/// - `CONDUIT_STUCK_RUN_SWEEP_INTERVAL`: Stuck run sweep period in seconds (default: 1800)
/// - `CONDUIT_JOB_STALE_THRESHOLD`: Seconds without log output before a building job is dead (default: 900)
/// - `CONDUIT_MAX_JOB_RETRY`: Requeues allowed for a dead job before it is stopped (default: 3)
/// - `CONDUIT_NATS_URL`: NATS server URL (optional, in-process queue when absent)
/// - `CONDUIT_BOOKING_BUCKET`: JetStream K/V bucket holding job bookings (default: conduit_job_bookings)
/// - `CONDUIT_HOOK_SERVICE_URL`: Outgoing hook task service base URL (optional)
/// - `CONDUIT_LOG_FORMAT`: `text` or `json` (default: text)
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Instance name, used as the durable queue consumer name
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Dead job sweep interval in seconds
    #[serde(default = "default_job_sweep_interval")]
    pub job_sweep_interval: u64,

    /// Stuck run sweep interval in seconds
    #[serde(default = "default_stuck_run_sweep_interval")]
    pub stuck_run_sweep_interval: u64,

    /// Age in seconds after which a non-terminal node run without jobs is reprocessed
    #[serde(default = "default_stuck_run_threshold")]
    pub stuck_run_threshold: u64,

    /// Seconds without log activity before a building job is considered dead
    #[serde(default = "default_job_stale_threshold")]
    pub job_stale_threshold: u64,

    /// Maximum number of requeues for a dead job
    #[serde(default = "default_max_job_retry")]
    pub max_job_retry: i32,

    /// Job booking lifetime in seconds
    #[serde(default = "default_booking_ttl")]
    pub booking_ttl: u64,

    /// Delay before a run request that hit a locked row is produced again
    #[serde(default = "default_lock_retry_delay_ms")]
    pub lock_retry_delay_ms: u64,

    /// NATS URL (optional)
    #[serde(default)]
    pub nats_url: Option<String>,

    /// JetStream K/V bucket for job bookings
    #[serde(default = "default_booking_bucket")]
    pub booking_bucket: String,

    /// Subject carrying run change notifications
    #[serde(default = "default_run_queue_subject")]
    pub run_queue_subject: String,

    /// JetStream stream backing the run queue
    #[serde(default = "default_run_queue_stream")]
    pub run_queue_stream: String,

    /// Subject prefix for run/node run/job run events
    #[serde(default = "default_event_subject_prefix")]
    pub event_subject_prefix: String,

    /// Outgoing hook task service URL (optional)
    #[serde(default)]
    pub hook_service_url: Option<String>,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_server_name() -> String {
    "conduit-control-plane".to_string()
}

fn default_job_sweep_interval() -> u64 {
    30
}

fn default_stuck_run_sweep_interval() -> u64 {
    30 * 60
}

fn default_stuck_run_threshold() -> u64 {
    30 * 60
}

fn default_job_stale_threshold() -> u64 {
    15 * 60
}

fn default_max_job_retry() -> i32 {
    3
}

fn default_booking_ttl() -> u64 {
    120
}

fn default_lock_retry_delay_ms() -> u64 {
    500
}

fn default_booking_bucket() -> String {
    "conduit_job_bookings".to_string()
}

fn default_run_queue_subject() -> String {
    "conduit.runs".to_string()
}

fn default_run_queue_stream() -> String {
    "conduit_runs".to_string()
}

fn default_event_subject_prefix() -> String {
    "conduit.events".to_string()
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `CONDUIT_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("CONDUIT_").from_env::<AppConfig>()
    }

    pub fn job_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.job_sweep_interval)
    }

    pub fn stuck_run_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.stuck_run_sweep_interval)
    }

    pub fn booking_ttl(&self) -> Duration {
        Duration::from_secs(self.booking_ttl)
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            job_sweep_interval: default_job_sweep_interval(),
            stuck_run_sweep_interval: default_stuck_run_sweep_interval(),
            stuck_run_threshold: default_stuck_run_threshold(),
            job_stale_threshold: default_job_stale_threshold(),
            max_job_retry: default_max_job_retry(),
            booking_ttl: default_booking_ttl(),
            lock_retry_delay_ms: default_lock_retry_delay_ms(),
            nats_url: None,
            booking_bucket: default_booking_bucket(),
            run_queue_subject: default_run_queue_subject(),
            run_queue_stream: default_run_queue_stream(),
            event_subject_prefix: default_event_subject_prefix(),
            hook_service_url: None,
            log_format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.job_sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.stuck_run_sweep_interval(), Duration::from_secs(1800));
        assert_eq!(config.job_stale_threshold, 900);
        assert_eq!(config.max_job_retry, 3);
        assert!(config.nats_url.is_none());
        assert_eq!(config.booking_ttl(), Duration::from_secs(120));
        assert_eq!(config.booking_bucket, "conduit_job_bookings");
    }

    #[test]
    fn test_log_format_deserialize() {
        let format: LogFormat = serde_json::from_str("\"json\"").unwrap();
        assert_eq!(format, LogFormat::Json);
    }
}
