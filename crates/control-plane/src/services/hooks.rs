//! Outgoing hook task service client.
//!
//! Outgoing hook nodes are handed to an external task service, which later
//! reports back through [`crate::services::RunService::complete_outgoing_hook`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::workflow::{OutgoingHookConfig, Parameter};

/// Task submitted for one outgoing hook run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTaskRequest {
    pub uuid: String,
    pub run_id: i64,
    pub run_number: i64,
    pub sub_number: i64,
    pub node: String,
    pub hook: OutgoingHookConfig,
    pub parameters: Vec<Parameter>,
}

/// Handle returned by the task service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookTask {
    pub execution_id: String,
}

#[async_trait]
pub trait HookService: Send + Sync {
    async fn execute(&self, request: &HookTaskRequest) -> AppResult<HookTask>;

    /// Cancel a running task execution.
    async fn stop(&self, uuid: &str, execution_id: &str) -> AppResult<()>;
}

/// HTTP client for the task service.
#[derive(Clone)]
pub struct HttpHookService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHookService {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HookService for HttpHookService {
    async fn execute(&self, request: &HookTaskRequest) -> AppResult<HookTask> {
        let response = self
            .client
            .post(format!("{}/task/execute", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| AppError::ExternalService(e.to_string()))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::ACCEPTED => response
                .json::<HookTask>()
                .await
                .map_err(|e| AppError::ExternalService(format!("invalid task response: {}", e))),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AppError::ExternalService(format!(
                    "task service returned {}: {}",
                    status, body
                )))
            }
        }
    }

    async fn stop(&self, uuid: &str, execution_id: &str) -> AppResult<()> {
        let response = self
            .client
            .post(self.stop_url(uuid, execution_id))
            .send()
            .await
            .map_err(|e| AppError::ExternalService(e.to_string()))?;

        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::ExternalService(format!(
            "task service returned {} on stop: {}",
            status, body
        )))
    }
}

impl HttpHookService {
    fn stop_url(&self, uuid: &str, execution_id: &str) -> String {
        format!("{}/task/{}/execution/{}/stop", self.base_url, uuid, execution_id)
    }
}

/// Used when no task service is configured: every hook fails its node.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledHookService;

#[async_trait]
impl HookService for DisabledHookService {
    async fn execute(&self, request: &HookTaskRequest) -> AppResult<HookTask> {
        Err(AppError::ExternalService(format!(
            "no task service configured for hook {}",
            request.hook.model
        )))
    }

    async fn stop(&self, _uuid: &str, _execution_id: &str) -> AppResult<()> {
        Ok(())
    }
}
