//! Run request queue.
//!
//! Requests say "this run needs processing". The dispatcher consumes them;
//! anything that changes a run produces them after its transaction commits.

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::engine::RunRequest;
use crate::error::{AppError, AppResult};

#[async_trait]
pub trait RunQueue: Send + Sync {
    async fn produce(&self, request: RunRequest) -> AppResult<()>;

    /// Next request, or `None` when nothing arrived within the poll window.
    async fn consume(&self) -> AppResult<Option<RunRequest>>;
}

/// In-process queue for single-node deployments and tests.
pub struct ChannelQueue {
    sender: mpsc::UnboundedSender<RunRequest>,
    receiver: Mutex<mpsc::UnboundedReceiver<RunRequest>>,
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelQueue {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Take every queued request without waiting.
    pub async fn drain(&self) -> Vec<RunRequest> {
        let mut receiver = self.receiver.lock().await;
        let mut drained = Vec::new();
        while let Ok(request) = receiver.try_recv() {
            drained.push(request);
        }
        drained
    }
}

#[async_trait]
impl RunQueue for ChannelQueue {
    async fn produce(&self, request: RunRequest) -> AppResult<()> {
        self.sender
            .send(request)
            .map_err(|e| AppError::Internal(format!("run queue closed: {}", e)))
    }

    async fn consume(&self) -> AppResult<Option<RunRequest>> {
        Ok(self.receiver.lock().await.recv().await)
    }
}
