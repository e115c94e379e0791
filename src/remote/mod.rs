pub mod http;

#[cfg(test)]
pub mod fake;

use crate::core::model::{BatchResults, ExecuteAck, LogEntry, Task, TaskDraft, TaskOrder, TaskPatch};
use async_trait::async_trait;
use reqwest::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("http status error: {0}")]
    Status(StatusCode),

    /// `success: false` envelope; carries the server's message.
    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The dashboard answers unauthenticated API calls with its login page.
    #[error("received an html page instead of json, the session has probably expired")]
    SessionExpired,
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if let Some(s) = e.status() {
            Self::Status(s)
        } else {
            Self::Transport(e)
        }
    }
}

/// Everything the engine needs from the remote scheduler. Reads are
/// idempotent; the command calls only confirm acceptance.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_task_snapshot(&self) -> Result<Vec<Task>, RemoteError>;

    async fn fetch_recent_logs(&self, limit: u32) -> Result<Vec<LogEntry>, RemoteError>;

    async fn execute_task(&self, order: TaskOrder) -> Result<ExecuteAck, RemoteError>;

    async fn execute_batch(&self, orders: &[TaskOrder]) -> Result<BatchResults, RemoteError>;

    async fn add_task(&self, draft: &TaskDraft) -> Result<(), RemoteError>;

    async fn update_task(&self, order: TaskOrder, patch: &TaskPatch) -> Result<(), RemoteError>;

    async fn delete_task(&self, order: TaskOrder) -> Result<(), RemoteError>;

    async fn delete_batch(&self, orders: &[TaskOrder]) -> Result<(), RemoteError>;

    async fn move_task(&self, order: TaskOrder, new_index: u32) -> Result<(), RemoteError>;
}
