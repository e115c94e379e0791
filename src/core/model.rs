use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::time::Instant;

/// Display and addressing position of a task, 1-based. The remote API
/// addresses tasks by `order - 1`.
pub type TaskOrder = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    #[serde(alias = "completed")]
    Success,
    #[serde(alias = "failed")]
    Error,
    /// Also absorbs `skipped`, `pending` and anything unknown.
    #[default]
    #[serde(other)]
    Normal,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Running => "running",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configured transfer job as the scheduler reports it.
///
/// Only `order`, `status` and `last_execute_time` take part in change
/// detection; everything else rides along untouched, including keys this
/// client does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub order: TaskOrder,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_execute_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_info: Option<serde_json::Value>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    pub fn new(order: TaskOrder, status: TaskStatus) -> Self {
        Self {
            order,
            status,
            progress: None,
            message: None,
            last_execute_time: None,
            name: None,
            url: None,
            save_dir: None,
            category: None,
            cron: None,
            share_info: None,
            extra: serde_json::Map::new(),
        }
    }

    /// The zero-based id the remote API expects.
    pub fn remote_id(&self) -> u32 {
        remote_id(self.order)
    }

    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("task {}", self.order))
    }

    pub(crate) fn same_observed_state(&self, other: &Task) -> bool {
        self.order == other.order
            && self.status == other.status
            && self.last_execute_time == other.last_execute_time
    }
}

pub fn remote_id(order: TaskOrder) -> u32 {
    order.saturating_sub(1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    #[serde(deserialize_with = "string_or_number")]
    pub timestamp: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

fn string_or_number<'de, D>(de: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(de)? {
        Raw::Text(s) => s,
        Raw::Number(n) => n.to_string(),
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PollingMode {
    #[default]
    Normal,
    Fast,
}

#[derive(Debug, Clone, Default)]
pub struct PollingState {
    pub running: bool,
    pub failure_count: u32,
    pub mode: PollingMode,
    pub last_success: Option<Instant>,
}

/// The server answers batch runs with whole task records; older builds sent
/// bare orders.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Order(TaskOrder),
    Task(Box<Task>),
}

impl BatchEntry {
    pub fn order(&self) -> TaskOrder {
        match self {
            Self::Order(o) => *o,
            Self::Task(t) => t.order,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BatchResults {
    #[serde(default)]
    pub success: Vec<BatchEntry>,
    #[serde(default)]
    pub skipped: Vec<BatchEntry>,
    #[serde(default)]
    pub failed: Vec<BatchEntry>,
    #[serde(default)]
    pub transferred_files: HashMap<String, Vec<String>>,
    /// Summary line from the envelope, not part of `results`.
    #[serde(skip)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteAck {
    pub message: Option<String>,
    pub transferred_files: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskDraft {
    pub url: String,
    pub save_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_replace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_replace: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskStats {
    pub total: usize,
    pub normal: usize,
    pub running: usize,
    pub success: usize,
    pub error: usize,
}

impl TaskStats {
    pub fn of(tasks: &[Task]) -> Self {
        let mut stats = Self { total: tasks.len(), ..Self::default() };
        for t in tasks {
            match t.status {
                TaskStatus::Normal => stats.normal += 1,
                TaskStatus::Running => stats.running += 1,
                TaskStatus::Success => stats.success += 1,
                TaskStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}
