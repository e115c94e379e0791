use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub polling: PollingConfig,
}

impl SyncConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Per-request ceiling; a request that runs past it counts as a failed fetch.
    pub timeout_secs: u64,
    pub log_limit: u32,
    /// Raw `Cookie` header value of an authenticated dashboard session.
    pub cookie: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            user_agent: "autosave-sync/0.1".to_string(),
            timeout_secs: 30,
            log_limit: 10,
            cookie: None,
        }
    }
}

impl ServerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub task_status_interval_ms: u64,
    pub logs_interval_ms: u64,
    pub fast_interval_ms: u64,
    /// Consecutive failures tolerated before polling suspends itself.
    pub failure_threshold: u32,
    pub retry_delay_ms: u64,
    /// Minimum fast-polling dwell after a single execute command.
    pub execute_cooldown_ms: u64,
    pub batch_cooldown_ms: u64,
    /// A task seen running longer than this no longer holds fast polling open.
    pub running_ceiling_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            task_status_interval_ms: 5_000,
            logs_interval_ms: 10_000,
            fast_interval_ms: 1_000,
            failure_threshold: 3,
            retry_delay_ms: 3_000,
            execute_cooldown_ms: 30_000,
            batch_cooldown_ms: 60_000,
            running_ceiling_ms: 300_000,
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v.max(1))
}

impl PollingConfig {
    pub fn task_status_interval(&self) -> Duration {
        ms(self.task_status_interval_ms)
    }

    pub fn logs_interval(&self) -> Duration {
        ms(self.logs_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        ms(self.fast_interval_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        ms(self.retry_delay_ms)
    }

    pub fn execute_cooldown(&self) -> Duration {
        Duration::from_millis(self.execute_cooldown_ms)
    }

    pub fn batch_cooldown(&self) -> Duration {
        Duration::from_millis(self.batch_cooldown_ms)
    }

    pub fn running_ceiling(&self) -> Duration {
        Duration::from_millis(self.running_ceiling_ms)
    }

    pub fn merge(&mut self, patch: &PollingConfigPatch) {
        if let Some(v) = patch.task_status_interval_ms {
            self.task_status_interval_ms = v;
        }
        if let Some(v) = patch.logs_interval_ms {
            self.logs_interval_ms = v;
        }
        if let Some(v) = patch.fast_interval_ms {
            self.fast_interval_ms = v;
        }
        if let Some(v) = patch.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = patch.retry_delay_ms {
            self.retry_delay_ms = v;
        }
    }
}

/// Partial update applied by `update_config`; unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollingConfigPatch {
    pub task_status_interval_ms: Option<u64>,
    pub logs_interval_ms: Option<u64>,
    pub fast_interval_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub retry_delay_ms: Option<u64>,
}
