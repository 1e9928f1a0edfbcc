//! Grid configuration.
//!
//! Durations are stored in milliseconds so the struct deserializes from plain
//! JSON/env values. Every field has a default; `from_env` overlays `GRID_*`
//! variables on top of those defaults.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_NODE_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RPC_TIMEOUT_MS: u64 = 2_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GridConfig {
    /// Name shared by every node of the same grid.
    pub grid_name: String,
    /// A node (or coordinator) silent for longer than this is considered gone.
    pub node_timeout_ms: u64,
    /// Interval between progress heartbeats and coordinator polling rounds.
    pub heartbeat_interval_ms: u64,
    /// Upper bound for a whole task. `None` means wait until every node is done.
    pub task_timeout_ms: Option<u64>,
    /// Deadline for a single node RPC.
    pub rpc_timeout_ms: u64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            grid_name: "crawl-grid".to_string(),
            node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            task_timeout_ms: None,
            rpc_timeout_ms: DEFAULT_RPC_TIMEOUT_MS,
        }
    }
}

impl GridConfig {
    pub fn new(grid_name: &str) -> Self {
        Self {
            grid_name: grid_name.to_string(),
            ..Self::default()
        }
    }

    /// Loads defaults then applies `GRID_NAME`, `GRID_NODE_TIMEOUT_MS`,
    /// `GRID_HEARTBEAT_INTERVAL_MS`, `GRID_TASK_TIMEOUT_MS` and
    /// `GRID_RPC_TIMEOUT_MS` when present and parseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("GRID_NAME")
            && !name.trim().is_empty()
        {
            config.grid_name = name;
        }
        if let Some(ms) = env_millis("GRID_NODE_TIMEOUT_MS") {
            config.node_timeout_ms = ms;
        }
        if let Some(ms) = env_millis("GRID_HEARTBEAT_INTERVAL_MS") {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = env_millis("GRID_TASK_TIMEOUT_MS") {
            config.task_timeout_ms = Some(ms);
        }
        if let Some(ms) = env_millis("GRID_RPC_TIMEOUT_MS") {
            config.rpc_timeout_ms = ms;
        }

        config
    }

    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.node_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_ms.map(Duration::from_millis)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

fn env_millis(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(ms) => Some(ms),
            Err(e) => {
                tracing::warn!("Ignoring {}={:?}: {}", key, raw, e);
                None
            }
        },
        Err(_) => None,
    }
}
