use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AgentError;

/// Agent settings. Loaded from TOML or JSON; every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root of the shared snapshot area; each tablet writes under `tablet-<uid>`.
    pub snapshot_root: PathBuf,
    /// Directory hooks are looked up in.
    pub hook_dir: PathBuf,
    /// Bound on a single hook run.
    pub hook_timeout_secs: u64,
    /// Interval between liveness refreshes.
    pub heartbeat_interval_ms: u64,
    /// How long startup waits for a previous agent's liveness node to expire.
    pub pid_wait_ms: u64,
    /// Dial and call bound for RPCs to other agents.
    pub rpc_timeout_ms: u64,
    /// Initial backoff between fetch retries; doubles per attempt.
    pub fetch_backoff_ms: u64,
    /// Endpoint override: host name recorded in the tablet record.
    pub hostname: Option<String>,
    /// Endpoint override: agent RPC port.
    pub port: Option<u16>,
    /// Endpoint override: data engine port.
    pub engine_port: Option<u16>,
    /// Shared token required from RPC peers.
    pub auth_token: Option<String>,
    /// Fail the first N fetch attempts of every file. Test hook.
    pub simulate_fetch_failures: u32,
    /// Pull snapshot files through the source agent instead of the shared root.
    pub fetch_via_rpc: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            snapshot_root: PathBuf::from("/var/lib/tabletmgr/snapshot"),
            hook_dir: PathBuf::from("/var/lib/tabletmgr/hooks"),
            hook_timeout_secs: 300,
            heartbeat_interval_ms: 1_000,
            pid_wait_ms: 10_000,
            rpc_timeout_ms: 5_000,
            fetch_backoff_ms: 50,
            hostname: None,
            port: None,
            engine_port: None,
            auth_token: None,
            simulate_fetch_failures: 0,
            fetch_via_rpc: false,
        }
    }
}

impl AgentConfig {
    /// Loads a config file, picking the format by extension.
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| AgentError::Config(e.to_string())),
            "json" => serde_json::from_str(&contents).map_err(|e| AgentError::Config(e.to_string())),
            _ => Err(AgentError::Config(format!(
                "Unsupported config file extension: {}",
                ext
            ))),
        }
    }

    /// Heartbeat interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Startup wait for a stale liveness node.
    pub fn pid_wait(&self) -> Duration {
        Duration::from_millis(self.pid_wait_ms)
    }

    /// RPC bound.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Hook bound.
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }
}
