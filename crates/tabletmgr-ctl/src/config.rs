//! Controller configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Controller settings. Command-line flags override file values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CtlConfig {
    /// Coordination store address.
    pub topo: String,
    /// Cell used when a command takes a bare uid.
    pub cell: String,
    /// Bound on waiting for an action result.
    pub wait_time_ms: u64,
    /// Bound on waiting for a shard or keyspace lock.
    pub lock_timeout_ms: u64,
    /// Dial and call bound for direct agent RPCs.
    pub rpc_timeout_ms: u64,
    /// Shared token presented to agents.
    pub auth_token: Option<String>,
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            topo: "127.0.0.1:15000".to_string(),
            cell: "test".to_string(),
            wait_time_ms: 300_000,
            lock_timeout_ms: 30_000,
            rpc_timeout_ms: 5_000,
            auth_token: None,
        }
    }
}

impl CtlConfig {
    /// Loads a config file, picking the format by extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Action wait bound.
    pub fn wait_time(&self) -> Duration {
        Duration::from_millis(self.wait_time_ms)
    }

    /// Lock wait bound.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// RPC bound.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}
