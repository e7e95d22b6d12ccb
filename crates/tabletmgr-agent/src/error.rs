//! Error types for the tablet agent.

use serde::{Deserialize, Serialize};
use tabletmgr_topo::TopoError;
use thiserror::Error;

/// Classification of a failed action, published with the result.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionErrorKind {
    /// The agent failed while executing the action locally.
    Fatal,
    /// The agent was signaled or died while the action was running.
    Interrupted,
    /// The action failed because another tablet or service reported an error.
    Remote,
}

impl std::fmt::Display for ActionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ActionErrorKind::Fatal => "fatal",
            ActionErrorKind::Interrupted => "interrupted",
            ActionErrorKind::Remote => "remote",
        })
    }
}

/// Errors from the data engine seam.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Write rejected because the engine is read-only.
    #[error("engine is read-only")]
    ReadOnly,

    /// Database does not exist.
    #[error("unknown database: {db}")]
    UnknownDatabase {
        /// Database name.
        db: String,
    },

    /// Table does not exist.
    #[error("unknown table: {db}.{table}")]
    UnknownTable {
        /// Database name.
        db: String,
        /// Table name.
        table: String,
    },

    /// Replication did not reach a position in time.
    #[error("timed out after {timeout_ms}ms waiting for position {target} (at {current})")]
    PositionTimeout {
        /// Requested position.
        target: u64,
        /// Position reached.
        current: u64,
        /// Bound.
        timeout_ms: u64,
    },

    /// Replication source could not be reached.
    #[error("replication source {addr} unreachable: {msg}")]
    SourceUnreachable {
        /// Source address.
        addr: String,
        /// Failure text.
        msg: String,
    },

    /// Invalid request.
    #[error("engine: {0}")]
    Invalid(String),
}

/// Errors from running hooks.
#[derive(Debug, Error)]
pub enum HookError {
    /// Hook name failed validation.
    #[error("hook name cannot have a '/' in it")]
    InvalidName,

    /// Hook exceeded its time bound and was killed.
    #[error("hook {name} timed out after {timeout_ms}ms")]
    Timeout {
        /// Hook name.
        name: String,
        /// Bound.
        timeout_ms: u64,
    },

    /// Spawning or waiting failed.
    #[error("hook {name} failed to run: {source}")]
    Spawn {
        /// Hook name.
        name: String,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Errors talking to another tablet's agent.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Could not connect within the dial timeout.
    #[error("dial failed: {addr}: {msg}")]
    DialFailed {
        /// Target address.
        addr: String,
        /// Failure text.
        msg: String,
    },

    /// Connected but the call did not complete in time.
    #[error("rpc to {addr} timed out after {timeout_ms}ms")]
    Timeout {
        /// Target address.
        addr: String,
        /// Bound.
        timeout_ms: u64,
    },

    /// The remote agent answered with an error.
    #[error("remote error from {addr}: {msg}")]
    Remote {
        /// Target address.
        addr: String,
        /// Remote message, verbatim.
        msg: String,
    },

    /// The remote agent rejected our credentials.
    #[error("unauthenticated by {addr}")]
    Unauthenticated {
        /// Target address.
        addr: String,
    },

    /// Framing or socket failure after connecting.
    #[error("rpc transport error: {0}")]
    Transport(#[from] tabletmgr_topo::WireError),
}

impl RpcError {
    /// True when the target could not be reached at all.
    pub fn is_dial_failure(&self) -> bool {
        matches!(self, RpcError::DialFailed { .. })
    }
}

/// Errors fetching snapshot files.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Worth retrying: network hiccup, injected fault, short read.
    #[error("retryable fetch failure for {path}: {msg}")]
    Retryable {
        /// File path.
        path: String,
        /// Failure text.
        msg: String,
    },

    /// Not worth retrying: missing file, bad path.
    #[error("fetch of {path} failed: {msg}")]
    Fatal {
        /// File path.
        path: String,
        /// Failure text.
        msg: String,
    },

    /// Retries ran out.
    #[error("fetch of {path} failed after {attempts} attempts: {last}")]
    Exhausted {
        /// File path.
        path: String,
        /// Attempts made.
        attempts: u32,
        /// Last failure text.
        last: String,
    },

    /// Content did not match the manifest.
    #[error("hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        /// File path.
        path: String,
        /// Manifest hash.
        expected: String,
        /// Computed hash.
        actual: String,
    },
}

impl FetchError {
    /// Returns true for failures the restore loop retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Retryable { .. } | FetchError::HashMismatch { .. })
    }
}

/// Errors raised while executing actions or running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Rejected before any side effect.
    #[error("{0}")]
    InvalidArgument(String),

    /// Another agent holds this tablet.
    #[error("agent already running for tablet {alias}")]
    AlreadyRunning {
        /// Tablet alias.
        alias: String,
    },

    /// Coordination store failure.
    #[error(transparent)]
    Topo(#[from] TopoError),

    /// Data engine failure.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Hook failure.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// RPC to another tablet failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Snapshot transfer failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Export artifact could not be encoded or decoded.
    #[error("snapshot data error: {0}")]
    Data(String),

    /// Local file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),
}

impl AgentError {
    /// Kind to publish when an action fails with this error.
    pub fn kind(&self) -> ActionErrorKind {
        match self {
            AgentError::Rpc(_) | AgentError::Fetch(_) => ActionErrorKind::Remote,
            _ => ActionErrorKind::Fatal,
        }
    }
}

impl From<csv::Error> for AgentError {
    fn from(e: csv::Error) -> Self {
        AgentError::Data(e.to_string())
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Data(e.to_string())
    }
}

/// Errors seen by a caller waiting on an action.
#[derive(Debug, Error)]
pub enum ActionError {
    /// The agent ran the action and it failed.
    #[error("action {action} failed ({kind}): {message}")]
    Failed {
        /// Action name.
        action: String,
        /// Failure classification.
        kind: ActionErrorKind,
        /// Agent-side message, verbatim.
        message: String,
    },

    /// The wait bound elapsed first.
    #[error("deadline exceeded waiting for action {path} after {timeout_ms}ms")]
    Timeout {
        /// Action path.
        path: String,
        /// Bound.
        timeout_ms: u64,
    },

    /// The action left the queue without a published result.
    #[error("action {path} disappeared without a result")]
    Vanished {
        /// Action path.
        path: String,
    },

    /// Coordination store failure while waiting.
    #[error(transparent)]
    Topo(#[from] TopoError),
}

impl ActionError {
    /// True when the executing agent was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            ActionError::Failed {
                kind: ActionErrorKind::Interrupted,
                ..
            }
        )
    }

    /// True when the wait bound elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ActionError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let e = AgentError::Rpc(RpcError::DialFailed {
            addr: "localhost:1".to_string(),
            msg: "connection refused".to_string(),
        });
        assert_eq!(e.kind(), ActionErrorKind::Remote);
        assert!(e.to_string().starts_with("dial failed"));
        let e = AgentError::InvalidArgument("bad".to_string());
        assert_eq!(e.kind(), ActionErrorKind::Fatal);
    }

    #[test]
    fn test_action_error_display() {
        let e = ActionError::Timeout {
            path: "/cells/c/tablets/0000000001/action/0000000001".to_string(),
            timeout_ms: 500,
        };
        assert!(e.is_timeout());
        assert!(e.to_string().contains("deadline exceeded"));
        let e = ActionError::Failed {
            action: "Sleep".to_string(),
            kind: ActionErrorKind::Interrupted,
            message: "action interrupted by signal".to_string(),
        };
        assert!(e.is_interrupted());
    }

    #[test]
    fn test_hook_name_error_text() {
        assert_eq!(
            HookError::InvalidName.to_string(),
            "hook name cannot have a '/' in it"
        );
    }
}
