//! Error types for the controller.

use tabletmgr_agent::{ActionError, ActionErrorKind, RpcError};
use tabletmgr_topo::TopoError;
use thiserror::Error;

/// Errors returned by controller operations.
#[derive(Debug, Error)]
pub enum WranglerError {
    /// Topology inconsistencies found by the validator.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// A lock, dial or action wait exceeded its bound.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The agent ran the action and it failed. The message is the agent's.
    #[error("remote action {action} failed: {message}")]
    Remote {
        /// Action name.
        action: String,
        /// Agent-side message.
        message: String,
    },

    /// The agent stopped while running the action.
    #[error("action {action} interrupted: {message}")]
    Interrupted {
        /// Action name.
        action: String,
        /// Agent-side message.
        message: String,
    },

    /// Rejected before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Snapshot or restore phase of a clone failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// Graceful reparent could not reach the current master.
    #[error("current master {master} unreachable: {msg}")]
    MasterUnreachable {
        /// Current master alias.
        master: String,
        /// Underlying failure.
        msg: String,
    },

    /// Coordination store failure.
    #[error(transparent)]
    Topo(#[from] TopoError),

    /// Direct RPC to an agent failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl WranglerError {
    /// True for bound-exceeded failures, including lock waits.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            WranglerError::Timeout(_) | WranglerError::Topo(TopoError::DeadlineExceeded { .. })
        )
    }
}

impl From<ActionError> for WranglerError {
    fn from(e: ActionError) -> Self {
        match e {
            ActionError::Failed {
                action,
                kind: ActionErrorKind::Interrupted,
                message,
            } => WranglerError::Interrupted { action, message },
            ActionError::Failed { action, message, .. } => WranglerError::Remote { action, message },
            e @ ActionError::Timeout { .. } => WranglerError::Timeout(e.to_string()),
            e @ ActionError::Vanished { .. } => WranglerError::Remote {
                action: String::new(),
                message: e.to_string(),
            },
            ActionError::Topo(e) => WranglerError::Topo(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_error_mapping() {
        let e: WranglerError = ActionError::Failed {
            action: "Sleep".to_string(),
            kind: ActionErrorKind::Interrupted,
            message: "action interrupted by signal".to_string(),
        }
        .into();
        assert!(matches!(e, WranglerError::Interrupted { .. }));

        let e: WranglerError = ActionError::Timeout {
            path: "/x".to_string(),
            timeout_ms: 10,
        }
        .into();
        assert!(e.is_timeout());
        assert!(e.to_string().contains("deadline exceeded"));
    }

    #[test]
    fn test_validation_lists_problems() {
        let e = WranglerError::Validation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(e.to_string(), "validation failed: a; b");
    }
}
