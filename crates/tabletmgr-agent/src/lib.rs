#![warn(missing_docs)]

//! tabletmgr agent subsystem: per-tablet action queue and agent, data engine
//! seam, snapshot/restore pipeline, hook runner and agent RPC.

pub mod action;
pub mod actions;
pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod hook;
pub mod queue;
pub mod rpc;
pub mod snapshot;

pub use action::{
    ActionArgs, ActionFailure, ActionNode, ActionReply, ActionState, FetchOptions, MultiSnapshotReply,
    RestoreReply, SnapshotReply, DEFAULT_WAIT_TIMEOUT_MS,
};
pub use agent::{
    Agent, AgentContext, AgentHandle, AgentStats, AgentStatsSnapshot, INTERRUPTED_MESSAGE, ORPHANED_MESSAGE,
};
pub use config::AgentConfig;
pub use engine::{
    DataEngine, EngineDirectory, MemoryEngine, Position, ReplicationFeed, ReplicationSource, ReplicationStatus,
    Row, TableSchema, TcpFeed,
};
pub use error::{ActionError, ActionErrorKind, AgentError, EngineError, FetchError, HookError, RpcError};
pub use hook::{HookResult, HookRunner, HOOK_MISSING};
pub use queue::{enqueue, purge_actions, run_action, wait_for_action, ActionHandle, PURGED_MESSAGE};
pub use rpc::{LocalDialer, PingReply, RpcBody, RpcReply, RpcService, TabletDialer, TcpDialer};
