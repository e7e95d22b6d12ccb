//! Action records stored in a tablet's queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabletmgr_topo::{KeyRange, TabletAlias, TabletType, TopoError};
use uuid::Uuid;

use crate::engine::Position;
use crate::error::ActionErrorKind;
use crate::hook::HookResult;

/// Default bound on waits inside an action (catch-up, replication start).
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 30_000;

/// Restore-side transfer settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Files fetched at once.
    pub concurrency: usize,
    /// Retries per file after the first attempt.
    pub retry_count: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            retry_count: 3,
        }
    }
}

/// Command and arguments of an action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "args")]
pub enum ActionArgs {
    /// Liveness through the queue.
    Ping,
    /// Holds the queue for a while.
    Sleep {
        /// Duration.
        duration_ms: u64,
    },
    /// Makes the engine read-only.
    SetReadOnly,
    /// Makes the engine read-write.
    SetReadWrite,
    /// Makes a master read-only and reports its position.
    DemoteMaster,
    /// Turns a replica into the master, optionally after catching up.
    PromoteSlave {
        /// Position to reach before promotion.
        wait_position: Option<Position>,
        /// Bound on the catch-up wait.
        wait_timeout_ms: u64,
    },
    /// Repoints replication at a new master from the current position.
    RestartSlave {
        /// New master.
        master: TabletAlias,
    },
    /// Repoints at the master and waits until caught up with it.
    ReparentPosition {
        /// Shard master.
        master: TabletAlias,
        /// Bound on the catch-up wait.
        wait_timeout_ms: u64,
    },
    /// Changes the tablet type.
    ChangeType {
        /// New type.
        tablet_type: TabletType,
    },
    /// Marks the tablet scrapped.
    Scrap {
        /// Leave the serving graph alone.
        skip_rebuild: bool,
    },
    /// Runs a named hook.
    ExecuteHook {
        /// Hook name.
        name: String,
        /// `flag` or `key=value` parameters.
        params: Vec<String>,
    },
    /// Exports the whole database.
    Snapshot {
        /// Tables exported at once.
        concurrency: usize,
        /// Leave the source read-only as a snapshot source.
        server_mode: bool,
        /// Allow snapshotting a master.
        force: bool,
    },
    /// Returns a server-mode snapshot source to normal duty.
    SnapshotSourceEnd {
        /// Type before the snapshot.
        original_type: TabletType,
        /// Replication was stopped by the snapshot.
        slave_start_required: bool,
        /// Read-only flag before the snapshot.
        read_only: bool,
    },
    /// Exports one key range.
    PartialSnapshot {
        /// Range to export.
        key_range: KeyRange,
        /// Column holding the sharding key.
        key_column: String,
        /// Tables exported at once.
        concurrency: usize,
    },
    /// Exports several disjoint key ranges.
    MultiSnapshot {
        /// Ranges, one export unit each.
        ranges: Vec<KeyRange>,
        /// Restrict to these tables; all when empty.
        tables: Vec<String>,
        /// Column holding the sharding key.
        key_column: String,
        /// Tables exported at once.
        concurrency: usize,
        /// Allow snapshotting a master.
        force: bool,
    },
    /// Loads a full snapshot and starts replication.
    Restore {
        /// Snapshot source.
        source: TabletAlias,
        /// Manifest path under the snapshot root; the source's default when absent.
        manifest_path: Option<String>,
        /// Transfer settings.
        fetch: FetchOptions,
        /// Return without waiting for replication to connect.
        dont_wait_for_slave_start: bool,
        /// Type the tablet takes on success.
        tablet_type: TabletType,
    },
    /// Loads one key range into a pre-provisioned database.
    PartialRestore {
        /// Snapshot source.
        source: TabletAlias,
        /// Partial manifest path under the snapshot root.
        manifest_path: String,
        /// Transfer settings.
        fetch: FetchOptions,
        /// Type the tablet takes on success.
        tablet_type: TabletType,
    },
    /// Merges multi-snapshot ranges below a bound.
    MultiRestore {
        /// Tablets whose multi-snapshots are merged.
        sources: Vec<TabletAlias>,
        /// Only rows inside this range are loaded.
        key_range: KeyRange,
        /// Transfer settings.
        fetch: FetchOptions,
    },
}

impl ActionArgs {
    /// Command name.
    pub fn name(&self) -> &'static str {
        match self {
            ActionArgs::Ping => "Ping",
            ActionArgs::Sleep { .. } => "Sleep",
            ActionArgs::SetReadOnly => "SetReadOnly",
            ActionArgs::SetReadWrite => "SetReadWrite",
            ActionArgs::DemoteMaster => "DemoteMaster",
            ActionArgs::PromoteSlave { .. } => "PromoteSlave",
            ActionArgs::RestartSlave { .. } => "RestartSlave",
            ActionArgs::ReparentPosition { .. } => "ReparentPosition",
            ActionArgs::ChangeType { .. } => "ChangeType",
            ActionArgs::Scrap { .. } => "Scrap",
            ActionArgs::ExecuteHook { .. } => "ExecuteHook",
            ActionArgs::Snapshot { .. } => "Snapshot",
            ActionArgs::SnapshotSourceEnd { .. } => "SnapshotSourceEnd",
            ActionArgs::PartialSnapshot { .. } => "PartialSnapshot",
            ActionArgs::MultiSnapshot { .. } => "MultiSnapshot",
            ActionArgs::Restore { .. } => "Restore",
            ActionArgs::PartialRestore { .. } => "PartialRestore",
            ActionArgs::MultiRestore { .. } => "MultiRestore",
        }
    }
}

/// Result of a snapshot, as shown to the operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReply {
    /// Manifest path under the snapshot root.
    pub manifest_path: String,
    /// Tablet record path of the source.
    pub parent_path: String,
    /// The source stopped replication and must restart it when done.
    pub slave_start_required: bool,
    /// The source is left read-only.
    pub read_only: bool,
    /// Source type before the snapshot.
    pub original_type: TabletType,
    /// The source stays a snapshot source until `SnapshotSourceEnd`.
    pub server_mode: bool,
}

/// Result of a multi-snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSnapshotReply {
    /// Index path under the snapshot root.
    pub index_path: String,
    /// One partial manifest per range, in range order.
    pub manifest_paths: Vec<String>,
}

/// Result of a restore.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReply {
    /// Files transferred.
    pub files: usize,
    /// Rows loaded.
    pub rows: usize,
    /// Replication start position, when replication was started.
    pub position: Option<Position>,
}

/// Success payload of an action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ActionReply {
    /// Nothing to report.
    None,
    /// Answer to `Ping`.
    Pong,
    /// Replication position.
    Position(Position),
    /// Hook outcome.
    Hook(HookResult),
    /// Snapshot outcome.
    Snapshot(SnapshotReply),
    /// Multi-snapshot outcome.
    MultiSnapshot(MultiSnapshotReply),
    /// Restore outcome.
    Restore(RestoreReply),
}

/// Lifecycle of an action.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    /// Waiting in the queue.
    Queued,
    /// Claimed by an agent.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Failed,
    /// The executing agent was stopped.
    Interrupted,
}

impl ActionState {
    /// True for the three final states.
    pub fn is_finished(self) -> bool {
        matches!(self, ActionState::Done | ActionState::Failed | ActionState::Interrupted)
    }
}

/// Error slot of a finished action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionFailure {
    /// Classification.
    pub kind: ActionErrorKind,
    /// Message, verbatim.
    pub message: String,
}

/// One queue entry. The same record, finished, is the actionlog entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNode {
    /// Unique id.
    pub guid: Uuid,
    /// Command name.
    pub action: String,
    /// Command and arguments.
    pub args: ActionArgs,
    /// Lifecycle state.
    pub state: ActionState,
    /// Error slot.
    #[serde(default)]
    pub error: Option<ActionFailure>,
    /// Success slot.
    #[serde(default)]
    pub reply: Option<ActionReply>,
    /// Agent instance that claimed the action.
    #[serde(default)]
    pub owner: Option<String>,
    /// Enqueue time.
    pub queued_at: DateTime<Utc>,
    /// Claim time.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ActionNode {
    /// A fresh queued action.
    pub fn new(args: ActionArgs) -> Self {
        Self {
            guid: Uuid::new_v4(),
            action: args.name().to_string(),
            args,
            state: ActionState::Queued,
            error: None,
            reply: None,
            owner: None,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Decodes a stored node.
    pub fn decode(path: &str, data: &[u8]) -> Result<Self, TopoError> {
        serde_json::from_slice(data).map_err(|e| TopoError::Codec {
            path: path.to_string(),
            msg: e.to_string(),
        })
    }

    /// Encodes for storage at `path`.
    pub fn encode(&self, path: &str) -> Result<Vec<u8>, TopoError> {
        serde_json::to_vec_pretty(self).map_err(|e| TopoError::Codec {
            path: path.to_string(),
            msg: e.to_string(),
        })
    }

    /// Marks the action claimed by `owner`.
    pub fn claim(&mut self, owner: &str) {
        self.state = ActionState::Running;
        self.owner = Some(owner.to_string());
        self.started_at = Some(Utc::now());
    }

    /// Records success.
    pub fn succeed(&mut self, reply: ActionReply) {
        self.state = ActionState::Done;
        self.reply = Some(reply);
        self.error = None;
        self.finished_at = Some(Utc::now());
    }

    /// Records failure. Interrupted failures get the interrupted state.
    pub fn fail(&mut self, kind: ActionErrorKind, message: impl Into<String>) {
        self.state = if kind == ActionErrorKind::Interrupted {
            ActionState::Interrupted
        } else {
            ActionState::Failed
        };
        self.error = Some(ActionFailure {
            kind,
            message: message.into(),
        });
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_lifecycle() {
        let mut node = ActionNode::new(ActionArgs::Sleep { duration_ms: 10 });
        assert_eq!(node.action, "Sleep");
        assert_eq!(node.state, ActionState::Queued);
        node.claim("agent-1");
        assert_eq!(node.state, ActionState::Running);
        assert!(!node.state.is_finished());
        node.fail(ActionErrorKind::Interrupted, "action interrupted by signal");
        assert_eq!(node.state, ActionState::Interrupted);
        assert!(node.state.is_finished());
        assert!(node.finished_at.is_some());
    }

    #[test]
    fn test_node_json_shape() {
        let node = ActionNode::new(ActionArgs::ChangeType {
            tablet_type: TabletType::Spare,
        });
        let text = String::from_utf8(node.encode("/x").unwrap()).unwrap();
        assert!(text.contains("\"command\": \"ChangeType\""));
        assert!(text.contains("\"tablet_type\": \"spare\""));
        assert!(text.contains("\"state\": \"queued\""));
        let back = ActionNode::decode("/x", text.as_bytes()).unwrap();
        assert_eq!(back, node);
    }

    #[test]
    fn test_decode_garbage_is_codec_error() {
        let err = ActionNode::decode("/cells/c/tablets/0000000001/action/0000000001", b"{lock")
            .unwrap_err();
        assert!(matches!(err, TopoError::Codec { .. }));
    }
}
