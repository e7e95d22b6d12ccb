//! Client side of the per-tablet action queue.
//!
//! `enqueue` drops a queued node under `.../action/` and returns at once.
//! The agent publishes the finished node under `.../actionlog/` with the same
//! sequence number before deleting the queue entry, so a waiter that sees the
//! queue entry gone always finds the result.

use std::sync::Arc;
use std::time::Duration;

use tabletmgr_topo::{paths, CreateMode, TabletAlias, TopoError, TopoStore, WatchKind};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::{ActionArgs, ActionFailure, ActionNode, ActionReply, ActionState};
use crate::error::{ActionError, ActionErrorKind};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Message published for actions removed by `purge_actions`.
pub const PURGED_MESSAGE: &str = "purged by operator";

/// Handle on an enqueued action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionHandle {
    /// Queue node path.
    pub path: String,
    /// Target tablet.
    pub alias: TabletAlias,
    /// Command name.
    pub action: String,
}

impl ActionHandle {
    /// Rebuilds a handle from a queue path, as printed by `enqueue` callers.
    pub fn from_path(path: &str) -> Result<Self, TopoError> {
        // /cells/<cell>/tablets/<uid>/action/<seq>
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            ["cells", cell, "tablets", uid, "action", _seq] => {
                let uid = uid.parse::<u32>().map_err(|_| {
                    TopoError::InvalidArgument(format!("bad tablet uid in action path: {}", path))
                })?;
                Ok(Self {
                    path: path.to_string(),
                    alias: TabletAlias::new(*cell, uid),
                    action: String::new(),
                })
            }
            _ => Err(TopoError::InvalidArgument(format!("not an action path: {}", path))),
        }
    }
}

/// Queues `args` for the tablet's agent.
pub async fn enqueue(
    store: &Arc<dyn TopoStore>,
    alias: &TabletAlias,
    args: ActionArgs,
) -> Result<ActionHandle, TopoError> {
    let node = ActionNode::new(args);
    let dir = paths::tablet_action_dir(alias);
    let data = node.encode(&dir)?;
    let path = store
        .create(&format!("{}/", dir), data, CreateMode::SEQUENTIAL)
        .await?;
    debug!(tablet = %alias, action = %node.action, path = %path, "enqueued action");
    Ok(ActionHandle {
        path,
        alias: alias.clone(),
        action: node.action,
    })
}

async fn read_node(store: &Arc<dyn TopoStore>, path: &str) -> Result<Option<ActionNode>, TopoError> {
    match store.get(path).await {
        Ok((data, _)) => Ok(Some(ActionNode::decode(path, &data)?)),
        Err(TopoError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn outcome(handle: &ActionHandle, node: ActionNode) -> Result<ActionReply, ActionError> {
    let action = if handle.action.is_empty() {
        node.action.clone()
    } else {
        handle.action.clone()
    };
    match node.state {
        ActionState::Done => Ok(node.reply.unwrap_or(ActionReply::None)),
        _ => {
            let failure = node.error.unwrap_or_else(|| ActionFailure {
                kind: ActionErrorKind::Fatal,
                message: "action finished without an error message".to_string(),
            });
            Err(ActionError::Failed {
                action,
                kind: failure.kind,
                message: failure.message,
            })
        }
    }
}

/// Waits up to `timeout` for the action's published result.
pub async fn wait_for_action(
    store: &Arc<dyn TopoStore>,
    handle: &ActionHandle,
    timeout: Duration,
) -> Result<ActionReply, ActionError> {
    let log_path = paths::actionlog_for(&handle.path).ok_or_else(|| {
        ActionError::Topo(TopoError::InvalidArgument(format!(
            "not an action path: {}",
            handle.path
        )))
    })?;
    let log_dir = paths::tablet_actionlog_dir(&handle.alias);
    let deadline = Instant::now() + timeout;

    let mut watch = match store.watch(&log_dir).await {
        Ok(w) => Some(w),
        Err(e) => {
            debug!(dir = %log_dir, error = %e, "actionlog watch unavailable, polling");
            None
        }
    };

    loop {
        if let Some(node) = read_node(store, &log_path).await? {
            return outcome(handle, node);
        }
        if !store.exists(&handle.path).await? {
            // Result is written before the queue entry is removed.
            if let Some(node) = read_node(store, &log_path).await? {
                return outcome(handle, node);
            }
            return Err(ActionError::Vanished {
                path: handle.path.clone(),
            });
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ActionError::Timeout {
                path: handle.path.clone(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        let nap = WAIT_POLL_INTERVAL.min(deadline - now);
        match watch.as_mut() {
            Some(w) => {
                if let Ok(Some(ev)) = tokio::time::timeout(nap, w.next()).await {
                    if ev.kind == WatchKind::Resync {
                        debug!(dir = %log_dir, "actionlog watch resync");
                    }
                }
            }
            None => tokio::time::sleep(nap).await,
        }
    }
}

/// Enqueues and waits in one call.
pub async fn run_action(
    store: &Arc<dyn TopoStore>,
    alias: &TabletAlias,
    args: ActionArgs,
    timeout: Duration,
) -> Result<ActionReply, ActionError> {
    let handle = enqueue(store, alias, args).await?;
    wait_for_action(store, &handle, timeout).await
}

/// Empties an action or lock directory.
///
/// Decodable action entries get a failed result published first so waiters
/// return instead of hanging. Returns the number of entries removed.
pub async fn purge_actions(store: &Arc<dyn TopoStore>, dir: &str) -> Result<usize, TopoError> {
    let children = match store.children(dir).await {
        Ok(c) => c,
        Err(TopoError::NotFound { .. }) => return Ok(0),
        Err(e) => return Err(e),
    };
    let mut purged = 0;
    for child in children {
        let path = paths::join(dir, &child);
        let (data, _) = match store.get(&path).await {
            Ok(v) => v,
            Err(TopoError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        if let (Ok(mut node), Some(log_path)) = (ActionNode::decode(&path, &data), paths::actionlog_for(&path)) {
            if !node.state.is_finished() {
                node.fail(ActionErrorKind::Fatal, PURGED_MESSAGE);
                store.set(&log_path, node.encode(&log_path)?, None).await?;
            }
        }
        match store.delete(&path, None).await {
            Ok(()) | Err(TopoError::NotFound { .. }) => purged += 1,
            Err(e) => {
                warn!(path = %path, error = %e, "could not purge action");
                return Err(e);
            }
        }
    }
    info!(dir = %dir, purged, "purged actions");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletmgr_topo::MemoryTopoServer;

    fn store() -> Arc<dyn TopoStore> {
        Arc::new(MemoryTopoServer::new().connect())
    }

    fn alias() -> TabletAlias {
        TabletAlias::new("test", 62344)
    }

    async fn publish(store: &Arc<dyn TopoStore>, handle: &ActionHandle, node: &ActionNode) {
        let log_path = paths::actionlog_for(&handle.path).unwrap();
        store.set(&log_path, node.encode(&log_path).unwrap(), None).await.unwrap();
        store.delete(&handle.path, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_creates_sequential_nodes() {
        let store = store();
        let a = enqueue(&store, &alias(), ActionArgs::Ping).await.unwrap();
        let b = enqueue(&store, &alias(), ActionArgs::Ping).await.unwrap();
        assert!(a.path < b.path);
        assert!(a.path.starts_with("/cells/test/tablets/0000062344/action/"));
        assert_eq!(ActionHandle::from_path(&a.path).unwrap().alias, alias());
    }

    #[tokio::test]
    async fn test_wait_returns_published_reply() {
        let store = store();
        let handle = enqueue(&store, &alias(), ActionArgs::DemoteMaster).await.unwrap();
        let s = store.clone();
        let h = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut node = ActionNode::new(ActionArgs::DemoteMaster);
            node.succeed(ActionReply::Position(17));
            publish(&s, &h, &node).await;
        });
        let reply = wait_for_action(&store, &handle, Duration::from_secs(2)).await.unwrap();
        assert_eq!(reply, ActionReply::Position(17));
    }

    #[tokio::test]
    async fn test_wait_surfaces_remote_kind() {
        let store = store();
        let handle = enqueue(&store, &alias(), ActionArgs::Sleep { duration_ms: 1000 })
            .await
            .unwrap();
        let mut node = ActionNode::new(ActionArgs::Sleep { duration_ms: 1000 });
        node.fail(ActionErrorKind::Interrupted, "action interrupted by signal");
        publish(&store, &handle, &node).await;
        let err = wait_for_action(&store, &handle, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_interrupted());
        assert!(err.to_string().contains("action interrupted by signal"));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_blocking_past_bound() {
        let store = store();
        let handle = enqueue(&store, &alias(), ActionArgs::Ping).await.unwrap();
        let started = std::time::Instant::now();
        let err = wait_for_action(&store, &handle, Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_wait_on_vanished_action() {
        let store = store();
        let handle = enqueue(&store, &alias(), ActionArgs::Ping).await.unwrap();
        store.delete(&handle.path, None).await.unwrap();
        let err = wait_for_action(&store, &handle, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, ActionError::Vanished { .. }));
    }

    #[tokio::test]
    async fn test_purge_publishes_failure_for_waiters() {
        let store = store();
        let handle = enqueue(&store, &alias(), ActionArgs::Ping).await.unwrap();
        enqueue(&store, &alias(), ActionArgs::SetReadOnly).await.unwrap();
        let n = purge_actions(&store, &paths::tablet_action_dir(&alias())).await.unwrap();
        assert_eq!(n, 2);
        let err = wait_for_action(&store, &handle, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.to_string().contains(PURGED_MESSAGE));
        assert!(store
            .children(&paths::tablet_action_dir(&alias()))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_purge_lock_dir_without_actionlog() {
        let store = store();
        let dir = paths::shard_action_dir("test_keyspace", "0");
        store
            .create(&format!("{}/", dir), b"{\"action\":\"x\"}".to_vec(), CreateMode::SEQUENTIAL)
            .await
            .unwrap();
        assert_eq!(purge_actions(&store, &dir).await.unwrap(), 1);
        assert!(!store.exists(&paths::join("/global/keyspaces/test_keyspace/shards/0", "actionlog")).await.unwrap());
    }
}
