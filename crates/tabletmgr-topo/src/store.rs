//! Coordination store contract.
//!
//! The store is a hierarchical, strongly consistent tree of versioned nodes
//! with ephemeral and sequential creation and watches. `MemoryTopoClient`
//! and `RemoteTopoClient` implement it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::TopoError;

/// Node version, bumped on every write. Starts at 1 on creation.
pub type Version = u64;

/// Width of the counter appended to sequential node names.
pub const SEQUENCE_WIDTH: usize = 10;

/// How a node is created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateMode {
    /// Node is removed when the creating session closes.
    pub ephemeral: bool,
    /// A per-parent counter is appended to the requested name.
    pub sequential: bool,
}

impl CreateMode {
    /// Plain persistent node.
    pub const PERSISTENT: CreateMode = CreateMode {
        ephemeral: false,
        sequential: false,
    };
    /// Session-bound node.
    pub const EPHEMERAL: CreateMode = CreateMode {
        ephemeral: true,
        sequential: false,
    };
    /// Persistent node with a sequence suffix.
    pub const SEQUENTIAL: CreateMode = CreateMode {
        ephemeral: false,
        sequential: true,
    };
}

/// Kind of change reported by a watch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchKind {
    /// Node was created.
    Created,
    /// Node data was replaced.
    DataChanged,
    /// Node was deleted.
    Deleted,
    /// Events may have been lost; re-read the watched state.
    Resync,
}

/// A change to the watched node or one of its direct children.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Path that changed.
    pub path: String,
    /// What happened.
    pub kind: WatchKind,
}

/// Cancellable watch subscription. Dropping it stops delivery.
pub struct Watch {
    rx: mpsc::Receiver<WatchEvent>,
    task: Option<JoinHandle<()>>,
}

impl Watch {
    /// Wraps a receiver fed by `task`; the task is aborted on drop.
    pub fn new(rx: mpsc::Receiver<WatchEvent>, task: JoinHandle<()>) -> Self {
        Self {
            rx,
            task: Some(task),
        }
    }

    /// Waits for the next event. `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }

    /// Drains events that are already queued without waiting.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.rx.try_recv().is_ok() {
            n += 1;
        }
        n
    }

    /// Stops the subscription.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.rx.close();
    }
}

impl Drop for Watch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Typed access to the coordination tree.
#[async_trait]
pub trait TopoStore: Send + Sync {
    /// Reads a node.
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version), TopoError>;

    /// Creates a node, creating missing parents. Returns the actual path,
    /// which differs from `path` for sequential nodes.
    async fn create(&self, path: &str, data: Vec<u8>, mode: CreateMode)
        -> Result<String, TopoError>;

    /// Replaces node data. With `expected`, fails with `BadVersion` unless the
    /// stored version matches. Without it, creates the node if missing.
    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version, TopoError>;

    /// Deletes a leaf node, optionally guarded by version.
    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<(), TopoError>;

    /// Deletes a node and everything below it. Missing nodes are not an error.
    async fn delete_recursive(&self, path: &str) -> Result<(), TopoError>;

    /// Names of direct children, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, TopoError>;

    /// True when the node exists.
    async fn exists(&self, path: &str) -> Result<bool, TopoError>;

    /// Subscribes to changes of `path` and its direct children.
    async fn watch(&self, path: &str) -> Result<Watch, TopoError>;

    /// Ends the session. Ephemeral nodes it owns disappear and later calls
    /// fail.
    async fn close(&self) -> Result<(), TopoError>;
}

/// Validates a node path: absolute, no empty components, no trailing slash.
pub fn check_path(path: &str) -> Result<(), TopoError> {
    if path == "/" {
        return Ok(());
    }
    if !path.starts_with('/') || path.ends_with('/') || path[1..].split('/').any(str::is_empty) {
        return Err(TopoError::InvalidArgument(format!("bad node path: {}", path)));
    }
    Ok(())
}

/// Name of the `n`th sequential child.
pub fn sequence_name(prefix: &str, n: u64) -> String {
    format!("{}{:0width$}", prefix, n, width = SEQUENCE_WIDTH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_path() {
        assert!(check_path("/").is_ok());
        assert!(check_path("/a/b").is_ok());
        assert!(check_path("a/b").is_err());
        assert!(check_path("/a//b").is_err());
        assert!(check_path("/a/").is_err());
    }

    #[test]
    fn test_sequence_name() {
        assert_eq!(sequence_name("", 7), "0000000007");
        assert_eq!(sequence_name("lock-", 12), "lock-0000000012");
    }

    #[tokio::test]
    async fn test_watch_cancel_closes_stream() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(async {});
        let mut watch = Watch::new(rx, task);
        tx.send(WatchEvent {
            path: "/a".to_string(),
            kind: WatchKind::Created,
        })
        .await
        .unwrap();
        assert_eq!(watch.drain(), 1);
        watch.cancel();
        assert!(watch.next().await.is_none());
    }
}
