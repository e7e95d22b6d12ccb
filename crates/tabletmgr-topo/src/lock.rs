//! Shard and keyspace action locks.
//!
//! A lock is a directory of persistent sequential nodes; the lowest sequence
//! holds the lock and later entries wait in order. Nodes are persistent so a
//! holder that dies leaves a visible entry an operator can purge.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::TopoError;
use crate::paths;
use crate::store::{CreateMode, TopoStore};

/// Re-list interval when no watch event arrives.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Stored in each lock node; describes the holder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Operation holding or requesting the lock.
    pub action: String,
    /// Host of the requester.
    pub hostname: String,
    /// Process id of the requester.
    pub pid: u32,
    /// Request time.
    pub time: chrono::DateTime<chrono::Utc>,
}

impl LockInfo {
    /// Describes the current process performing `action`.
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            pid: std::process::id(),
            time: chrono::Utc::now(),
        }
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (pid {} on {} since {})", self.action, self.pid, self.hostname, self.time)
    }
}

/// A held lock. Call `release` when done.
pub struct ActionLock {
    store: Arc<dyn TopoStore>,
    dir: String,
    node: String,
    released: bool,
}

impl ActionLock {
    /// Queues for the lock in `dir` and waits up to `timeout` to hold it.
    pub async fn acquire(
        store: Arc<dyn TopoStore>,
        dir: &str,
        info: LockInfo,
        timeout: Duration,
    ) -> Result<ActionLock, TopoError> {
        let data = serde_json::to_vec(&info).map_err(|e| TopoError::codec(dir, e))?;
        let node = store
            .create(&format!("{}/", dir), data, CreateMode::SEQUENTIAL)
            .await?;
        let name = paths::base_name(&node).to_string();
        let deadline = Instant::now() + timeout;

        let mut lock = ActionLock {
            store: store.clone(),
            dir: dir.to_string(),
            node,
            released: false,
        };

        let mut watch = match store.watch(dir).await {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(dir, error = %e, "lock watch unavailable, polling");
                None
            }
        };

        loop {
            let children = match store.children(dir).await {
                Ok(c) => c,
                Err(e) => {
                    lock.abandon().await;
                    return Err(e);
                }
            };
            let holder = match children.first() {
                Some(first) if *first == name => {
                    debug!(dir, node = %lock.node, action = %info.action, "lock acquired");
                    return Ok(lock);
                }
                Some(first) => first.clone(),
                None => {
                    lock.abandon().await;
                    return Err(TopoError::not_found(&lock.node));
                }
            };

            let now = Instant::now();
            if now >= deadline {
                let who = match store.get(&paths::join(dir, &holder)).await {
                    Ok((data, _)) => serde_json::from_slice::<LockInfo>(&data)
                        .map(|i| i.to_string())
                        .unwrap_or_else(|_| holder.clone()),
                    Err(_) => holder.clone(),
                };
                lock.abandon().await;
                info!(dir, holder = %who, "lock wait timed out");
                return Err(TopoError::DeadlineExceeded {
                    what: format!("waiting for lock {}, held by {}", dir, who),
                });
            }

            let wait = std::cmp::min(deadline - now, LOCK_POLL_INTERVAL);
            match watch.as_mut() {
                Some(w) => {
                    let _ = tokio::time::timeout(wait, w.next()).await;
                    w.drain();
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    /// Path of this lock's node.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// Lock directory.
    pub fn dir(&self) -> &str {
        &self.dir
    }

    /// Releases the lock.
    pub async fn release(mut self) -> Result<(), TopoError> {
        self.released = true;
        match self.store.delete(&self.node, None).await {
            Ok(()) => {
                debug!(node = %self.node, "lock released");
                Ok(())
            }
            // Purged by an operator.
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn abandon(&mut self) {
        self.released = true;
        if let Err(e) = self.store.delete(&self.node, None).await {
            if !e.is_not_found() {
                warn!(node = %self.node, error = %e, "failed to remove lock request");
            }
        }
    }
}

impl Drop for ActionLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Best effort when the holder forgot to release.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            let node = std::mem::take(&mut self.node);
            handle.spawn(async move {
                let _ = store.delete(&node, None).await;
            });
        }
    }
}

/// Takes the shard lock.
pub async fn lock_shard(
    store: Arc<dyn TopoStore>,
    keyspace: &str,
    shard: &str,
    action: &str,
    timeout: Duration,
) -> Result<ActionLock, TopoError> {
    let dir = paths::shard_action_dir(keyspace, shard);
    ActionLock::acquire(store, &dir, LockInfo::new(action), timeout).await
}

/// Takes the keyspace lock.
pub async fn lock_keyspace(
    store: Arc<dyn TopoStore>,
    keyspace: &str,
    action: &str,
    timeout: Duration,
) -> Result<ActionLock, TopoError> {
    let dir = paths::keyspace_action_dir(keyspace);
    ActionLock::acquire(store, &dir, LockInfo::new(action), timeout).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTopoServer;

    fn store() -> Arc<dyn TopoStore> {
        Arc::new(MemoryTopoServer::new().connect())
    }

    #[tokio::test]
    async fn test_second_locker_times_out() {
        let store = store();
        let first = lock_shard(store.clone(), "ks", "0", "ReparentShard", Duration::from_secs(1))
            .await
            .unwrap();
        let started = std::time::Instant::now();
        let err = lock_shard(store.clone(), "ks", "0", "ReparentShard", Duration::from_millis(200))
            .await
            .err()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            TopoError::DeadlineExceeded { what } => assert!(what.contains("ReparentShard")),
            other => panic!("unexpected error: {:?}", other),
        }
        // The waiter removed its own request.
        let dir = paths::shard_action_dir("ks", "0");
        assert_eq!(store.children(&dir).await.unwrap().len(), 1);
        first.release().await.unwrap();
        assert!(store.children(&dir).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let store = store();
        let first = lock_keyspace(store.clone(), "ks", "one", Duration::from_secs(1))
            .await
            .unwrap();
        let s2 = store.clone();
        let waiter = tokio::spawn(async move {
            lock_keyspace(s2, "ks", "two", Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        first.release().await.unwrap();
        let second = waiter.await.unwrap().unwrap();
        second.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_purge_is_ok() {
        let store = store();
        let lock = lock_shard(store.clone(), "ks", "0", "x", Duration::from_secs(1))
            .await
            .unwrap();
        store
            .delete_recursive(&paths::shard_action_dir("ks", "0"))
            .await
            .unwrap();
        lock.release().await.unwrap();
    }
}
