//! In-memory coordination store.
//!
//! `MemoryTopoServer` holds the whole tree in a `BTreeMap` behind a lock and
//! fans change events out over a broadcast channel. Each `connect()` opens a
//! session; ephemeral nodes created through it disappear when the session is
//! closed. Used in-process by tests and served over TCP by `tm-topo`.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::TopoError;
use crate::paths;
use crate::store::{check_path, sequence_name, CreateMode, TopoStore, Version, Watch, WatchEvent, WatchKind};

const EVENT_CAPACITY: usize = 4096;
const WATCH_BUFFER: usize = 256;

#[derive(Clone, Debug, Default)]
struct Node {
    data: Vec<u8>,
    version: Version,
    ephemeral_owner: Option<u64>,
    seq_counter: u64,
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sessions: HashSet<u64>,
}

impl Tree {
    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(k, _)| k.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

struct Inner {
    tree: RwLock<Tree>,
    events: broadcast::Sender<WatchEvent>,
    next_session: AtomicU64,
}

impl Inner {
    fn write(&self) -> Result<RwLockWriteGuard<'_, Tree>, TopoError> {
        self.tree.write().map_err(|e| TopoError::Unreachable {
            msg: format!("store lock poisoned: {}", e),
        })
    }

    fn emit(&self, path: &str, kind: WatchKind) {
        // No subscribers is fine.
        let _ = self.events.send(WatchEvent {
            path: path.to_string(),
            kind,
        });
    }

    fn check_session(tree: &Tree, session: u64) -> Result<(), TopoError> {
        if tree.sessions.contains(&session) {
            Ok(())
        } else {
            Err(TopoError::NoSession)
        }
    }

    fn ensure_parents(&self, tree: &mut Tree, path: &str) {
        let mut missing = Vec::new();
        let mut cur = paths::parent(path);
        while let Some(p) = cur {
            if p == "/" || tree.nodes.contains_key(p) {
                break;
            }
            missing.push(p.to_string());
            cur = paths::parent(p);
        }
        for p in missing.into_iter().rev() {
            tree.nodes.insert(
                p.clone(),
                Node {
                    version: 1,
                    ..Default::default()
                },
            );
            self.emit(&p, WatchKind::Created);
        }
    }

    fn create(
        &self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, TopoError> {
        let mut tree = self.write()?;
        Self::check_session(&tree, session)?;

        let full = if mode.sequential {
            let (parent, prefix) = path
                .rsplit_once('/')
                .ok_or_else(|| TopoError::InvalidArgument(format!("bad node path: {}", path)))?;
            let parent = if parent.is_empty() { "/" } else { parent };
            check_path(parent)?;
            // Make sure the parent exists so it can carry the counter.
            if parent != "/" && !tree.nodes.contains_key(parent) {
                self.ensure_parents(&mut tree, &paths::join(parent, "x"));
            }
            let counter = match tree.nodes.get_mut(parent) {
                Some(node) => {
                    node.seq_counter += 1;
                    node.seq_counter
                }
                None => {
                    return Err(TopoError::InvalidArgument(
                        "sequential nodes under the root are not supported".to_string(),
                    ))
                }
            };
            paths::join(parent, &sequence_name(prefix, counter))
        } else {
            check_path(path)?;
            if path == "/" {
                return Err(TopoError::NodeExists {
                    path: path.to_string(),
                });
            }
            path.to_string()
        };

        if tree.nodes.contains_key(&full) {
            return Err(TopoError::NodeExists { path: full });
        }
        self.ensure_parents(&mut tree, &full);
        tree.nodes.insert(
            full.clone(),
            Node {
                data,
                version: 1,
                ephemeral_owner: mode.ephemeral.then_some(session),
                seq_counter: 0,
            },
        );
        self.emit(&full, WatchKind::Created);
        Ok(full)
    }

    fn set(
        &self,
        session: u64,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version, TopoError> {
        check_path(path)?;
        let mut tree = self.write()?;
        Self::check_session(&tree, session)?;
        match tree.nodes.get_mut(path) {
            Some(node) => {
                if let Some(exp) = expected {
                    if node.version != exp {
                        return Err(TopoError::BadVersion {
                            path: path.to_string(),
                            expected: exp,
                            found: node.version,
                        });
                    }
                }
                node.data = data;
                node.version += 1;
                let version = node.version;
                self.emit(path, WatchKind::DataChanged);
                Ok(version)
            }
            None if expected.is_some() => Err(TopoError::not_found(path)),
            None => {
                self.ensure_parents(&mut tree, path);
                tree.nodes.insert(
                    path.to_string(),
                    Node {
                        data,
                        version: 1,
                        ..Default::default()
                    },
                );
                self.emit(path, WatchKind::Created);
                Ok(1)
            }
        }
    }

    fn delete(&self, session: u64, path: &str, expected: Option<Version>) -> Result<(), TopoError> {
        check_path(path)?;
        let mut tree = self.write()?;
        Self::check_session(&tree, session)?;
        let node = tree.nodes.get(path).ok_or_else(|| TopoError::not_found(path))?;
        if let Some(exp) = expected {
            if node.version != exp {
                return Err(TopoError::BadVersion {
                    path: path.to_string(),
                    expected: exp,
                    found: node.version,
                });
            }
        }
        if tree.has_children(path) {
            return Err(TopoError::NotEmpty {
                path: path.to_string(),
            });
        }
        tree.nodes.remove(path);
        self.emit(path, WatchKind::Deleted);
        Ok(())
    }

    fn delete_recursive(&self, session: u64, path: &str) -> Result<(), TopoError> {
        check_path(path)?;
        let mut tree = self.write()?;
        Self::check_session(&tree, session)?;
        let prefix = child_prefix(path);
        let mut doomed: Vec<String> = tree
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if path != "/" && tree.nodes.contains_key(path) {
            doomed.push(path.to_string());
        }
        // Deepest first so watchers see children go before parents.
        doomed.sort_by_key(|p| std::cmp::Reverse(p.matches('/').count()));
        for p in doomed {
            tree.nodes.remove(&p);
            self.emit(&p, WatchKind::Deleted);
        }
        Ok(())
    }

    fn close_session(&self, session: u64) -> Result<usize, TopoError> {
        let mut tree = self.write()?;
        if !tree.sessions.remove(&session) {
            return Ok(0);
        }
        let owned: Vec<String> = tree
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for p in &owned {
            tree.nodes.remove(p);
            self.emit(p, WatchKind::Deleted);
        }
        debug!(session, ephemerals = owned.len(), "closed topo session");
        Ok(owned.len())
    }
}

/// Shared in-memory tree. Cheap to clone.
#[derive(Clone)]
pub struct MemoryTopoServer {
    inner: Arc<Inner>,
}

impl MemoryTopoServer {
    /// Creates an empty tree.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tree: RwLock::new(Tree::default()),
                events,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a new session.
    pub fn connect(&self) -> MemoryTopoClient {
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut tree) = self.inner.write() {
            tree.sessions.insert(session);
        }
        MemoryTopoClient {
            inner: self.inner.clone(),
            session,
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Closes a session, deleting its ephemeral nodes. Returns how many were
    /// removed.
    pub fn close_session(&self, session: u64) -> Result<usize, TopoError> {
        self.inner.close_session(session)
    }

    /// Number of nodes in the tree.
    pub fn node_count(&self) -> usize {
        self.inner.tree.read().map(|t| t.nodes.len()).unwrap_or(0)
    }

    /// Session that owns an ephemeral node, if any.
    pub fn ephemeral_owner(&self, path: &str) -> Option<u64> {
        self.inner
            .tree
            .read()
            .ok()
            .and_then(|t| t.nodes.get(path).and_then(|n| n.ephemeral_owner))
    }

    /// True while the session is open.
    pub fn session_alive(&self, session: u64) -> bool {
        self.inner
            .tree
            .read()
            .map(|t| t.sessions.contains(&session))
            .unwrap_or(false)
    }
}

impl Default for MemoryTopoServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Session-bound handle to a `MemoryTopoServer`.
#[derive(Clone)]
pub struct MemoryTopoClient {
    inner: Arc<Inner>,
    session: u64,
    reachable: Arc<AtomicBool>,
}

impl MemoryTopoClient {
    /// Session id of this client.
    pub fn session_id(&self) -> u64 {
        self.session
    }

    /// Simulates a network partition between this client and the store.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Closes the session; ephemeral nodes it created disappear.
    pub fn close_session(&self) -> Result<usize, TopoError> {
        self.inner.close_session(self.session)
    }

    fn check_reachable(&self) -> Result<(), TopoError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TopoError::Unreachable {
                msg: "partitioned from coordination store".to_string(),
            })
        }
    }

    fn read<T>(&self, f: impl FnOnce(&Tree) -> Result<T, TopoError>) -> Result<T, TopoError> {
        self.check_reachable()?;
        let tree = self.inner.tree.read().map_err(|e| TopoError::Unreachable {
            msg: format!("store lock poisoned: {}", e),
        })?;
        Inner::check_session(&tree, self.session)?;
        f(&tree)
    }
}

#[async_trait]
impl TopoStore for MemoryTopoClient {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version), TopoError> {
        check_path(path)?;
        self.read(|tree| {
            tree.nodes
                .get(path)
                .map(|n| (n.data.clone(), n.version))
                .ok_or_else(|| TopoError::not_found(path))
        })
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, TopoError> {
        self.check_reachable()?;
        self.inner.create(self.session, path, data, mode)
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version, TopoError> {
        self.check_reachable()?;
        self.inner.set(self.session, path, data, expected)
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<(), TopoError> {
        self.check_reachable()?;
        self.inner.delete(self.session, path, expected)
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), TopoError> {
        self.check_reachable()?;
        self.inner.delete_recursive(self.session, path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, TopoError> {
        check_path(path)?;
        self.read(|tree| {
            if path != "/" && !tree.nodes.contains_key(path) {
                return Err(TopoError::not_found(path));
            }
            Ok(tree.child_names(path))
        })
    }

    async fn exists(&self, path: &str) -> Result<bool, TopoError> {
        check_path(path)?;
        self.read(|tree| Ok(path == "/" || tree.nodes.contains_key(path)))
    }

    async fn watch(&self, path: &str) -> Result<Watch, TopoError> {
        check_path(path)?;
        self.read(|_| Ok(()))?;
        // Subscribe before returning so nothing after this call is missed.
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let watched = path.to_string();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(ev) => ev,
                    Err(broadcast::error::RecvError::Lagged(_)) => WatchEvent {
                        path: watched.clone(),
                        kind: WatchKind::Resync,
                    },
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let relevant = event.path == watched
                    || paths::parent(&event.path) == Some(watched.as_str());
                if relevant && tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(Watch::new(rx, task))
    }

    async fn close(&self) -> Result<(), TopoError> {
        self.close_session().map(|_| ())
    }
}
