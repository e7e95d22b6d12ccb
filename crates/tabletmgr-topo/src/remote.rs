//! Coordination store over TCP.
//!
//! `serve_memory_topo` exposes a `MemoryTopoServer` on a listener; each
//! accepted connection is one session, closed when the peer disconnects.
//! `RemoteTopoClient` speaks the same protocol and implements `TopoStore`.
//! Remote watches poll node and child versions and synthesize events.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::TopoError;
use crate::memory::{MemoryTopoClient, MemoryTopoServer};
use crate::paths;
use crate::store::{CreateMode, TopoStore, Version, Watch, WatchEvent, WatchKind};
use crate::wire::{read_frame, write_frame};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default watch poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Request sent to the topo server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopoRequest {
    /// Read a node.
    Get {
        /// Node path.
        path: String,
    },
    /// Create a node.
    Create {
        /// Node path (parent plus prefix for sequential nodes).
        path: String,
        /// Payload.
        data: Vec<u8>,
        /// Creation mode.
        mode: CreateMode,
    },
    /// Replace node data.
    Set {
        /// Node path.
        path: String,
        /// Payload.
        data: Vec<u8>,
        /// Required current version.
        expected: Option<Version>,
    },
    /// Delete a leaf.
    Delete {
        /// Node path.
        path: String,
        /// Required current version.
        expected: Option<Version>,
    },
    /// Delete a subtree.
    DeleteRecursive {
        /// Subtree root.
        path: String,
    },
    /// List children.
    Children {
        /// Parent path.
        path: String,
    },
    /// Existence check.
    Exists {
        /// Node path.
        path: String,
    },
    /// Node version plus child versions, used by polling watches.
    Snapshot {
        /// Node path.
        path: String,
    },
}

/// Serializable form of `TopoError`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopoFault {
    /// See `TopoError::NotFound`.
    NotFound(String),
    /// See `TopoError::NodeExists`.
    NodeExists(String),
    /// See `TopoError::BadVersion`.
    BadVersion(String, u64, u64),
    /// See `TopoError::NotEmpty`.
    NotEmpty(String),
    /// See `TopoError::NoSession`.
    NoSession,
    /// See `TopoError::InvalidArgument`.
    InvalidArgument(String),
    /// Anything else, as text.
    Other(String),
}

impl From<TopoError> for TopoFault {
    fn from(e: TopoError) -> Self {
        match e {
            TopoError::NotFound { path } => TopoFault::NotFound(path),
            TopoError::NodeExists { path } => TopoFault::NodeExists(path),
            TopoError::BadVersion {
                path,
                expected,
                found,
            } => TopoFault::BadVersion(path, expected, found),
            TopoError::NotEmpty { path } => TopoFault::NotEmpty(path),
            TopoError::NoSession => TopoFault::NoSession,
            TopoError::InvalidArgument(msg) => TopoFault::InvalidArgument(msg),
            other => TopoFault::Other(other.to_string()),
        }
    }
}

impl From<TopoFault> for TopoError {
    fn from(f: TopoFault) -> Self {
        match f {
            TopoFault::NotFound(path) => TopoError::NotFound { path },
            TopoFault::NodeExists(path) => TopoError::NodeExists { path },
            TopoFault::BadVersion(path, expected, found) => TopoError::BadVersion {
                path,
                expected,
                found,
            },
            TopoFault::NotEmpty(path) => TopoError::NotEmpty { path },
            TopoFault::NoSession => TopoError::NoSession,
            TopoFault::InvalidArgument(msg) => TopoError::InvalidArgument(msg),
            TopoFault::Other(msg) => TopoError::Unreachable { msg },
        }
    }
}

/// Version of a node and of each of its children.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    /// Node version, `None` when the node is absent.
    pub version: Option<Version>,
    /// Child name to version.
    pub children: BTreeMap<String, Version>,
}

/// Response from the topo server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TopoResponse {
    /// Node data and version.
    Data(Vec<u8>, Version),
    /// Path of a created node.
    Created(String),
    /// New version after a set.
    Version(Version),
    /// Success without payload.
    Done,
    /// Child names.
    Children(Vec<String>),
    /// Existence flag.
    Exists(bool),
    /// Versions for watch polling.
    Snapshot(NodeSnapshot),
    /// Failure.
    Error(TopoFault),
}

async fn snapshot_of(store: &dyn TopoStore, path: &str) -> Result<NodeSnapshot, TopoError> {
    let version = match store.get(path).await {
        Ok((_, v)) => Some(v),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e),
    };
    let mut children = BTreeMap::new();
    if version.is_some() {
        for name in store.children(path).await.unwrap_or_default() {
            if let Ok((_, v)) = store.get(&paths::join(path, &name)).await {
                children.insert(name, v);
            }
        }
    }
    Ok(NodeSnapshot { version, children })
}

async fn handle_request(client: &MemoryTopoClient, req: TopoRequest) -> TopoResponse {
    let result = match req {
        TopoRequest::Get { path } => client.get(&path).await.map(|(d, v)| TopoResponse::Data(d, v)),
        TopoRequest::Create { path, data, mode } => {
            client.create(&path, data, mode).await.map(TopoResponse::Created)
        }
        TopoRequest::Set {
            path,
            data,
            expected,
        } => client.set(&path, data, expected).await.map(TopoResponse::Version),
        TopoRequest::Delete { path, expected } => {
            client.delete(&path, expected).await.map(|_| TopoResponse::Done)
        }
        TopoRequest::DeleteRecursive { path } => {
            client.delete_recursive(&path).await.map(|_| TopoResponse::Done)
        }
        TopoRequest::Children { path } => client.children(&path).await.map(TopoResponse::Children),
        TopoRequest::Exists { path } => client.exists(&path).await.map(TopoResponse::Exists),
        TopoRequest::Snapshot { path } => snapshot_of(client, &path).await.map(TopoResponse::Snapshot),
    };
    result.unwrap_or_else(|e| TopoResponse::Error(e.into()))
}

async fn serve_connection(server: MemoryTopoServer, mut stream: TcpStream, peer: String) {
    let client = server.connect();
    debug!(peer = %peer, session = client.session_id(), "topo session opened");
    loop {
        let req: TopoRequest = match read_frame(&mut stream).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer, error = %e, "topo connection read failed");
                break;
            }
        };
        let resp = handle_request(&client, req).await;
        if let Err(e) = write_frame(&mut stream, &resp).await {
            warn!(peer = %peer, error = %e, "topo connection write failed");
            break;
        }
    }
    match client.close_session() {
        Ok(n) => debug!(peer = %peer, ephemerals = n, "topo session closed"),
        Err(e) => warn!(peer = %peer, error = %e, "failed to close topo session"),
    }
}

/// Serves `server` on `listener` until the listener fails.
pub async fn serve_memory_topo(listener: TcpListener, server: MemoryTopoServer) -> Result<(), TopoError> {
    info!(addr = ?listener.local_addr().ok(), "topo server listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        tokio::spawn(serve_connection(server.clone(), stream, peer.to_string()));
    }
}

struct RemoteInner {
    addr: String,
    stream: Mutex<TcpStream>,
    broken: AtomicBool,
    request_timeout: Duration,
    poll_interval: Duration,
}

/// `TopoStore` over a TCP connection to `tm-topo`. The connection is the
/// session: dropping the last clone closes it.
#[derive(Clone)]
pub struct RemoteTopoClient {
    inner: Arc<RemoteInner>,
}

impl RemoteTopoClient {
    /// Connects with default timeouts.
    pub async fn connect(addr: &str) -> Result<Self, TopoError> {
        Self::connect_with(addr, DEFAULT_REQUEST_TIMEOUT, DEFAULT_POLL_INTERVAL).await
    }

    /// Connects with explicit request timeout and watch poll interval.
    pub async fn connect_with(
        addr: &str,
        request_timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self, TopoError> {
        let stream = tokio::time::timeout(request_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TopoError::Unreachable {
                msg: format!("connect to {} timed out", addr),
            })?
            .map_err(|e| TopoError::Unreachable {
                msg: format!("connect to {}: {}", addr, e),
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Self {
            inner: Arc::new(RemoteInner {
                addr: addr.to_string(),
                stream: Mutex::new(stream),
                broken: AtomicBool::new(false),
                request_timeout,
                poll_interval,
            }),
        })
    }

    /// Server address.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    async fn call(&self, req: TopoRequest) -> Result<TopoResponse, TopoError> {
        let inner = &self.inner;
        if inner.broken.load(Ordering::SeqCst) {
            return Err(TopoError::Unreachable {
                msg: format!("connection to {} is broken", inner.addr),
            });
        }
        let mut stream = inner.stream.lock().await;
        let exchange = async {
            write_frame(&mut *stream, &req).await?;
            read_frame::<_, TopoResponse>(&mut *stream).await
        };
        let outcome = tokio::time::timeout(inner.request_timeout, exchange).await;
        let resp = match outcome {
            Ok(Ok(Some(resp))) => resp,
            Ok(Ok(None)) => {
                inner.broken.store(true, Ordering::SeqCst);
                return Err(TopoError::Unreachable {
                    msg: format!("{} closed the connection", inner.addr),
                });
            }
            Ok(Err(e)) => {
                inner.broken.store(true, Ordering::SeqCst);
                return Err(TopoError::Unreachable {
                    msg: format!("{}: {}", inner.addr, e),
                });
            }
            Err(_) => {
                // Stream position is unknown after a timeout.
                inner.broken.store(true, Ordering::SeqCst);
                return Err(TopoError::Unreachable {
                    msg: format!(
                        "request to {} timed out after {}ms",
                        inner.addr,
                        inner.request_timeout.as_millis()
                    ),
                });
            }
        };
        match resp {
            TopoResponse::Error(fault) => Err(fault.into()),
            other => Ok(other),
        }
    }

    async fn snapshot(&self, path: &str) -> Result<NodeSnapshot, TopoError> {
        match self.call(TopoRequest::Snapshot { path: path.to_string() }).await? {
            TopoResponse::Snapshot(s) => Ok(s),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(resp: TopoResponse) -> TopoError {
    TopoError::Unreachable {
        msg: format!("unexpected response: {:?}", resp),
    }
}

/// Events implied by two successive snapshots of `path`.
pub fn diff_snapshots(path: &str, old: &NodeSnapshot, new: &NodeSnapshot) -> Vec<WatchEvent> {
    let mut events = Vec::new();
    let mut push = |p: String, kind| events.push(WatchEvent { path: p, kind });
    match (old.version, new.version) {
        (None, Some(_)) => push(path.to_string(), WatchKind::Created),
        (Some(_), None) => push(path.to_string(), WatchKind::Deleted),
        (Some(a), Some(b)) if a != b => push(path.to_string(), WatchKind::DataChanged),
        _ => {}
    }
    for (name, v) in &old.children {
        match new.children.get(name) {
            None => push(paths::join(path, name), WatchKind::Deleted),
            Some(nv) if nv != v => push(paths::join(path, name), WatchKind::DataChanged),
            _ => {}
        }
    }
    for name in new.children.keys() {
        if !old.children.contains_key(name) {
            push(paths::join(path, name), WatchKind::Created);
        }
    }
    events
}

#[async_trait]
impl TopoStore for RemoteTopoClient {
    async fn get(&self, path: &str) -> Result<(Vec<u8>, Version), TopoError> {
        match self.call(TopoRequest::Get { path: path.to_string() }).await? {
            TopoResponse::Data(d, v) => Ok((d, v)),
            other => Err(unexpected(other)),
        }
    }

    async fn create(
        &self,
        path: &str,
        data: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, TopoError> {
        let req = TopoRequest::Create {
            path: path.to_string(),
            data,
            mode,
        };
        match self.call(req).await? {
            TopoResponse::Created(p) => Ok(p),
            other => Err(unexpected(other)),
        }
    }

    async fn set(
        &self,
        path: &str,
        data: Vec<u8>,
        expected: Option<Version>,
    ) -> Result<Version, TopoError> {
        let req = TopoRequest::Set {
            path: path.to_string(),
            data,
            expected,
        };
        match self.call(req).await? {
            TopoResponse::Version(v) => Ok(v),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str, expected: Option<Version>) -> Result<(), TopoError> {
        let req = TopoRequest::Delete {
            path: path.to_string(),
            expected,
        };
        match self.call(req).await? {
            TopoResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), TopoError> {
        match self.call(TopoRequest::DeleteRecursive { path: path.to_string() }).await? {
            TopoResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, TopoError> {
        match self.call(TopoRequest::Children { path: path.to_string() }).await? {
            TopoResponse::Children(c) => Ok(c),
            other => Err(unexpected(other)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, TopoError> {
        match self.call(TopoRequest::Exists { path: path.to_string() }).await? {
            TopoResponse::Exists(b) => Ok(b),
            other => Err(unexpected(other)),
        }
    }

    async fn watch(&self, path: &str) -> Result<Watch, TopoError> {
        let mut last = self.snapshot(path).await?;
        let (tx, rx) = mpsc::channel(256);
        let client = self.clone();
        let watched = path.to_string();
        let interval = self.inner.poll_interval;
        let task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let next = match client.snapshot(&watched).await {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(path = %watched, error = %e, "watch poll failed");
                        if e.is_unreachable() {
                            break;
                        }
                        continue;
                    }
                };
                for event in diff_snapshots(&watched, &last, &next) {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                last = next;
            }
        });
        Ok(Watch::new(rx, task))
    }

    async fn close(&self) -> Result<(), TopoError> {
        use tokio::io::AsyncWriteExt;
        self.inner.broken.store(true, Ordering::SeqCst);
        let mut stream = self.inner.stream.lock().await;
        stream.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn start_server() -> (MemoryTopoServer, String) {
        let server = MemoryTopoServer::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(serve_memory_topo(listener, server.clone()));
        (server, addr)
    }

    #[test]
    fn test_diff_snapshots() {
        let old = NodeSnapshot {
            version: Some(1),
            children: [("a".to_string(), 1), ("b".to_string(), 1)].into_iter().collect(),
        };
        let new = NodeSnapshot {
            version: Some(1),
            children: [("b".to_string(), 2), ("c".to_string(), 1)].into_iter().collect(),
        };
        let events = diff_snapshots("/q", &old, &new);
        assert_eq!(events.len(), 3);
        assert!(events.contains(&WatchEvent {
            path: "/q/a".to_string(),
            kind: WatchKind::Deleted
        }));
        assert!(events.contains(&WatchEvent {
            path: "/q/b".to_string(),
            kind: WatchKind::DataChanged
        }));
        assert!(events.contains(&WatchEvent {
            path: "/q/c".to_string(),
            kind: WatchKind::Created
        }));
    }

    #[tokio::test]
    async fn test_remote_roundtrip_and_errors() {
        let (_server, addr) = start_server().await;
        let client = RemoteTopoClient::connect(&addr).await.unwrap();
        client.create("/a/b", b"v".to_vec(), CreateMode::PERSISTENT).await.unwrap();
        assert_eq!(client.get("/a/b").await.unwrap(), (b"v".to_vec(), 1));
        assert!(client.get("/nope").await.unwrap_err().is_not_found());
        let err = client.set("/a/b", vec![], Some(7)).await.unwrap_err();
        assert!(matches!(err, TopoError::BadVersion { .. }));
        assert_eq!(client.children("/a").await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_disconnect_drops_ephemerals() {
        let (server, addr) = start_server().await;
        let observer = server.connect();
        {
            let client = RemoteTopoClient::connect(&addr).await.unwrap();
            client.create("/t/pid", vec![], CreateMode::EPHEMERAL).await.unwrap();
            assert!(observer.exists("/t/pid").await.unwrap());
        }
        let mut gone = false;
        for _ in 0..50 {
            if !observer.exists("/t/pid").await.unwrap() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(gone);
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = RemoteTopoClient::connect(&addr).await.err().unwrap();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn test_polling_watch() {
        let (_server, addr) = start_server().await;
        let client = RemoteTopoClient::connect_with(
            &addr,
            DEFAULT_REQUEST_TIMEOUT,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        client.create("/w", vec![], CreateMode::PERSISTENT).await.unwrap();
        let mut watch = client.watch("/w").await.unwrap();
        client.create("/w/x", vec![], CreateMode::PERSISTENT).await.unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(2), watch.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.path, "/w/x");
        assert_eq!(ev.kind, WatchKind::Created);
    }
}
