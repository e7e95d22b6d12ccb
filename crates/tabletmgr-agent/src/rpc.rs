//! Agent RPC: liveness, replication status and snapshot file transfer.
//!
//! Each call is one short TCP connection: a `Hello` carrying the optional
//! shared token, then one request and one response, framed like the topology
//! protocol. `LocalDialer` routes the same calls to in-process agents.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tabletmgr_topo::{read_frame, write_frame, Tablet, TabletAlias, TabletType, Topo};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::engine::{DataEngine, Position, ReplicationStatus};
use crate::error::RpcError;
use crate::snapshot::snapshot_file_path;

/// Request bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcBody {
    /// Liveness probe.
    Ping,
    /// Engine replication state.
    ReplicationStatus,
    /// Contents of a file under the snapshot root.
    FetchFile {
        /// Path relative to the snapshot root.
        path: String,
    },
}

/// Answer to `Ping`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    /// Tablet answering.
    pub alias: TabletAlias,
    /// Type in its record, when readable.
    pub tablet_type: Option<TabletType>,
    /// Engine position.
    pub position: Position,
    /// Engine read-only flag.
    pub read_only: bool,
}

/// Response bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcReply {
    /// Answer to `Ping`.
    Pong(PingReply),
    /// Answer to `ReplicationStatus`.
    Status(ReplicationStatus),
    /// Answer to `FetchFile`.
    File(Vec<u8>),
    /// The request failed on the agent.
    Error(String),
}

#[derive(Debug, Serialize, Deserialize)]
enum Hello {
    Hello { token: Option<String> },
    Welcome,
    Denied,
}

/// Server side of the agent RPC.
pub struct RpcService {
    alias: TabletAlias,
    topo: Topo,
    engine: Arc<dyn DataEngine>,
    snapshot_root: PathBuf,
    auth_token: Option<String>,
    up: AtomicBool,
}

impl RpcService {
    /// Creates the service for one tablet.
    pub fn new(
        alias: TabletAlias,
        topo: Topo,
        engine: Arc<dyn DataEngine>,
        snapshot_root: PathBuf,
        auth_token: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            alias,
            topo,
            engine,
            snapshot_root,
            auth_token,
            up: AtomicBool::new(true),
        })
    }

    /// Tablet served.
    pub fn alias(&self) -> &TabletAlias {
        &self.alias
    }

    /// Stops answering; callers see dial failures.
    pub fn shut_down(&self) {
        self.up.store(false, Ordering::SeqCst);
    }

    /// False once shut down.
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Pass/fail check of a peer token.
    pub fn authorize(&self, token: Option<&str>) -> bool {
        match &self.auth_token {
            None => true,
            Some(expected) => match token {
                Some(got) => bool::from(expected.as_bytes().ct_eq(got.as_bytes())),
                None => false,
            },
        }
    }

    /// Answers one request.
    pub async fn handle(&self, body: RpcBody) -> RpcReply {
        let result = match body {
            RpcBody::Ping => self.ping().await,
            RpcBody::ReplicationStatus => self
                .engine
                .replication_status()
                .await
                .map(RpcReply::Status)
                .map_err(|e| e.to_string()),
            RpcBody::FetchFile { path } => self.fetch_file(&path).await,
        };
        result.unwrap_or_else(RpcReply::Error)
    }

    async fn ping(&self) -> Result<RpcReply, String> {
        self.engine.ping().await.map_err(|e| e.to_string())?;
        let position = self.engine.position().await.map_err(|e| e.to_string())?;
        let read_only = self.engine.is_read_only().await.map_err(|e| e.to_string())?;
        let tablet_type = self.topo.get_tablet(&self.alias).await.ok().map(|t| t.tablet_type);
        Ok(RpcReply::Pong(PingReply {
            alias: self.alias.clone(),
            tablet_type,
            position,
            read_only,
        }))
    }

    async fn fetch_file(&self, path: &str) -> Result<RpcReply, String> {
        let full = snapshot_file_path(&self.snapshot_root, path)
            .ok_or_else(|| format!("invalid snapshot path: {}", path))?;
        tokio::fs::read(&full)
            .await
            .map(RpcReply::File)
            .map_err(|e| format!("cannot read {}: {}", full.display(), e))
    }
}

/// Serves `service` on `listener` until the task is dropped.
pub async fn serve_rpc(listener: TcpListener, service: Arc<RpcService>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, service).await {
                debug!(peer = %peer, error = %e, "rpc connection ended");
            }
        });
    }
}

async fn serve_connection(mut stream: TcpStream, service: Arc<RpcService>) -> Result<(), tabletmgr_topo::WireError> {
    let Some(Hello::Hello { token }) = read_frame::<_, Hello>(&mut stream).await? else {
        return Ok(());
    };
    if !service.is_up() {
        return Ok(());
    }
    if !service.authorize(token.as_deref()) {
        warn!(tablet = %service.alias, "rejected rpc peer with bad token");
        write_frame(&mut stream, &Hello::Denied).await?;
        return Ok(());
    }
    write_frame(&mut stream, &Hello::Welcome).await?;
    if let Some(body) = read_frame::<_, RpcBody>(&mut stream).await? {
        let reply = service.handle(body).await;
        write_frame(&mut stream, &reply).await?;
    }
    Ok(())
}

/// Reaches other tablets' agents.
#[async_trait]
pub trait TabletDialer: Send + Sync {
    /// Sends one request to the tablet's agent, bounded by `timeout`.
    async fn call(&self, tablet: &Tablet, body: RpcBody, timeout: Duration) -> Result<RpcReply, RpcError>;
}

fn remote(addr: &str, reply: RpcReply) -> Result<RpcReply, RpcError> {
    match reply {
        RpcReply::Error(msg) => Err(RpcError::Remote {
            addr: addr.to_string(),
            msg,
        }),
        other => Ok(other),
    }
}

/// Dials agents over TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpDialer {
    token: Option<String>,
}

impl TcpDialer {
    /// Creates a dialer presenting `token` to peers.
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    async fn exchange(&self, stream: &mut TcpStream, addr: &str, body: RpcBody) -> Result<RpcReply, RpcError> {
        write_frame(stream, &Hello::Hello { token: self.token.clone() }).await?;
        match read_frame::<_, Hello>(stream).await? {
            Some(Hello::Welcome) => {}
            Some(Hello::Denied) => {
                return Err(RpcError::Unauthenticated {
                    addr: addr.to_string(),
                })
            }
            _ => {
                return Err(RpcError::Remote {
                    addr: addr.to_string(),
                    msg: "agent closed the connection".to_string(),
                })
            }
        }
        write_frame(stream, &body).await?;
        match read_frame::<_, RpcReply>(stream).await? {
            Some(reply) => remote(addr, reply),
            None => Err(RpcError::Remote {
                addr: addr.to_string(),
                msg: "agent closed the connection".to_string(),
            }),
        }
    }
}

#[async_trait]
impl TabletDialer for TcpDialer {
    async fn call(&self, tablet: &Tablet, body: RpcBody, timeout: Duration) -> Result<RpcReply, RpcError> {
        let addr = tablet.agent_addr();
        let mut stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::DialFailed {
                    addr,
                    msg: e.to_string(),
                })
            }
            Err(_) => {
                return Err(RpcError::DialFailed {
                    addr,
                    msg: format!("connect timed out after {}ms", timeout.as_millis()),
                })
            }
        };
        match tokio::time::timeout(timeout, self.exchange(&mut stream, &addr, body)).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                addr,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Routes calls to agents running in this process.
#[derive(Default)]
pub struct LocalDialer {
    services: DashMap<TabletAlias, Arc<RpcService>>,
    token: Option<String>,
}

impl LocalDialer {
    /// Creates an empty dialer presenting `token`.
    pub fn new(token: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            services: DashMap::new(),
            token,
        })
    }

    /// Makes an agent reachable.
    pub fn register(&self, service: Arc<RpcService>) {
        self.services.insert(service.alias().clone(), service);
    }

    /// Makes an agent unreachable.
    pub fn unregister(&self, alias: &TabletAlias) {
        self.services.remove(alias);
    }
}

#[async_trait]
impl TabletDialer for LocalDialer {
    async fn call(&self, tablet: &Tablet, body: RpcBody, timeout: Duration) -> Result<RpcReply, RpcError> {
        let addr = tablet.agent_addr();
        let service = self
            .services
            .get(&tablet.alias)
            .map(|s| s.value().clone())
            .filter(|s| s.is_up())
            .ok_or_else(|| RpcError::DialFailed {
                addr: addr.clone(),
                msg: "connection refused".to_string(),
            })?;
        if !service.authorize(self.token.as_deref()) {
            return Err(RpcError::Unauthenticated { addr });
        }
        match tokio::time::timeout(timeout, service.handle(body)).await {
            Ok(reply) => remote(&addr, reply),
            Err(_) => Err(RpcError::Timeout {
                addr,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

/// Pings a tablet's agent.
pub async fn ping(dialer: &dyn TabletDialer, tablet: &Tablet, timeout: Duration) -> Result<PingReply, RpcError> {
    match dialer.call(tablet, RpcBody::Ping, timeout).await? {
        RpcReply::Pong(p) => Ok(p),
        other => Err(unexpected(tablet, other)),
    }
}

/// Reads a tablet's replication status.
pub async fn replication_status(
    dialer: &dyn TabletDialer,
    tablet: &Tablet,
    timeout: Duration,
) -> Result<ReplicationStatus, RpcError> {
    match dialer.call(tablet, RpcBody::ReplicationStatus, timeout).await? {
        RpcReply::Status(s) => Ok(s),
        other => Err(unexpected(tablet, other)),
    }
}

/// Fetches a snapshot file from a tablet's agent.
pub async fn fetch_file(
    dialer: &dyn TabletDialer,
    tablet: &Tablet,
    path: &str,
    timeout: Duration,
) -> Result<Vec<u8>, RpcError> {
    let body = RpcBody::FetchFile {
        path: path.to_string(),
    };
    match dialer.call(tablet, body, timeout).await? {
        RpcReply::File(data) => Ok(data),
        other => Err(unexpected(tablet, other)),
    }
}

fn unexpected(tablet: &Tablet, reply: RpcReply) -> RpcError {
    RpcError::Remote {
        addr: tablet.agent_addr(),
        msg: format!("unexpected reply: {:?}", reply),
    }
}
