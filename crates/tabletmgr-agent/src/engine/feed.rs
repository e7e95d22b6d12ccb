//! How replicas reach their source's change log.
//!
//! In-process clusters resolve engine addresses through an `EngineDirectory`;
//! separate processes use `TcpFeed` against `serve_engine_feed`, which
//! `tm-agent` runs on the engine port.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tabletmgr_topo::{read_frame, write_frame};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{DataEngine, LogBatch, Position};
use crate::error::EngineError;

/// Pulls change batches from a source engine by address.
#[async_trait]
pub trait ReplicationFeed: Send + Sync {
    /// Events for `db` after `after` on the engine at `addr`.
    async fn pull(&self, addr: &str, db: &str, after: Position, limit: usize) -> Result<LogBatch, EngineError>;
}

/// Address book of in-process engines.
#[derive(Default)]
pub struct EngineDirectory {
    engines: DashMap<String, Weak<dyn DataEngine>>,
}

impl EngineDirectory {
    /// Creates an empty directory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers an engine under its address.
    pub fn register(&self, engine: &Arc<dyn DataEngine>) {
        self.engines.insert(engine.addr(), Arc::downgrade(engine));
    }

    /// Removes an engine, making it unreachable to replicas.
    pub fn unregister(&self, addr: &str) {
        self.engines.remove(addr);
    }

    /// Looks up a live engine.
    pub fn get(&self, addr: &str) -> Option<Arc<dyn DataEngine>> {
        self.engines.get(addr).and_then(|w| w.upgrade())
    }
}

#[async_trait]
impl ReplicationFeed for EngineDirectory {
    async fn pull(&self, addr: &str, db: &str, after: Position, limit: usize) -> Result<LogBatch, EngineError> {
        let engine = self.get(addr).ok_or_else(|| EngineError::SourceUnreachable {
            addr: addr.to_string(),
            msg: "no engine at this address".to_string(),
        })?;
        engine.events_after(db, after, limit).await
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum FeedRequest {
    Pull { db: String, after: Position, limit: usize },
}

#[derive(Debug, Serialize, Deserialize)]
enum FeedResponse {
    Batch(LogBatch),
    Error(String),
}

/// Feed over TCP, one short connection per pull.
pub struct TcpFeed {
    timeout: Duration,
}

impl TcpFeed {
    /// Creates a feed with a per-pull time bound.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

async fn pull_once(addr: &str, req: &FeedRequest) -> Result<LogBatch, String> {
    let mut stream = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
    write_frame(&mut stream, req).await.map_err(|e| e.to_string())?;
    match read_frame::<_, FeedResponse>(&mut stream).await {
        Ok(Some(FeedResponse::Batch(batch))) => Ok(batch),
        Ok(Some(FeedResponse::Error(msg))) => Err(msg),
        Ok(None) => Err("connection closed".to_string()),
        Err(e) => Err(e.to_string()),
    }
}

#[async_trait]
impl ReplicationFeed for TcpFeed {
    async fn pull(&self, addr: &str, db: &str, after: Position, limit: usize) -> Result<LogBatch, EngineError> {
        let req = FeedRequest::Pull {
            db: db.to_string(),
            after,
            limit,
        };
        let msg = match tokio::time::timeout(self.timeout, pull_once(addr, &req)).await {
            Ok(Ok(batch)) => return Ok(batch),
            Ok(Err(msg)) => msg,
            Err(_) => format!("timed out after {}ms", self.timeout.as_millis()),
        };
        Err(EngineError::SourceUnreachable {
            addr: addr.to_string(),
            msg,
        })
    }
}

/// Serves an engine's change log to remote replicas.
pub async fn serve_engine_feed(listener: TcpListener, engine: Arc<dyn DataEngine>) -> std::io::Result<()> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Ok(Some(req)) = read_frame::<_, FeedRequest>(&mut stream).await {
                let FeedRequest::Pull { db, after, limit } = req;
                let resp = match engine.events_after(&db, after, limit).await {
                    Ok(batch) => FeedResponse::Batch(batch),
                    Err(e) => FeedResponse::Error(e.to_string()),
                };
                if let Err(e) = write_frame(&mut stream, &resp).await {
                    warn!(peer = %peer, error = %e, "feed write failed");
                    break;
                }
            }
            debug!(peer = %peer, "feed connection closed");
        });
    }
}
