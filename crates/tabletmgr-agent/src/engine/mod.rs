//! Data engine seam.
//!
//! The agent drives its local relational engine through `DataEngine`: the
//! read-only toggle, liveness, replication control and the bulk row access the
//! snapshot pipeline needs. Replication positions are GTID-style sequence
//! numbers shared by every engine in a replication stream, so a replica can be
//! repointed at any other member and resume from its own position.

pub mod feed;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabletmgr_topo::{KeyRange, KeyspaceId};

use crate::error::EngineError;

pub use feed::{serve_engine_feed, EngineDirectory, ReplicationFeed, TcpFeed};
pub use memory::MemoryEngine;

/// Replication position: id of the last transaction applied or skipped.
pub type Position = u64;

/// One row. The key is the sharding key; values are the other columns.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Sharding key.
    pub key: KeyspaceId,
    /// Remaining column values, in schema order.
    pub values: Vec<String>,
}

impl Row {
    /// Row keyed by a 64-bit integer.
    pub fn new(id: u64, values: Vec<String>) -> Self {
        Self {
            key: KeyspaceId::from_u64(id),
            values,
        }
    }
}

/// Table definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Name of the key column.
    pub key_column: String,
    /// Names of the value columns.
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Creates a schema.
    pub fn new(name: impl Into<String>, key_column: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            name: name.into(),
            key_column: key_column.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Where a replica pulls changes from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationSource {
    /// Engine address of the source.
    pub addr: String,
    /// Database name on the source.
    pub source_db: String,
    /// Local database the changes go to.
    pub target_db: String,
    /// Position to resume after.
    pub position: Position,
    /// Only rows inside this range are applied.
    pub key_range: KeyRange,
}

/// Replication state reported by an engine.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Current source, if configured.
    pub source_addr: Option<String>,
    /// Current position.
    pub position: Position,
    /// Replication is configured and not stopped.
    pub running: bool,
    /// The source answered at least once since the last start.
    pub connected: bool,
    /// Last error talking to the source.
    pub last_error: Option<String>,
    /// Read-only flag.
    pub read_only: bool,
}

/// A change in the replication log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Insert or replace a row.
    Upsert(Row),
    /// Remove a row by key.
    Delete(KeyspaceId),
}

/// One logged change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Transaction id, monotonically increasing along the stream.
    pub gtid: Position,
    /// Database.
    pub db: String,
    /// Table.
    pub table: String,
    /// Change.
    pub change: ChangeKind,
}

impl LogEvent {
    /// Sharding key affected by the change.
    pub fn key(&self) -> &KeyspaceId {
        match &self.change {
            ChangeKind::Upsert(row) => &row.key,
            ChangeKind::Delete(key) => key,
        }
    }
}

/// Changes pulled from a source in one round trip.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogBatch {
    /// Events for the requested database, in gtid order.
    pub events: Vec<LogEvent>,
    /// Position a replica reaches once it has applied `events`. Covers
    /// transactions on other databases that were skipped.
    pub head: Position,
}

/// Control surface of a tablet's local data engine.
#[async_trait]
pub trait DataEngine: Send + Sync {
    /// Engine address (`host:port`).
    fn addr(&self) -> String;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), EngineError>;

    /// Creates a database; no-op if it exists.
    async fn create_database(&self, db: &str) -> Result<(), EngineError>;

    /// True when the database exists.
    async fn database_exists(&self, db: &str) -> Result<bool, EngineError>;

    /// Creates a table; no-op if an identical one exists.
    async fn create_table(&self, db: &str, schema: &TableSchema) -> Result<(), EngineError>;

    /// Table definitions of a database, ordered by name.
    async fn tables(&self, db: &str) -> Result<Vec<TableSchema>, EngineError>;

    /// Client write: upserts rows and logs them. Fails when read-only.
    async fn insert(&self, db: &str, table: &str, rows: Vec<Row>) -> Result<Position, EngineError>;

    /// Client delete by key. Fails when read-only.
    async fn delete(&self, db: &str, table: &str, key: &KeyspaceId) -> Result<Position, EngineError>;

    /// All rows of a table ordered by key.
    async fn read_rows(&self, db: &str, table: &str) -> Result<Vec<Row>, EngineError>;

    /// Bulk load used by restore; bypasses read-only and does not log.
    async fn load_rows(&self, db: &str, table: &str, rows: Vec<Row>) -> Result<(), EngineError>;

    /// Sets the read-only flag.
    async fn set_read_only(&self, read_only: bool) -> Result<(), EngineError>;

    /// Reads the read-only flag.
    async fn is_read_only(&self) -> Result<bool, EngineError>;

    /// Current replication position.
    async fn position(&self) -> Result<Position, EngineError>;

    /// Starts replicating from `source`, replacing any previous source.
    async fn start_replication(&self, source: ReplicationSource) -> Result<(), EngineError>;

    /// Stops replication, keeping the configured source.
    async fn stop_replication(&self) -> Result<(), EngineError>;

    /// Restarts replication from the configured source at the current position.
    async fn resume_replication(&self) -> Result<(), EngineError>;

    /// Stops replication, forgets the source and goes read-write. Returns the
    /// position the new master starts from.
    async fn promote(&self) -> Result<Position, EngineError>;

    /// Replication state.
    async fn replication_status(&self) -> Result<ReplicationStatus, EngineError>;

    /// Waits until the position reaches `target`.
    async fn wait_for_position(&self, target: Position, timeout: Duration) -> Result<(), EngineError>;

    /// Waits until replication is running and connected to its source.
    async fn wait_for_replication_start(&self, timeout: Duration) -> Result<(), EngineError>;

    /// Logged changes after `after` for `db`, up to `limit` events.
    async fn events_after(&self, db: &str, after: Position, limit: usize) -> Result<LogBatch, EngineError>;
}
