//! Reference data engine kept in memory.
//!
//! Databases hold tables of keyed rows. Every client write gets the next
//! transaction id and is appended to the change log; replicas pull that log
//! through a `ReplicationFeed`, apply the rows inside their key range and
//! advance their position past everything else.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tabletmgr_topo::KeyspaceId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::feed::ReplicationFeed;
use super::{
    ChangeKind, DataEngine, LogBatch, LogEvent, Position, ReplicationSource, ReplicationStatus,
    Row, TableSchema,
};
use crate::error::EngineError;

const PULL_BATCH: usize = 512;
const PULL_INTERVAL: Duration = Duration::from_millis(10);

struct Table {
    schema: TableSchema,
    rows: BTreeMap<KeyspaceId, Vec<String>>,
}

#[derive(Default)]
struct EngineState {
    databases: BTreeMap<String, BTreeMap<String, Table>>,
    read_only: bool,
    log: Vec<LogEvent>,
    position: Position,
    source: Option<ReplicationSource>,
    running: bool,
    connected: bool,
    last_error: Option<String>,
    /// Bumped on every start/stop so stale pull loops exit.
    epoch: u64,
}

impl EngineState {
    fn table_mut(&mut self, db: &str, table: &str) -> Result<&mut Table, EngineError> {
        self.databases
            .get_mut(db)
            .ok_or_else(|| EngineError::UnknownDatabase { db: db.to_string() })?
            .get_mut(table)
            .ok_or_else(|| EngineError::UnknownTable {
                db: db.to_string(),
                table: table.to_string(),
            })
    }

    fn apply(&mut self, db: &str, table: &str, change: &ChangeKind) -> Result<(), EngineError> {
        let t = self.table_mut(db, table)?;
        match change {
            ChangeKind::Upsert(row) => {
                t.rows.insert(row.key.clone(), row.values.clone());
            }
            ChangeKind::Delete(key) => {
                t.rows.remove(key);
            }
        }
        Ok(())
    }

    fn status(&self) -> ReplicationStatus {
        ReplicationStatus {
            source_addr: self.source.as_ref().map(|s| s.addr.clone()),
            position: self.position,
            running: self.running,
            connected: self.running && self.connected,
            last_error: self.last_error.clone(),
            read_only: self.read_only,
        }
    }
}

/// In-memory `DataEngine`.
pub struct MemoryEngine {
    addr: String,
    state: Mutex<EngineState>,
    feed: Arc<dyn ReplicationFeed>,
    position_tx: watch::Sender<(Position, bool)>,
    puller: Mutex<Option<JoinHandle<()>>>,
    me: Weak<MemoryEngine>,
}

impl MemoryEngine {
    /// Creates an engine reachable at `addr` that replicates through `feed`.
    pub fn new(addr: impl Into<String>, feed: Arc<dyn ReplicationFeed>) -> Arc<Self> {
        let (position_tx, _) = watch::channel((0, false));
        Arc::new_cyclic(|me| Self {
            addr: addr.into(),
            state: Mutex::new(EngineState::default()),
            feed,
            position_tx,
            puller: Mutex::new(None),
            me: me.clone(),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        self.state
            .lock()
            .map_err(|e| EngineError::Invalid(format!("engine state poisoned: {}", e)))
    }

    fn publish(&self, state: &EngineState) {
        self.position_tx
            .send_replace((state.position, state.running && state.connected));
    }

    fn stop_puller(&self) {
        if let Ok(mut puller) = self.puller.lock() {
            if let Some(handle) = puller.take() {
                handle.abort();
            }
        }
    }

    fn spawn_puller(&self, epoch: u64) {
        let Some(engine) = self.me.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move { engine.pull_loop(epoch).await });
        if let Ok(mut puller) = self.puller.lock() {
            if let Some(old) = puller.replace(handle) {
                old.abort();
            }
        }
    }

    async fn pull_loop(self: Arc<Self>, epoch: u64) {
        loop {
            let (source, position) = match self.lock() {
                Ok(st) if st.running && st.epoch == epoch => match &st.source {
                    Some(src) => (src.clone(), st.position),
                    None => return,
                },
                _ => return,
            };

            let result = self
                .feed
                .pull(&source.addr, &source.source_db, position, PULL_BATCH)
                .await;

            let full_batch = {
                let Ok(mut st) = self.lock() else { return };
                if !st.running || st.epoch != epoch {
                    return;
                }
                match result {
                    Ok(batch) => {
                        let n = batch.events.len();
                        self.apply_batch(&mut st, &source, batch);
                        self.publish(&st);
                        n == PULL_BATCH
                    }
                    Err(e) => {
                        let msg = e.to_string();
                        if st.last_error.as_deref() != Some(msg.as_str()) {
                            warn!(engine = %self.addr, source = %source.addr, error = %msg, "replication pull failed");
                        }
                        st.connected = false;
                        st.last_error = Some(msg);
                        self.publish(&st);
                        false
                    }
                }
            };
            if !full_batch {
                tokio::time::sleep(PULL_INTERVAL).await;
            }
        }
    }

    fn apply_batch(&self, st: &mut EngineState, source: &ReplicationSource, batch: LogBatch) {
        st.connected = true;
        st.last_error = None;
        for event in batch.events {
            if event.gtid <= st.position {
                continue;
            }
            if source.key_range.contains(event.key()) {
                if let Err(e) = st.apply(&source.target_db, &event.table, &event.change) {
                    debug!(engine = %self.addr, gtid = event.gtid, error = %e, "skipping replicated change");
                } else {
                    st.log.push(LogEvent {
                        db: source.target_db.clone(),
                        ..event.clone()
                    });
                }
            }
            st.position = event.gtid;
        }
        if batch.head > st.position {
            st.position = batch.head;
        }
    }

    fn write(&self, db: &str, table: &str, changes: Vec<ChangeKind>) -> Result<Position, EngineError> {
        let mut st = self.lock()?;
        if st.read_only {
            return Err(EngineError::ReadOnly);
        }
        st.table_mut(db, table)?;
        for change in changes {
            st.apply(db, table, &change)?;
            let gtid = st.position + 1;
            st.position = gtid;
            st.log.push(LogEvent {
                gtid,
                db: db.to_string(),
                table: table.to_string(),
                change,
            });
        }
        self.publish(&st);
        Ok(st.position)
    }
}

impl Drop for MemoryEngine {
    fn drop(&mut self) {
        self.stop_puller();
    }
}

#[async_trait]
impl DataEngine for MemoryEngine {
    fn addr(&self) -> String {
        self.addr.clone()
    }

    async fn ping(&self) -> Result<(), EngineError> {
        self.lock().map(|_| ())
    }

    async fn create_database(&self, db: &str) -> Result<(), EngineError> {
        self.lock()?.databases.entry(db.to_string()).or_default();
        Ok(())
    }

    async fn database_exists(&self, db: &str) -> Result<bool, EngineError> {
        Ok(self.lock()?.databases.contains_key(db))
    }

    async fn create_table(&self, db: &str, schema: &TableSchema) -> Result<(), EngineError> {
        let mut st = self.lock()?;
        let tables = st
            .databases
            .get_mut(db)
            .ok_or_else(|| EngineError::UnknownDatabase { db: db.to_string() })?;
        match tables.get(&schema.name) {
            Some(existing) if existing.schema == *schema => Ok(()),
            Some(_) => Err(EngineError::Invalid(format!(
                "table {}.{} exists with a different definition",
                db, schema.name
            ))),
            None => {
                tables.insert(
                    schema.name.clone(),
                    Table {
                        schema: schema.clone(),
                        rows: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn tables(&self, db: &str) -> Result<Vec<TableSchema>, EngineError> {
        let st = self.lock()?;
        let tables = st
            .databases
            .get(db)
            .ok_or_else(|| EngineError::UnknownDatabase { db: db.to_string() })?;
        Ok(tables.values().map(|t| t.schema.clone()).collect())
    }

    async fn insert(&self, db: &str, table: &str, rows: Vec<Row>) -> Result<Position, EngineError> {
        self.write(db, table, rows.into_iter().map(ChangeKind::Upsert).collect())
    }

    async fn delete(&self, db: &str, table: &str, key: &KeyspaceId) -> Result<Position, EngineError> {
        self.write(db, table, vec![ChangeKind::Delete(key.clone())])
    }

    async fn read_rows(&self, db: &str, table: &str) -> Result<Vec<Row>, EngineError> {
        let mut st = self.lock()?;
        let t = st.table_mut(db, table)?;
        Ok(t
            .rows
            .iter()
            .map(|(key, values)| Row {
                key: key.clone(),
                values: values.clone(),
            })
            .collect())
    }

    async fn load_rows(&self, db: &str, table: &str, rows: Vec<Row>) -> Result<(), EngineError> {
        let mut st = self.lock()?;
        let t = st.table_mut(db, table)?;
        for row in rows {
            t.rows.insert(row.key, row.values);
        }
        Ok(())
    }

    async fn set_read_only(&self, read_only: bool) -> Result<(), EngineError> {
        self.lock()?.read_only = read_only;
        debug!(engine = %self.addr, read_only, "read-only flag changed");
        Ok(())
    }

    async fn is_read_only(&self) -> Result<bool, EngineError> {
        Ok(self.lock()?.read_only)
    }

    async fn position(&self) -> Result<Position, EngineError> {
        Ok(self.lock()?.position)
    }

    async fn start_replication(&self, source: ReplicationSource) -> Result<(), EngineError> {
        if source.addr == self.addr {
            return Err(EngineError::Invalid("engine cannot replicate from itself".to_string()));
        }
        let epoch = {
            let mut st = self.lock()?;
            st.epoch += 1;
            st.position = source.position;
            st.running = true;
            st.connected = false;
            st.last_error = None;
            info!(engine = %self.addr, source = %source.addr, position = source.position, "starting replication");
            st.source = Some(source);
            self.publish(&st);
            st.epoch
        };
        self.spawn_puller(epoch);
        Ok(())
    }

    async fn stop_replication(&self) -> Result<(), EngineError> {
        {
            let mut st = self.lock()?;
            st.epoch += 1;
            st.running = false;
            st.connected = false;
            self.publish(&st);
        }
        self.stop_puller();
        Ok(())
    }

    async fn resume_replication(&self) -> Result<(), EngineError> {
        let source = {
            let st = self.lock()?;
            match &st.source {
                Some(src) => ReplicationSource {
                    position: st.position,
                    ..src.clone()
                },
                None => return Err(EngineError::Invalid("no replication source configured".to_string())),
            }
        };
        self.start_replication(source).await
    }

    async fn promote(&self) -> Result<Position, EngineError> {
        self.stop_replication().await?;
        let mut st = self.lock()?;
        st.source = None;
        st.read_only = false;
        st.last_error = None;
        info!(engine = %self.addr, position = st.position, "promoted to master");
        Ok(st.position)
    }

    async fn replication_status(&self) -> Result<ReplicationStatus, EngineError> {
        Ok(self.lock()?.status())
    }

    async fn wait_for_position(&self, target: Position, timeout: Duration) -> Result<(), EngineError> {
        let mut rx = self.position_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let reached = rx.borrow_and_update().0 >= target;
                if reached {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match waited {
            Ok(true) => Ok(()),
            _ => Err(EngineError::PositionTimeout {
                target,
                current: self.position().await?,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    async fn wait_for_replication_start(&self, timeout: Duration) -> Result<(), EngineError> {
        let mut rx = self.position_tx.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let connected = rx.borrow_and_update().1;
                if connected {
                    return true;
                }
                if rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await;
        match waited {
            Ok(true) => Ok(()),
            _ => {
                let status = self.replication_status().await?;
                Err(EngineError::SourceUnreachable {
                    addr: status.source_addr.unwrap_or_default(),
                    msg: status
                        .last_error
                        .unwrap_or_else(|| "replication did not start in time".to_string()),
                })
            }
        }
    }

    async fn events_after(&self, db: &str, after: Position, limit: usize) -> Result<LogBatch, EngineError> {
        let st = self.lock()?;
        let start = st.log.partition_point(|e| e.gtid <= after);
        let mut events = Vec::new();
        let mut head = st.position;
        for event in &st.log[start..] {
            if event.db != db {
                continue;
            }
            events.push(event.clone());
            if events.len() == limit {
                head = event.gtid;
                break;
            }
        }
        Ok(LogBatch { events, head })
    }
}
