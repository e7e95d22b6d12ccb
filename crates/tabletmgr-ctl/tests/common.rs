//! Common test utilities: an in-process cluster of agents sharing one
//! coordination store, one engine directory and one snapshot root.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tabletmgr_agent::{
    Agent, AgentConfig, AgentContext, AgentHandle, DataEngine, EngineDirectory, LocalDialer, MemoryEngine, Row,
    TableSchema,
};
use tabletmgr_ctl::{InitTablet, Wrangler};
use tabletmgr_topo::{MemoryTopoServer, TabletAlias, TabletType, TopoStore};
use tempfile::TempDir;

pub const CELL: &str = "test_nj";
pub const KEYSPACE: &str = "test_keyspace";
pub const DB: &str = "vt_test_keyspace";
pub const TABLE: &str = "vt_insert_test";
pub const KEY_COLUMN: &str = "keyspace_id";

pub fn schema() -> TableSchema {
    TableSchema::new(TABLE, KEY_COLUMN, &["msg"])
}

pub fn rows(ids: impl IntoIterator<Item = u64>) -> Vec<Row> {
    ids.into_iter()
        .map(|id| Row::new(id, vec![format!("test {}", id)]))
        .collect()
}

/// One tablet of the test cluster.
pub struct TestTablet {
    pub alias: TabletAlias,
    pub engine: Arc<dyn DataEngine>,
    pub agent: Option<AgentHandle>,
}

/// In-process cluster driven through a `Wrangler`.
pub struct TestCluster {
    pub server: MemoryTopoServer,
    pub wr: Wrangler,
    pub dialer: Arc<LocalDialer>,
    pub directory: Arc<EngineDirectory>,
    pub dir: TempDir,
    pub tablets: HashMap<u32, TestTablet>,
}

impl TestCluster {
    pub async fn new() -> Self {
        let server = MemoryTopoServer::new();
        let dialer = LocalDialer::new(None);
        let wr = Wrangler::new(Arc::new(server.connect()), dialer.clone())
            .with_action_timeout(Duration::from_secs(10))
            .with_lock_timeout(Duration::from_secs(2))
            .with_rpc_timeout(Duration::from_millis(500));
        wr.create_keyspace(KEYSPACE, Some(KEY_COLUMN.to_string()), false)
            .await
            .unwrap();
        Self {
            server,
            wr,
            dialer,
            directory: EngineDirectory::new(),
            dir: tempfile::tempdir().unwrap(),
            tablets: HashMap::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn TopoStore> {
        Arc::new(self.server.connect())
    }

    pub fn alias(uid: u32) -> TabletAlias {
        TabletAlias::new(CELL, uid)
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            snapshot_root: self.dir.path().join("snapshot"),
            hook_dir: self.dir.path().join("hooks"),
            heartbeat_interval_ms: 20,
            pid_wait_ms: 500,
            rpc_timeout_ms: 500,
            fetch_backoff_ms: 5,
            ..Default::default()
        }
    }

    /// Creates the tablet record and its engine. Assigned tablets get the
    /// test schema.
    pub async fn add_tablet(&mut self, uid: u32, shard: Option<&str>, tablet_type: TabletType) -> TabletAlias {
        let alias = Self::alias(uid);
        let port = 10_000 + (uid % 1_000) as u16 * 2;
        let mut req = InitTablet::idle(alias.clone(), "localhost", port, port + 1);
        if let Some(shard) = shard {
            req = req.assigned(KEYSPACE, shard, tablet_type);
        }
        let tablet = self.wr.init_tablet(req).await.unwrap();

        let engine: Arc<dyn DataEngine> = MemoryEngine::new(tablet.engine_addr(), self.directory.clone());
        self.directory.register(&engine);
        if tablet.is_assigned() {
            engine.create_database(&tablet.db_name).await.unwrap();
            engine.create_table(&tablet.db_name, &schema()).await.unwrap();
        }
        self.tablets.insert(
            uid,
            TestTablet {
                alias: alias.clone(),
                engine,
                agent: None,
            },
        );
        alias
    }

    pub async fn start_agent(&mut self, uid: u32) {
        let config = self.agent_config();
        self.start_agent_with(uid, config).await;
    }

    pub async fn start_agent_with(&mut self, uid: u32, config: AgentConfig) {
        let store = self.store();
        let dialer = self.dialer.clone();
        let t = self.tablets.get_mut(&uid).unwrap();
        let ctx = AgentContext::new(t.alias.clone(), store, t.engine.clone(), config, dialer.clone());
        let handle = Agent::start(ctx).await.unwrap();
        dialer.register(handle.rpc());
        t.agent = Some(handle);
    }

    /// Stops an agent without publishing anything, as a crash would.
    pub async fn kill_agent(&mut self, uid: u32) {
        let t = self.tablets.get_mut(&uid).unwrap();
        self.dialer.unregister(&t.alias);
        if let Some(agent) = t.agent.take() {
            agent.kill().await;
        }
    }

    /// Stops an agent the way a termination signal does.
    pub async fn interrupt_agent(&mut self, uid: u32) {
        let t = self.tablets.get_mut(&uid).unwrap();
        self.dialer.unregister(&t.alias);
        if let Some(agent) = t.agent.take() {
            agent.interrupt().await.unwrap();
        }
    }

    pub fn engine(&self, uid: u32) -> Arc<dyn DataEngine> {
        self.tablets[&uid].engine.clone()
    }

    /// Builds shard `shard` with `master` elected by a forced reparent and
    /// every other tablet, lag tablets included, replicating from it. All
    /// agents are running.
    pub async fn init_shard(&mut self, shard: &str, master: u32, others: &[(u32, TabletType)]) {
        self.add_tablet(master, Some(shard), TabletType::Spare).await;
        for (uid, ty) in others {
            self.add_tablet(*uid, Some(shard), *ty).await;
        }
        self.start_agent(master).await;
        for (uid, _) in others {
            self.start_agent(*uid).await;
        }
        let report = self
            .wr
            .reparent_shard(KEYSPACE, shard, &Self::alias(master), true)
            .await
            .unwrap();
        assert_eq!(report.master, Some(Self::alias(master)));
        for lagging in &report.needs_reparent_tablet {
            self.wr.reparent_tablet(lagging).await.unwrap();
        }
    }

    /// Inserts rows on `uid`'s engine and returns the new position.
    pub async fn insert(&self, uid: u32, ids: impl IntoIterator<Item = u64>) -> u64 {
        self.engine(uid).insert(DB, TABLE, rows(ids)).await.unwrap()
    }

    pub async fn row_count(&self, uid: u32, db: &str) -> usize {
        self.engine(uid).read_rows(db, TABLE).await.unwrap().len()
    }

    /// Waits for `uid` to apply everything up to `position`.
    pub async fn catch_up(&self, uid: u32, position: u64) {
        self.engine(uid)
            .wait_for_position(position, Duration::from_secs(5))
            .await
            .unwrap();
    }
}
