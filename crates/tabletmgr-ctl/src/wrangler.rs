//! Operator commands over the coordination store and the tablet agents.
//!
//! Tablet-level commands go through the tablet's action queue. Shard-level
//! operations (reparent, graph rebuilds) hold the shard lock for their whole
//! duration. The validator, reparent and clone modules add their commands as
//! further `impl Wrangler` blocks.

use std::sync::Arc;
use std::time::Duration;

use tabletmgr_agent::queue::{self, ActionHandle};
use tabletmgr_agent::{
    ActionArgs, ActionReply, FetchOptions, HookResult, MultiSnapshotReply, Position, RestoreReply, SnapshotReply,
    TabletDialer,
};
use tabletmgr_topo::{
    lock_keyspace, lock_shard, paths, rebuild_keyspace_graph, rebuild_shard_graph, ActionLock, KeyRange,
    Keyspace, KeyspaceId, RebuildReport, Tablet, TabletAlias, TabletState, TabletType, Topo, TopoError,
    TopoStore,
};
use tracing::{info, warn};

use crate::error::WranglerError;

/// Default bound on a single action wait.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(300);
/// Default bound on a lock wait.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default bound on a direct agent RPC.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters of `init_tablet`.
#[derive(Clone, Debug)]
pub struct InitTablet {
    /// New tablet.
    pub alias: TabletAlias,
    /// Host name.
    pub hostname: String,
    /// Agent RPC port.
    pub port: u16,
    /// Data engine port.
    pub engine_port: u16,
    /// Keyspace; empty for idle.
    pub keyspace: String,
    /// Shard; empty for idle.
    pub shard: String,
    /// Initial type.
    pub tablet_type: TabletType,
    /// Database name; `vt_<keyspace>` when absent.
    pub db_name: Option<String>,
    /// Master this tablet replicates from.
    pub parent: Option<TabletAlias>,
    /// Replace an existing record and allow a second master.
    pub force: bool,
}

impl InitTablet {
    /// An idle tablet on `hostname`.
    pub fn idle(alias: TabletAlias, hostname: impl Into<String>, port: u16, engine_port: u16) -> Self {
        Self {
            alias,
            hostname: hostname.into(),
            port,
            engine_port,
            keyspace: String::new(),
            shard: String::new(),
            tablet_type: TabletType::Idle,
            db_name: None,
            parent: None,
            force: false,
        }
    }

    /// Assigns the tablet to a shard with a type.
    pub fn assigned(mut self, keyspace: &str, shard: &str, tablet_type: TabletType) -> Self {
        self.keyspace = keyspace.to_string();
        self.shard = shard.to_string();
        self.tablet_type = tablet_type;
        self
    }
}

/// Controller handle: typed store access plus a dialer for direct RPCs.
pub struct Wrangler {
    topo: Topo,
    dialer: Arc<dyn TabletDialer>,
    action_timeout: Duration,
    lock_timeout: Duration,
    rpc_timeout: Duration,
}

impl Wrangler {
    /// Creates a controller with default bounds.
    pub fn new(store: Arc<dyn TopoStore>, dialer: Arc<dyn TabletDialer>) -> Self {
        Self {
            topo: Topo::new(store),
            dialer,
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Sets the action wait bound.
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Sets the lock wait bound.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the direct RPC bound.
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Typed store access.
    pub fn topo(&self) -> &Topo {
        &self.topo
    }

    /// Raw store.
    pub fn store(&self) -> &Arc<dyn TopoStore> {
        self.topo.store()
    }

    /// Dialer for direct agent RPCs.
    pub fn dialer(&self) -> &dyn TabletDialer {
        self.dialer.as_ref()
    }

    /// Action wait bound.
    pub fn action_timeout(&self) -> Duration {
        self.action_timeout
    }

    /// Direct RPC bound.
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    // Action plumbing

    /// Queues an action for an existing tablet and returns without waiting.
    pub async fn enqueue(&self, alias: &TabletAlias, args: ActionArgs) -> Result<ActionHandle, WranglerError> {
        self.topo.get_tablet(alias).await?;
        Ok(queue::enqueue(self.store(), alias, args).await?)
    }

    /// Waits for a queued action.
    pub async fn wait_for_action(&self, handle: &ActionHandle, timeout: Duration) -> Result<ActionReply, WranglerError> {
        Ok(queue::wait_for_action(self.store(), handle, timeout).await?)
    }

    /// Queues an action and waits up to the action bound.
    pub async fn run(&self, alias: &TabletAlias, args: ActionArgs) -> Result<ActionReply, WranglerError> {
        self.run_with_timeout(alias, args, self.action_timeout).await
    }

    /// Queues an action and waits up to `timeout`.
    pub async fn run_with_timeout(
        &self,
        alias: &TabletAlias,
        args: ActionArgs,
        timeout: Duration,
    ) -> Result<ActionReply, WranglerError> {
        let handle = self.enqueue(alias, args).await?;
        self.wait_for_action(&handle, timeout).await
    }

    /// Takes the shard lock, mapping a lock timeout to "shard busy".
    pub async fn lock_shard(&self, keyspace: &str, shard: &str, action: &str) -> Result<ActionLock, WranglerError> {
        lock_shard(self.store().clone(), keyspace, shard, action, self.lock_timeout)
            .await
            .map_err(|e| match e {
                TopoError::DeadlineExceeded { what } => {
                    WranglerError::Timeout(format!("shard {}/{} busy: {}", keyspace, shard, what))
                }
                other => other.into(),
            })
    }

    // Keyspace and tablet records

    /// Creates a keyspace record.
    pub async fn create_keyspace(
        &self,
        name: &str,
        sharding_column: Option<String>,
        force: bool,
    ) -> Result<(), WranglerError> {
        let ks = Keyspace { sharding_column };
        match self.topo.create_keyspace(name, &ks).await {
            Ok(()) => {}
            Err(TopoError::NodeExists { .. }) if force => self.topo.put_keyspace(name, &ks).await?,
            Err(e) => return Err(e.into()),
        }
        info!(keyspace = name, "created keyspace");
        Ok(())
    }

    /// Creates a tablet record. Assigned tablets get their shard created if
    /// missing and the shard graph rebuilt.
    pub async fn init_tablet(&self, req: InitTablet) -> Result<Tablet, WranglerError> {
        let mut tablet = Tablet::idle(req.alias.clone(), req.hostname, req.port, req.engine_port);
        tablet.parent = req.parent;

        if req.tablet_type.is_assigned() {
            if req.keyspace.is_empty() || req.shard.is_empty() {
                return Err(WranglerError::InvalidArgument(format!(
                    "tablet type {} needs a keyspace and shard",
                    req.tablet_type
                )));
            }
            self.topo.get_keyspace(&req.keyspace).await.map_err(|e| match e {
                TopoError::NotFound { .. } => {
                    WranglerError::InvalidArgument(format!("keyspace {} does not exist", req.keyspace))
                }
                other => other.into(),
            })?;
            let shard = match self.topo.get_shard(&req.keyspace, &req.shard).await {
                Ok(s) => s,
                Err(e) if e.is_not_found() => self.topo.create_shard(&req.keyspace, &req.shard).await?,
                Err(e) => return Err(e.into()),
            };
            if req.tablet_type == TabletType::Master && !req.force {
                if let Some(master) = shard.master.as_ref().filter(|m| **m != req.alias) {
                    return Err(WranglerError::InvalidArgument(format!(
                        "shard {}/{} already has master {}",
                        req.keyspace, req.shard, master
                    )));
                }
            }
            if tablet.parent.is_none() && req.tablet_type != TabletType::Master {
                tablet.parent = shard.master.clone();
            }
            tablet.keyspace = req.keyspace.clone();
            tablet.shard = req.shard.clone();
            tablet.key_range = shard.key_range.clone();
            tablet.db_name = req.db_name.unwrap_or_else(|| format!("vt_{}", req.keyspace));
        } else if let Some(db) = req.db_name {
            tablet.db_name = db;
        }
        tablet.tablet_type = req.tablet_type;

        match self.topo.create_tablet(&tablet).await {
            Ok(()) => {}
            Err(TopoError::NodeExists { .. }) if req.force => self.topo.put_tablet(&tablet).await?,
            Err(TopoError::NodeExists { .. }) => {
                return Err(WranglerError::InvalidArgument(format!(
                    "tablet {} already exists; use force to replace it",
                    tablet.alias
                )))
            }
            Err(e) => return Err(e.into()),
        }
        if tablet.is_assigned() {
            self.rebuild_shard_graph(&tablet.keyspace, &tablet.shard).await?;
        }
        info!(tablet = %tablet.alias, tablet_type = %tablet.tablet_type, keyspace = %tablet.keyspace, shard = %tablet.shard, "initialized tablet");
        Ok(tablet)
    }

    /// Scraps a tablet. With `force` the record is changed directly, which
    /// works without a live agent and is required for a master.
    pub async fn scrap_tablet(&self, alias: &TabletAlias, force: bool, skip_rebuild: bool) -> Result<(), WranglerError> {
        let tablet = self.topo.get_tablet(alias).await?;
        if !force {
            if tablet.tablet_type == TabletType::Master {
                return Err(WranglerError::InvalidArgument(format!(
                    "tablet {} is a master; use force to scrap it",
                    alias
                )));
            }
            self.run(alias, ActionArgs::Scrap { skip_rebuild }).await?;
            return Ok(());
        }
        let updated = self
            .topo
            .update_tablet(alias, |t| {
                t.tablet_type = TabletType::Scrap;
                t.parent = None;
                Ok(())
            })
            .await?;
        warn!(tablet = %alias, was = %tablet.tablet_type, "scrapped tablet record");
        if !skip_rebuild && !updated.keyspace.is_empty() && !updated.shard.is_empty() {
            self.rebuild_shard_graph(&updated.keyspace, &updated.shard).await?;
        }
        Ok(())
    }

    /// Changes a non-master tablet's type. Masters change only by reparent.
    pub async fn change_slave_type(
        &self,
        alias: &TabletAlias,
        tablet_type: TabletType,
        force: bool,
    ) -> Result<(), WranglerError> {
        let tablet = self.topo.get_tablet(alias).await?;
        if tablet_type == TabletType::Master || tablet.tablet_type == TabletType::Master {
            return Err(WranglerError::InvalidArgument(format!(
                "cannot change {} from {} to {}; use ReparentShard",
                alias, tablet.tablet_type, tablet_type
            )));
        }
        if !force {
            if tablet.tablet_type == TabletType::Scrap || tablet.tablet_type == TabletType::Idle {
                return Err(WranglerError::InvalidArgument(format!(
                    "tablet {} is {}; use force to change it",
                    alias, tablet.tablet_type
                )));
            }
            self.run(alias, ActionArgs::ChangeType { tablet_type }).await?;
            return Ok(());
        }
        let updated = self
            .topo
            .update_tablet(alias, |t| {
                t.tablet_type = tablet_type;
                Ok(())
            })
            .await?;
        if updated.is_assigned() || tablet.is_assigned() {
            self.rebuild_shard_graph(&updated.keyspace, &updated.shard).await?;
        }
        Ok(())
    }

    // Thin action wrappers

    /// Round trip through the tablet's queue.
    pub async fn ping(&self, alias: &TabletAlias) -> Result<(), WranglerError> {
        self.run(alias, ActionArgs::Ping).await?;
        Ok(())
    }

    /// Makes the tablet's engine read-only.
    pub async fn set_read_only(&self, alias: &TabletAlias) -> Result<(), WranglerError> {
        self.run(alias, ActionArgs::SetReadOnly).await?;
        Ok(())
    }

    /// Makes the tablet's engine read-write.
    pub async fn set_read_write(&self, alias: &TabletAlias) -> Result<(), WranglerError> {
        self.run(alias, ActionArgs::SetReadWrite).await?;
        Ok(())
    }

    /// Makes a master read-only and returns its position.
    pub async fn demote_master(&self, alias: &TabletAlias) -> Result<Position, WranglerError> {
        match self.run(alias, ActionArgs::DemoteMaster).await? {
            ActionReply::Position(p) => Ok(p),
            other => Err(unexpected("DemoteMaster", other)),
        }
    }

    /// Runs a hook on the tablet's host.
    pub async fn execute_hook(
        &self,
        alias: &TabletAlias,
        name: &str,
        params: Vec<String>,
    ) -> Result<HookResult, WranglerError> {
        let args = ActionArgs::ExecuteHook {
            name: name.to_string(),
            params,
        };
        match self.run(alias, args).await? {
            ActionReply::Hook(result) => Ok(result),
            other => Err(unexpected("ExecuteHook", other)),
        }
    }

    /// Holds the tablet's queue for `duration`.
    pub async fn sleep(&self, alias: &TabletAlias, duration: Duration) -> Result<(), WranglerError> {
        let args = ActionArgs::Sleep {
            duration_ms: duration.as_millis() as u64,
        };
        self.run(alias, args).await?;
        Ok(())
    }

    // Serving graph

    /// `host:port` addresses serving (keyspace, shard, type) in `cell`, using
    /// the named port.
    pub async fn resolve(
        &self,
        cell: &str,
        keyspace: &str,
        shard: &str,
        tablet_type: TabletType,
        port_name: &str,
    ) -> Result<Vec<String>, WranglerError> {
        let endpoints = self.topo.get_endpoints(cell, keyspace, shard, tablet_type).await?;
        endpoints
            .entries
            .iter()
            .map(|e| match e.named_ports.get(port_name) {
                Some(port) => Ok(format!("{}:{}", e.host, port)),
                None => Err(WranglerError::InvalidArgument(format!(
                    "endpoint {} has no port named {}",
                    e.uid, port_name
                ))),
            })
            .collect()
    }

    /// Idle tablets of a cell.
    pub async fn list_idle(&self, cell: &str) -> Result<Vec<Tablet>, WranglerError> {
        let mut idle = Vec::new();
        for alias in self.topo.tablet_aliases(cell).await? {
            let tablet = self.topo.get_tablet(&alias).await?;
            if tablet.tablet_type == TabletType::Idle {
                idle.push(tablet);
            }
        }
        Ok(idle)
    }

    /// Empties an action queue or lock directory. Waiters on purged actions
    /// get a failed result.
    pub async fn purge_actions(&self, dir: &str) -> Result<usize, WranglerError> {
        Ok(queue::purge_actions(self.store(), dir).await?)
    }

    /// Empties a tablet's action queue.
    pub async fn purge_tablet_actions(&self, alias: &TabletAlias) -> Result<usize, WranglerError> {
        self.purge_actions(&paths::tablet_action_dir(alias)).await
    }

    /// Rebuilds one shard's graph under the shard lock.
    pub async fn rebuild_shard_graph(&self, keyspace: &str, shard: &str) -> Result<RebuildReport, WranglerError> {
        let lock = self.lock_shard(keyspace, shard, "RebuildShardGraph").await?;
        let result = rebuild_shard_graph(&self.topo, keyspace, shard).await;
        lock.release().await?;
        Ok(result?)
    }

    /// Rebuilds one shard's graph; the caller holds the shard lock.
    pub(crate) async fn rebuild_shard_graph_locked(
        &self,
        keyspace: &str,
        shard: &str,
    ) -> Result<RebuildReport, WranglerError> {
        Ok(rebuild_shard_graph(&self.topo, keyspace, shard).await?)
    }

    /// Rebuilds a keyspace's graph under the keyspace lock.
    pub async fn rebuild_keyspace_graph(&self, keyspace: &str) -> Result<usize, WranglerError> {
        let lock = lock_keyspace(self.store().clone(), keyspace, "RebuildKeyspaceGraph", self.lock_timeout).await?;
        let result = rebuild_keyspace_graph(&self.topo, keyspace).await;
        lock.release().await?;
        Ok(result?)
    }

    // Snapshot and restore

    /// Exports the tablet's database.
    pub async fn snapshot(
        &self,
        alias: &TabletAlias,
        concurrency: usize,
        server_mode: bool,
        force: bool,
    ) -> Result<SnapshotReply, WranglerError> {
        let args = ActionArgs::Snapshot {
            concurrency,
            server_mode,
            force,
        };
        match self.run(alias, args).await? {
            ActionReply::Snapshot(reply) => Ok(reply),
            other => Err(unexpected("Snapshot", other)),
        }
    }

    /// Returns a server-mode snapshot source to duty.
    pub async fn snapshot_source_end(&self, alias: &TabletAlias, reply: &SnapshotReply) -> Result<(), WranglerError> {
        let args = ActionArgs::SnapshotSourceEnd {
            original_type: reply.original_type,
            slave_start_required: reply.slave_start_required,
            read_only: reply.read_only,
        };
        self.run(alias, args).await?;
        Ok(())
    }

    /// Exports one key range.
    pub async fn partial_snapshot(
        &self,
        alias: &TabletAlias,
        key_range: &KeyRange,
        key_column: Option<&str>,
        concurrency: usize,
    ) -> Result<SnapshotReply, WranglerError> {
        let key_column = self.key_column(alias, key_column).await?;
        let args = ActionArgs::PartialSnapshot {
            key_range: key_range.clone(),
            key_column,
            concurrency,
        };
        match self.run(alias, args).await? {
            ActionReply::Snapshot(reply) => Ok(reply),
            other => Err(unexpected("PartialSnapshot", other)),
        }
    }

    /// Exports one unit per range of a split spec such as `-80-`.
    pub async fn multi_snapshot(
        &self,
        alias: &TabletAlias,
        spec: &str,
        tables: Vec<String>,
        key_column: Option<&str>,
        concurrency: usize,
        force: bool,
    ) -> Result<MultiSnapshotReply, WranglerError> {
        let ranges = KeyRange::parse_split_spec(spec).map_err(|e| WranglerError::InvalidArgument(e.to_string()))?;
        let key_column = self.key_column(alias, key_column).await?;
        let args = ActionArgs::MultiSnapshot {
            ranges,
            tables,
            key_column,
            concurrency,
            force,
        };
        match self.run(alias, args).await? {
            ActionReply::MultiSnapshot(reply) => Ok(reply),
            other => Err(unexpected("MultiSnapshot", other)),
        }
    }

    /// Restores `source`'s snapshot into idle tablet `dst`, which joins the
    /// source's shard as a replica. A failure scraps `dst`.
    pub async fn restore(
        &self,
        source: &TabletAlias,
        manifest_path: Option<&str>,
        dst: &TabletAlias,
        fetch: FetchOptions,
        dont_wait_for_slave_start: bool,
    ) -> Result<RestoreReply, WranglerError> {
        let source_tablet = self.topo.get_tablet(source).await?;
        self.check_idle(dst).await?;
        let result = async {
            self.prepare_destination(dst, &source_tablet, None).await?;
            let args = ActionArgs::Restore {
                source: source.clone(),
                manifest_path: manifest_path.map(str::to_string),
                fetch,
                dont_wait_for_slave_start,
                tablet_type: TabletType::Replica,
            };
            match self.run(dst, args).await? {
                ActionReply::Restore(reply) => Ok(reply),
                other => Err(unexpected("Restore", other)),
            }
        }
        .await;
        self.scrap_on_failure(dst, result).await
    }

    /// Merges the multi-snapshots of `sources` into `dst`, keeping rows below
    /// `end` (all rows when `end` is empty). A failed merge scraps `dst`.
    pub async fn multi_restore(
        &self,
        dst: &TabletAlias,
        sources: Vec<TabletAlias>,
        end: KeyspaceId,
        fetch: FetchOptions,
    ) -> Result<RestoreReply, WranglerError> {
        let args = ActionArgs::MultiRestore {
            sources,
            key_range: KeyRange {
                start: KeyspaceId::default(),
                end,
            },
            fetch,
        };
        let result = match self.run(dst, args).await {
            Ok(ActionReply::Restore(reply)) => Ok(reply),
            Ok(other) => Err(unexpected("MultiRestore", other)),
            Err(e) => Err(e),
        };
        self.scrap_on_failure(dst, result).await
    }

    /// Fails unless `alias` is idle.
    pub(crate) async fn check_idle(&self, alias: &TabletAlias) -> Result<Tablet, WranglerError> {
        let tablet = self.topo.get_tablet(alias).await?;
        if tablet.tablet_type != TabletType::Idle {
            return Err(WranglerError::InvalidArgument(format!(
                "destination {} must be idle, not {}",
                alias, tablet.tablet_type
            )));
        }
        Ok(tablet)
    }

    /// Binds an idle destination to the source's shard, marked restoring.
    pub(crate) async fn prepare_destination(
        &self,
        dst: &TabletAlias,
        source: &Tablet,
        key_range: Option<&KeyRange>,
    ) -> Result<(), WranglerError> {
        let keyspace = source.keyspace.clone();
        let shard = source.shard.clone();
        let range = key_range.cloned().unwrap_or_else(|| source.key_range.clone());
        self.topo
            .update_tablet(dst, |t| {
                t.keyspace = keyspace.clone();
                t.shard = shard.clone();
                t.db_name = format!("vt_{}", keyspace);
                t.key_range = range.clone();
                t.state = TabletState::Restoring;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Scraps `dst` when `result` is an error, keeping the original error.
    pub(crate) async fn scrap_on_failure<T>(
        &self,
        dst: &TabletAlias,
        result: Result<T, WranglerError>,
    ) -> Result<T, WranglerError> {
        let e = match result {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        warn!(tablet = %dst, error = %e, "transfer failed, scrapping destination");
        if let Err(scrap_err) = self.scrap_tablet(dst, true, false).await {
            warn!(tablet = %dst, error = %scrap_err, "could not scrap destination");
        }
        Err(e)
    }

    async fn key_column(&self, alias: &TabletAlias, given: Option<&str>) -> Result<String, WranglerError> {
        if let Some(c) = given {
            return Ok(c.to_string());
        }
        let tablet = self.topo.get_tablet(alias).await?;
        self.topo
            .get_keyspace(&tablet.keyspace)
            .await?
            .sharding_column
            .ok_or_else(|| {
                WranglerError::InvalidArgument(format!(
                    "keyspace {} has no sharding column; pass one explicitly",
                    tablet.keyspace
                ))
            })
    }
}

pub(crate) fn unexpected(action: &str, reply: ActionReply) -> WranglerError {
    WranglerError::Remote {
        action: action.to_string(),
        message: format!("unexpected reply: {:?}", reply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletmgr_agent::LocalDialer;
    use tabletmgr_topo::MemoryTopoServer;

    fn wrangler() -> Wrangler {
        let server = MemoryTopoServer::new();
        Wrangler::new(Arc::new(server.connect()), LocalDialer::new(None))
            .with_lock_timeout(Duration::from_millis(200))
            .with_action_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_init_tablet_assigns_shard_and_db() {
        let wr = wrangler();
        wr.create_keyspace("test_keyspace", None, false).await.unwrap();
        let req = InitTablet::idle(TabletAlias::new("test", 1), "localhost", 7001, 8001).assigned(
            "test_keyspace",
            "0",
            TabletType::Master,
        );
        let tablet = wr.init_tablet(req).await.unwrap();
        assert_eq!(tablet.db_name, "vt_test_keyspace");
        let shard = wr.topo().get_shard("test_keyspace", "0").await.unwrap();
        assert_eq!(shard.master, Some(tablet.alias.clone()));
        assert_eq!(
            wr.resolve("test", "test_keyspace", "0", TabletType::Master, "engine")
                .await
                .unwrap(),
            vec!["localhost:8001".to_string()]
        );

        let second = InitTablet::idle(TabletAlias::new("test", 2), "localhost", 7002, 8002).assigned(
            "test_keyspace",
            "0",
            TabletType::Master,
        );
        assert!(matches!(
            wr.init_tablet(second).await.unwrap_err(),
            WranglerError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_init_tablet_requires_keyspace() {
        let wr = wrangler();
        let req = InitTablet::idle(TabletAlias::new("test", 1), "localhost", 7001, 8001).assigned(
            "missing",
            "0",
            TabletType::Replica,
        );
        let err = wr.init_tablet(req).await.unwrap_err();
        assert!(err.to_string().contains("keyspace missing does not exist"));
    }

    #[tokio::test]
    async fn test_list_idle_and_force_scrap() {
        let wr = wrangler();
        wr.create_keyspace("ks", None, false).await.unwrap();
        wr.init_tablet(InitTablet::idle(TabletAlias::new("test", 1), "h", 1, 2))
            .await
            .unwrap();
        let master = InitTablet::idle(TabletAlias::new("test", 2), "h", 3, 4).assigned("ks", "0", TabletType::Master);
        wr.init_tablet(master).await.unwrap();
        let idle = wr.list_idle("test").await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].alias.uid, 1);

        let alias = TabletAlias::new("test", 2);
        assert!(matches!(
            wr.scrap_tablet(&alias, false, false).await.unwrap_err(),
            WranglerError::InvalidArgument(_)
        ));
        wr.scrap_tablet(&alias, true, false).await.unwrap();
        assert_eq!(wr.topo().get_tablet(&alias).await.unwrap().tablet_type, TabletType::Scrap);
        assert!(wr
            .resolve("test", "ks", "0", TabletType::Master, "engine")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_action_without_agent_times_out() {
        let wr = wrangler();
        wr.init_tablet(InitTablet::idle(TabletAlias::new("test", 1), "h", 1, 2))
            .await
            .unwrap();
        let err = wr.ping(&TabletAlias::new("test", 1)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_lock_busy() {
        let wr = wrangler();
        let held = wr.lock_shard("ks", "0", "first").await.unwrap();
        let err = wr.lock_shard("ks", "0", "second").await.err().unwrap();
        assert!(err.to_string().contains("busy"));
        held.release().await.unwrap();
        wr.lock_shard("ks", "0", "third").await.unwrap().release().await.unwrap();
    }
}
