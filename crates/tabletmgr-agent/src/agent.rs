//! The per-tablet agent: liveness, the action loop, and shutdown.
//!
//! One agent owns one tablet. It claims queued actions oldest first, runs
//! them one at a time, and publishes every outcome to the action log before
//! removing the queue entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tabletmgr_topo::{
    paths, rebuild_shard_graph, AgentInfo, CreateMode, Tablet, TabletAlias, Topo, TopoError, TopoStore,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::action::{ActionNode, ActionState, FetchOptions};
use crate::actions;
use crate::config::AgentConfig;
use crate::engine::DataEngine;
use crate::error::{ActionErrorKind, AgentError};
use crate::hook::HookRunner;
use crate::rpc::{RpcService, TabletDialer};
use crate::snapshot::{FaultInjector, FetchRetry, LocalFetcher, RpcFetcher, SnapshotFetcher};

/// Published for a running action found after a restart.
pub const ORPHANED_MESSAGE: &str = "agent restarted while action was running";

/// Published for the running action when the agent is told to stop.
pub const INTERRUPTED_MESSAGE: &str = "action interrupted by signal";

const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const PID_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters kept by one agent.
#[derive(Debug, Default)]
pub struct AgentStats {
    executed: AtomicU64,
    failed: AtomicU64,
    interrupted: AtomicU64,
    orphaned: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatsSnapshot {
    /// Actions that finished successfully.
    pub executed: u64,
    /// Actions that finished with an error.
    pub failed: u64,
    /// Actions cut short by `interrupt`.
    pub interrupted: u64,
    /// Running actions failed at startup.
    pub orphaned: u64,
}

impl AgentStats {
    /// Current values.
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
        }
    }
}

/// Everything an action needs: identity, store, engine, settings.
pub struct AgentContext {
    /// Tablet this agent runs for.
    pub alias: TabletAlias,
    /// Typed store access over this agent's session.
    pub topo: Topo,
    /// Local data engine.
    pub engine: Arc<dyn DataEngine>,
    /// Settings.
    pub config: AgentConfig,
    /// Dialer for calls to other agents.
    pub dialer: Arc<dyn TabletDialer>,
    /// Hook runner over `config.hook_dir`.
    pub hooks: HookRunner,
    /// Fetch fault injection, from `config.simulate_fetch_failures`.
    pub faults: FaultInjector,
    /// Counters.
    pub stats: Arc<AgentStats>,
    /// Owner string written into claimed actions.
    pub instance: String,
}

impl AgentContext {
    /// Builds a context. `store` should be a session dedicated to this agent.
    pub fn new(
        alias: TabletAlias,
        store: Arc<dyn TopoStore>,
        engine: Arc<dyn DataEngine>,
        config: AgentConfig,
        dialer: Arc<dyn TabletDialer>,
    ) -> Self {
        let hooks = HookRunner::new(config.hook_dir.clone(), config.hook_timeout());
        let faults = FaultInjector::new(config.simulate_fetch_failures);
        let instance = format!("{}/{}", alias, Uuid::new_v4());
        Self {
            alias,
            topo: Topo::new(store),
            engine,
            config,
            dialer,
            hooks,
            faults,
            stats: Arc::new(AgentStats::default()),
            instance,
        }
    }

    /// Current tablet record.
    pub async fn tablet(&self) -> Result<Tablet, AgentError> {
        Ok(self.topo.get_tablet(&self.alias).await?)
    }

    /// Rebuilds the serving graph of the tablet's shard. No-op for
    /// unassigned tablets.
    pub async fn rebuild_shard(&self, tablet: &Tablet) -> Result<(), AgentError> {
        if tablet.keyspace.is_empty() || tablet.shard.is_empty() {
            return Ok(());
        }
        rebuild_shard_graph(&self.topo, &tablet.keyspace, &tablet.shard).await?;
        Ok(())
    }

    /// Fetcher for snapshot files written by `source`.
    pub fn fetcher_for(&self, source: &Tablet) -> Box<dyn SnapshotFetcher> {
        if self.config.fetch_via_rpc {
            Box::new(RpcFetcher::new(
                self.dialer.clone(),
                source.clone(),
                self.config.rpc_timeout(),
            ))
        } else {
            Box::new(LocalFetcher::new(self.config.snapshot_root.clone()))
        }
    }

    /// Retry settings for a transfer.
    pub fn fetch_retry(&self, fetch: &FetchOptions) -> FetchRetry {
        FetchRetry::new(
            fetch.retry_count,
            Duration::from_millis(self.config.fetch_backoff_ms),
        )
    }
}

/// Starts agents.
pub struct Agent;

impl Agent {
    /// Registers the agent and starts its tasks.
    ///
    /// Fails with `AlreadyRunning` when another live agent holds the tablet
    /// past `pid_wait`.
    pub async fn start(ctx: AgentContext) -> Result<AgentHandle, AgentError> {
        let ctx = Arc::new(ctx);
        let tablet = ctx.tablet().await?;
        wait_for_stale_pid(&ctx).await?;

        let tablet = correct_endpoint(&ctx, tablet).await?;
        let pid_path = paths::tablet_pid(&ctx.alias);
        let info = AgentInfo {
            hostname: tablet.hostname.clone(),
            port: tablet.port,
            pid: std::process::id(),
            started_at: Utc::now(),
            heartbeat_at: Utc::now(),
        };
        let data = serde_json::to_vec(&info)?;
        match ctx.topo.store().create(&pid_path, data, CreateMode::EPHEMERAL).await {
            Ok(_) => {}
            Err(TopoError::NodeExists { .. }) => {
                return Err(AgentError::AlreadyRunning {
                    alias: ctx.alias.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        }
        if tablet.is_assigned() {
            ctx.rebuild_shard(&tablet).await?;
        }

        let orphaned = fail_orphans(&ctx).await?;
        let rpc = RpcService::new(
            ctx.alias.clone(),
            ctx.topo.clone(),
            ctx.engine.clone(),
            ctx.config.snapshot_root.clone(),
            ctx.config.auth_token.clone(),
        );
        let (interrupt_tx, interrupt_rx) = watch::channel(false);
        let heartbeat = tokio::spawn(heartbeat_loop(ctx.clone(), info));
        let main = tokio::spawn(action_loop(ctx.clone(), interrupt_rx));
        info!(tablet = %ctx.alias, instance = %ctx.instance, orphaned, "agent started");

        Ok(AgentHandle {
            ctx,
            rpc,
            interrupt_tx,
            main: Some(main),
            heartbeat: Some(heartbeat),
        })
    }
}

/// Control over a running agent. Dropping it aborts the agent's tasks.
pub struct AgentHandle {
    ctx: Arc<AgentContext>,
    rpc: Arc<RpcService>,
    interrupt_tx: watch::Sender<bool>,
    main: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// The agent's context.
    pub fn context(&self) -> &Arc<AgentContext> {
        &self.ctx
    }

    /// RPC service to expose on the agent port.
    pub fn rpc(&self) -> Arc<RpcService> {
        self.rpc.clone()
    }

    /// Counter values.
    pub fn stats(&self) -> AgentStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// True while the action loop runs.
    pub fn is_running(&self) -> bool {
        self.main.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Graceful stop: the running action, if any, is aborted and published
    /// as interrupted, then the session is closed.
    pub async fn interrupt(mut self) -> Result<(), AgentError> {
        info!(tablet = %self.ctx.alias, "agent interrupted");
        let _ = self.interrupt_tx.send(true);
        if let Some(main) = self.main.take() {
            if let Err(e) = main.await {
                warn!(tablet = %self.ctx.alias, error = %e, "action loop ended abnormally");
            }
        }
        self.stop_tasks();
        self.rpc.shut_down();
        self.ctx.topo.store().close().await?;
        Ok(())
    }

    /// Crash: tasks stop where they are and nothing is published.
    pub async fn kill(mut self) {
        warn!(tablet = %self.ctx.alias, "agent killed");
        self.stop_tasks();
        self.rpc.shut_down();
        if let Err(e) = self.ctx.topo.store().close().await {
            debug!(tablet = %self.ctx.alias, error = %e, "session close after kill");
        }
    }

    fn stop_tasks(&mut self) {
        for task in [self.main.take(), self.heartbeat.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}

async fn wait_for_stale_pid(ctx: &AgentContext) -> Result<(), AgentError> {
    let pid_path = paths::tablet_pid(&ctx.alias);
    let deadline = Instant::now() + ctx.config.pid_wait();
    let mut logged = false;
    while ctx.topo.store().exists(&pid_path).await? {
        if Instant::now() >= deadline {
            return Err(AgentError::AlreadyRunning {
                alias: ctx.alias.to_string(),
            });
        }
        if !logged {
            info!(tablet = %ctx.alias, "waiting for previous agent's liveness node to expire");
            logged = true;
        }
        tokio::time::sleep(PID_POLL_INTERVAL).await;
    }
    Ok(())
}

async fn correct_endpoint(ctx: &AgentContext, tablet: Tablet) -> Result<Tablet, AgentError> {
    let hostname = ctx.config.hostname.clone().unwrap_or_else(|| tablet.hostname.clone());
    let port = ctx.config.port.unwrap_or(tablet.port);
    let engine_port = ctx.config.engine_port.unwrap_or(tablet.engine_port);
    if hostname == tablet.hostname && port == tablet.port && engine_port == tablet.engine_port {
        return Ok(tablet);
    }
    info!(
        tablet = %ctx.alias,
        old = %tablet.agent_addr(),
        new = %format!("{}:{}", hostname, port),
        "correcting tablet endpoint"
    );
    Ok(ctx
        .topo
        .update_tablet(&ctx.alias, |t| {
            t.hostname = hostname.clone();
            t.port = port;
            t.engine_port = engine_port;
            Ok(())
        })
        .await?)
}

/// Writes `node` to the action log, then removes the queue entry.
async fn publish(store: &Arc<dyn TopoStore>, path: &str, node: &ActionNode) -> Result<(), TopoError> {
    let log_path = paths::actionlog_for(path)
        .ok_or_else(|| TopoError::InvalidArgument(format!("not an action path: {}", path)))?;
    store.set(&log_path, node.encode(&log_path)?, None).await?;
    match store.delete(path, None).await {
        Ok(()) | Err(TopoError::NotFound { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fails running entries left by a previous agent and finishes publishing
/// entries it completed but did not remove.
async fn fail_orphans(ctx: &AgentContext) -> Result<usize, AgentError> {
    let store = ctx.topo.store();
    let dir = paths::tablet_action_dir(&ctx.alias);
    let mut orphaned = 0;
    for child in ctx.topo.children_or_empty(&dir).await? {
        let path = paths::join(&dir, &child);
        let (data, _) = match store.get(&path).await {
            Ok(v) => v,
            Err(TopoError::NotFound { .. }) => continue,
            Err(e) => return Err(e.into()),
        };
        let mut node = match ActionNode::decode(&path, &data) {
            Ok(n) => n,
            Err(e) => {
                warn!(path = %path, error = %e, "skipping undecodable action");
                continue;
            }
        };
        match node.state {
            ActionState::Queued => {}
            ActionState::Running => {
                warn!(
                    tablet = %ctx.alias,
                    action = %node.action,
                    owner = node.owner.as_deref().unwrap_or("?"),
                    "failing action orphaned by previous agent"
                );
                node.fail(ActionErrorKind::Interrupted, ORPHANED_MESSAGE);
                publish(store, &path, &node).await?;
                ctx.stats.orphaned.fetch_add(1, Ordering::Relaxed);
                orphaned += 1;
            }
            _ => publish(store, &path, &node).await?,
        }
    }
    Ok(orphaned)
}

async fn heartbeat_loop(ctx: Arc<AgentContext>, mut info: AgentInfo) {
    let path = paths::tablet_pid(&ctx.alias);
    let mut ticker = tokio::time::interval(ctx.config.heartbeat_interval());
    ticker.tick().await;
    loop {
        ticker.tick().await;
        info.heartbeat_at = Utc::now();
        let data = match serde_json::to_vec(&info) {
            Ok(d) => d,
            Err(e) => {
                error!(tablet = %ctx.alias, error = %e, "cannot encode liveness record");
                return;
            }
        };
        let store = ctx.topo.store();
        let result = match store.get(&path).await {
            Ok((_, version)) => store.set(&path, data, Some(version)).await.map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {}
            Err(TopoError::NoSession) => {
                debug!(tablet = %ctx.alias, "session closed, heartbeat stopping");
                return;
            }
            Err(e) => warn!(tablet = %ctx.alias, error = %e, "heartbeat failed"),
        }
    }
}

/// Resolves once an interrupt has been requested. Never resolves if the
/// handle went away without requesting one.
async fn interrupted(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum Step {
    Ran,
    Idle,
    Stop,
}

async fn action_loop(ctx: Arc<AgentContext>, mut interrupt: watch::Receiver<bool>) {
    let dir = paths::tablet_action_dir(&ctx.alias);
    let mut watch = match ctx.topo.store().watch(&dir).await {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(dir = %dir, error = %e, "action queue watch unavailable, polling");
            None
        }
    };

    loop {
        match run_next(&ctx, &dir, &mut interrupt).await {
            Ok(Step::Ran) => continue,
            Ok(Step::Idle) => {}
            Ok(Step::Stop) => break,
            Err(TopoError::NoSession) => {
                debug!(tablet = %ctx.alias, "session closed, action loop stopping");
                break;
            }
            Err(e) => warn!(tablet = %ctx.alias, error = %e, "action queue scan failed"),
        }

        let wake = async {
            match watch.as_mut() {
                Some(w) => {
                    let _ = tokio::time::timeout(QUEUE_POLL_INTERVAL, w.next()).await;
                }
                None => tokio::time::sleep(QUEUE_POLL_INTERVAL).await,
            }
        };
        tokio::select! {
            _ = interrupted(&mut interrupt) => break,
            _ = wake => {}
        }
    }
    info!(tablet = %ctx.alias, "action loop stopped");
}

/// Claims the oldest queued action and runs it.
async fn run_next(
    ctx: &AgentContext,
    dir: &str,
    interrupt: &mut watch::Receiver<bool>,
) -> Result<Step, TopoError> {
    let store = ctx.topo.store();
    let Some((path, mut node)) = claim_next(ctx, dir).await? else {
        return Ok(Step::Idle);
    };
    info!(tablet = %ctx.alias, action = %node.action, path = %path, "running action");

    let args = node.args.clone();
    let outcome = tokio::select! {
        r = actions::execute(ctx, &args) => Some(r),
        _ = interrupted(interrupt) => None,
    };
    let step = match outcome {
        Some(Ok(reply)) => {
            ctx.stats.executed.fetch_add(1, Ordering::Relaxed);
            info!(tablet = %ctx.alias, action = %node.action, "action done");
            node.succeed(reply);
            Step::Ran
        }
        Some(Err(e)) => {
            ctx.stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!(tablet = %ctx.alias, action = %node.action, error = %e, "action failed");
            node.fail(e.kind(), e.to_string());
            Step::Ran
        }
        None => {
            ctx.stats.interrupted.fetch_add(1, Ordering::Relaxed);
            warn!(tablet = %ctx.alias, action = %node.action, "action interrupted");
            node.fail(ActionErrorKind::Interrupted, INTERRUPTED_MESSAGE);
            Step::Stop
        }
    };
    publish(store, &path, &node).await?;
    Ok(step)
}

async fn claim_next(ctx: &AgentContext, dir: &str) -> Result<Option<(String, ActionNode)>, TopoError> {
    let store = ctx.topo.store();
    for child in ctx.topo.children_or_empty(dir).await? {
        let path = paths::join(dir, &child);
        let (data, version) = match store.get(&path).await {
            Ok(v) => v,
            Err(TopoError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        };
        let mut node = match ActionNode::decode(&path, &data) {
            Ok(n) => n,
            Err(e) => {
                warn!(path = %path, error = %e, "dropping undecodable action");
                store.delete(&path, Some(version)).await.ok();
                continue;
            }
        };
        if node.state != ActionState::Queued {
            continue;
        }
        node.claim(&ctx.instance);
        match store.set(&path, node.encode(&path)?, Some(version)).await {
            Ok(_) => return Ok(Some((path, node))),
            Err(TopoError::BadVersion { .. }) | Err(TopoError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
