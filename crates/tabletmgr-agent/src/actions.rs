//! Action implementations, dispatched by command.

use std::time::Duration;

use tabletmgr_topo::{TabletAlias, TabletState, TabletType};
use tracing::info;

use crate::action::{ActionArgs, ActionReply};
use crate::agent::AgentContext;
use crate::engine::{Position, ReplicationSource};
use crate::error::AgentError;
use crate::rpc;
use crate::snapshot;

/// Runs one action against the agent's tablet.
pub async fn execute(ctx: &AgentContext, args: &ActionArgs) -> Result<ActionReply, AgentError> {
    match args {
        ActionArgs::Ping => {
            ctx.engine.ping().await?;
            Ok(ActionReply::Pong)
        }
        ActionArgs::Sleep { duration_ms } => {
            tokio::time::sleep(Duration::from_millis(*duration_ms)).await;
            Ok(ActionReply::None)
        }
        ActionArgs::SetReadOnly => {
            ctx.engine.set_read_only(true).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::SetReadWrite => {
            ctx.engine.set_read_only(false).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::DemoteMaster => {
            ctx.engine.set_read_only(true).await?;
            let position = ctx.engine.position().await?;
            info!(tablet = %ctx.alias, position, "demoted master");
            Ok(ActionReply::Position(position))
        }
        ActionArgs::PromoteSlave {
            wait_position,
            wait_timeout_ms,
        } => promote_slave(ctx, *wait_position, *wait_timeout_ms).await,
        ActionArgs::RestartSlave { master } => {
            restart_slave(ctx, master).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::ReparentPosition {
            master,
            wait_timeout_ms,
        } => reparent_position(ctx, master, *wait_timeout_ms).await,
        ActionArgs::ChangeType { tablet_type } => {
            change_type(ctx, *tablet_type, false).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::Scrap { skip_rebuild } => {
            change_type(ctx, TabletType::Scrap, *skip_rebuild).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::ExecuteHook { name, params } => {
            let env = [("TABLET_ALIAS", ctx.alias.to_string())];
            Ok(ActionReply::Hook(ctx.hooks.execute(name, params, &env).await?))
        }
        ActionArgs::Snapshot {
            concurrency,
            server_mode,
            force,
        } => Ok(ActionReply::Snapshot(
            snapshot::snapshot(ctx, *concurrency, *server_mode, *force).await?,
        )),
        ActionArgs::SnapshotSourceEnd {
            original_type,
            slave_start_required,
            read_only,
        } => {
            snapshot::snapshot_source_end(ctx, *original_type, *slave_start_required, *read_only).await?;
            Ok(ActionReply::None)
        }
        ActionArgs::PartialSnapshot {
            key_range,
            key_column,
            concurrency,
        } => Ok(ActionReply::Snapshot(
            snapshot::partial_snapshot(ctx, key_range, key_column, *concurrency).await?,
        )),
        ActionArgs::MultiSnapshot {
            ranges,
            tables,
            key_column,
            concurrency,
            force,
        } => Ok(ActionReply::MultiSnapshot(
            snapshot::multi_snapshot(ctx, ranges, tables, key_column, *concurrency, *force).await?,
        )),
        ActionArgs::Restore {
            source,
            manifest_path,
            fetch,
            dont_wait_for_slave_start,
            tablet_type,
        } => Ok(ActionReply::Restore(
            snapshot::restore(
                ctx,
                source,
                manifest_path.as_deref(),
                fetch,
                *dont_wait_for_slave_start,
                *tablet_type,
            )
            .await?,
        )),
        ActionArgs::PartialRestore {
            source,
            manifest_path,
            fetch,
            tablet_type,
        } => Ok(ActionReply::Restore(
            snapshot::partial_restore(ctx, source, manifest_path, fetch, *tablet_type).await?,
        )),
        ActionArgs::MultiRestore {
            sources,
            key_range,
            fetch,
        } => Ok(ActionReply::Restore(
            snapshot::multi_restore(ctx, sources, key_range, fetch).await?,
        )),
    }
}

async fn promote_slave(
    ctx: &AgentContext,
    wait_position: Option<Position>,
    wait_timeout_ms: u64,
) -> Result<ActionReply, AgentError> {
    if let Some(target) = wait_position {
        ctx.engine
            .wait_for_position(target, Duration::from_millis(wait_timeout_ms))
            .await?;
    }
    let position = ctx.engine.promote().await?;
    ctx.topo
        .update_tablet(&ctx.alias, |t| {
            t.tablet_type = TabletType::Master;
            t.parent = None;
            t.state = TabletState::Serving;
            Ok(())
        })
        .await?;
    info!(tablet = %ctx.alias, position, "promoted to master");
    Ok(ActionReply::Position(position))
}

/// Points replication at `master` from the current position. A former
/// master becomes a spare.
async fn restart_slave(ctx: &AgentContext, master: &TabletAlias) -> Result<(), AgentError> {
    if *master == ctx.alias {
        return Err(AgentError::InvalidArgument(format!(
            "tablet {} cannot replicate from itself",
            master
        )));
    }
    let tablet = ctx.tablet().await?;
    let master_tablet = ctx.topo.get_tablet(master).await?;
    let position = ctx.engine.position().await?;
    ctx.engine.set_read_only(true).await?;
    ctx.engine
        .start_replication(ReplicationSource {
            addr: master_tablet.engine_addr(),
            source_db: master_tablet.db_name.clone(),
            target_db: tablet.db_name.clone(),
            position,
            key_range: tablet.key_range.clone(),
        })
        .await?;

    let parent = master.clone();
    ctx.topo
        .update_tablet(&ctx.alias, |t| {
            if t.tablet_type == TabletType::Master {
                t.tablet_type = TabletType::Spare;
            }
            t.parent = Some(parent.clone());
            Ok(())
        })
        .await?;
    info!(tablet = %ctx.alias, master = %master, position, "replication restarted");
    Ok(())
}

async fn reparent_position(
    ctx: &AgentContext,
    master: &TabletAlias,
    wait_timeout_ms: u64,
) -> Result<ActionReply, AgentError> {
    let master_tablet = ctx.topo.get_tablet(master).await?;
    let target = rpc::ping(ctx.dialer.as_ref(), &master_tablet, ctx.config.rpc_timeout())
        .await?
        .position;
    restart_slave(ctx, master).await?;
    ctx.engine
        .wait_for_position(target, Duration::from_millis(wait_timeout_ms))
        .await?;
    let position = ctx.engine.position().await?;
    info!(tablet = %ctx.alias, master = %master, position, "caught up with master");
    Ok(ActionReply::Position(position))
}

async fn change_type(ctx: &AgentContext, tablet_type: TabletType, skip_rebuild: bool) -> Result<(), AgentError> {
    let current = ctx.tablet().await?;
    if tablet_type.is_assigned() && (current.keyspace.is_empty() || current.shard.is_empty()) {
        return Err(AgentError::InvalidArgument(format!(
            "tablet {} is not assigned to a shard; cannot become {}",
            ctx.alias, tablet_type
        )));
    }
    let updated = ctx
        .topo
        .update_tablet(&ctx.alias, |t| {
            t.tablet_type = tablet_type;
            if tablet_type == TabletType::Scrap {
                t.parent = None;
            }
            Ok(())
        })
        .await?;
    info!(tablet = %ctx.alias, from = %current.tablet_type, to = %tablet_type, "changed type");
    if !skip_rebuild {
        ctx.rebuild_shard(&updated).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::engine::{DataEngine, EngineDirectory, MemoryEngine, Row, TableSchema};
    use crate::rpc::LocalDialer;
    use std::sync::Arc;
    use tabletmgr_topo::{MemoryTopoServer, Tablet, Topo, TopoStore};

    async fn context(server: &MemoryTopoServer, uid: u32, dir: &std::path::Path) -> AgentContext {
        let alias = TabletAlias::new("test", uid);
        let topo = Topo::new(Arc::new(server.connect()));
        let mut tablet = Tablet::idle(alias.clone(), "localhost", 7000 + uid as u16, 8000 + uid as u16);
        tablet.keyspace = "test_keyspace".to_string();
        tablet.shard = "0".to_string();
        tablet.tablet_type = TabletType::Replica;
        topo.create_tablet(&tablet).await.unwrap();
        let engine: Arc<dyn DataEngine> = MemoryEngine::new(tablet.engine_addr(), EngineDirectory::new());
        let store: Arc<dyn TopoStore> = Arc::new(server.connect());
        let config = AgentConfig {
            snapshot_root: dir.join("snapshot"),
            hook_dir: dir.join("hooks"),
            ..Default::default()
        };
        AgentContext::new(alias, store, engine, config, LocalDialer::new(None))
    }

    #[tokio::test]
    async fn test_demote_reports_position() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryTopoServer::new();
        let ctx = context(&server, 1, dir.path()).await;
        ctx.engine.create_database("vt_test").await.unwrap();
        ctx.engine
            .create_table("vt_test", &TableSchema::new("t", "id", &["msg"]))
            .await
            .unwrap();
        ctx.engine
            .insert("vt_test", "t", vec![Row::new(1, vec!["a".to_string()])])
            .await
            .unwrap();
        let reply = execute(&ctx, &ActionArgs::DemoteMaster).await.unwrap();
        assert_eq!(reply, ActionReply::Position(1));
        assert!(ctx.engine.is_read_only().await.unwrap());
    }

    #[tokio::test]
    async fn test_promote_sets_master_and_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryTopoServer::new();
        let ctx = context(&server, 2, dir.path()).await;
        ctx.engine.set_read_only(true).await.unwrap();
        let args = ActionArgs::PromoteSlave {
            wait_position: None,
            wait_timeout_ms: 100,
        };
        execute(&ctx, &args).await.unwrap();
        assert!(!ctx.engine.is_read_only().await.unwrap());
        let tablet = ctx.tablet().await.unwrap();
        assert_eq!(tablet.tablet_type, TabletType::Master);
        assert_eq!(tablet.parent, None);
    }

    #[tokio::test]
    async fn test_promote_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryTopoServer::new();
        let ctx = context(&server, 3, dir.path()).await;
        let args = ActionArgs::PromoteSlave {
            wait_position: Some(10),
            wait_timeout_ms: 50,
        };
        let err = execute(&ctx, &args).await.unwrap_err();
        assert!(matches!(err, AgentError::Engine(_)));
        assert_eq!(ctx.tablet().await.unwrap().tablet_type, TabletType::Replica);
    }

    #[tokio::test]
    async fn test_restart_slave_rejects_self() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryTopoServer::new();
        let ctx = context(&server, 4, dir.path()).await;
        let args = ActionArgs::RestartSlave {
            master: ctx.alias.clone(),
        };
        assert!(matches!(
            execute(&ctx, &args).await.unwrap_err(),
            AgentError::InvalidArgument(_)
        ));
    }

    #[tokio::test]
    async fn test_scrap_and_change_type() {
        let dir = tempfile::tempdir().unwrap();
        let server = MemoryTopoServer::new();
        let ctx = context(&server, 5, dir.path()).await;
        execute(&ctx, &ActionArgs::ChangeType { tablet_type: TabletType::Spare })
            .await
            .unwrap();
        assert_eq!(ctx.tablet().await.unwrap().tablet_type, TabletType::Spare);
        let shard = ctx.topo.get_shard("test_keyspace", "0").await.unwrap();
        assert_eq!(shard.replicas, vec![ctx.alias.clone()]);

        execute(&ctx, &ActionArgs::Scrap { skip_rebuild: false }).await.unwrap();
        assert_eq!(ctx.tablet().await.unwrap().tablet_type, TabletType::Scrap);
        let shard = ctx.topo.get_shard("test_keyspace", "0").await.unwrap();
        assert!(shard.replicas.is_empty());
    }
}
