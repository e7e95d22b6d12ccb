//! Source side: quiesce, export, and return to duty.

use std::path::Path;

use chrono::Utc;
use tabletmgr_topo::{paths, KeyRange, Tablet, TabletAlias, TabletState, TabletType};
use tracing::{info, warn};

use super::export::export_tables;
use super::manifest::{
    default_manifest_path, full_data_dir, multi_index_path, range_data_dir, tablet_dir, write_json,
    MultiSnapshotIndex, SnapshotFile, SnapshotManifest, PARTIAL_MANIFEST,
};
use crate::action::{MultiSnapshotReply, SnapshotReply};
use crate::agent::AgentContext;
use crate::engine::{Position, TableSchema};
use crate::error::AgentError;

/// Engine state captured before an export, used to undo it afterwards.
struct Quiesced {
    original_type: TabletType,
    was_read_only: bool,
    slave_start_required: bool,
    position: Position,
    replication_source_addr: Option<String>,
    replication_source: Option<TabletAlias>,
}

async fn probe_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let probe = dir.join(".write_probe");
    tokio::fs::write(&probe, b"ok").await?;
    tokio::fs::remove_file(&probe).await
}

/// Fails unless `dir` can be created and written.
pub async fn validate_snapshot_dir(dir: &Path) -> Result<(), AgentError> {
    probe_dir(dir).await.map_err(|e| {
        AgentError::InvalidArgument(format!(
            "Cannot validate snapshot directory {}: {}",
            dir.display(),
            e
        ))
    })
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), AgentError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn check_source(tablet: &Tablet, force: bool) -> Result<(), AgentError> {
    if !tablet.tablet_type.is_in_replication_graph() {
        return Err(AgentError::InvalidArgument(format!(
            "cannot snapshot tablet {} of type {}",
            tablet.alias, tablet.tablet_type
        )));
    }
    if tablet.tablet_type == TabletType::Master && !force {
        return Err(AgentError::InvalidArgument(format!(
            "cannot snapshot master tablet {} without force",
            tablet.alias
        )));
    }
    if tablet.state == TabletState::SnapshotSource {
        return Err(AgentError::InvalidArgument(format!(
            "tablet {} is already a snapshot source",
            tablet.alias
        )));
    }
    Ok(())
}

fn check_ranges(ranges: &[KeyRange]) -> Result<(), AgentError> {
    if ranges.is_empty() {
        return Err(AgentError::InvalidArgument("no key ranges to snapshot".to_string()));
    }
    for w in ranges.windows(2) {
        if w[0].end.is_empty() || w[1].start.is_empty() || w[0].end > w[1].start {
            return Err(AgentError::InvalidArgument(format!(
                "key ranges {} and {} overlap or are out of order",
                w[0], w[1]
            )));
        }
    }
    Ok(())
}

async fn select_tables(
    ctx: &AgentContext,
    tablet: &Tablet,
    only: &[String],
    key_column: &str,
) -> Result<Vec<TableSchema>, AgentError> {
    let all = ctx.engine.tables(&tablet.db_name).await?;
    let chosen = if only.is_empty() {
        all
    } else {
        let mut chosen = Vec::with_capacity(only.len());
        for name in only {
            let schema = all.iter().find(|t| &t.name == name).ok_or_else(|| {
                AgentError::InvalidArgument(format!("no table {} in {}", name, tablet.db_name))
            })?;
            chosen.push(schema.clone());
        }
        chosen
    };
    if key_column.is_empty() {
        return Ok(chosen);
    }
    if let Ok(ks) = ctx.topo.get_keyspace(&tablet.keyspace).await {
        if let Some(col) = ks.sharding_column.as_deref() {
            if col != key_column {
                return Err(AgentError::InvalidArgument(format!(
                    "keyspace {} is sharded on {}, not {}",
                    tablet.keyspace, col, key_column
                )));
            }
        }
    }
    if let Some(t) = chosen.iter().find(|t| t.key_column != key_column) {
        return Err(AgentError::InvalidArgument(format!(
            "table {} is not keyed on column {}",
            t.name, key_column
        )));
    }
    Ok(chosen)
}

async fn quiesce(ctx: &AgentContext, tablet: &Tablet) -> Result<Quiesced, AgentError> {
    let was_read_only = ctx.engine.is_read_only().await?;
    let status = ctx.engine.replication_status().await?;
    let is_master = tablet.tablet_type == TabletType::Master;
    let slave_start_required = !is_master && status.running;
    if slave_start_required {
        ctx.engine.stop_replication().await?;
    }
    ctx.engine.set_read_only(true).await?;
    let position = ctx.engine.position().await?;
    let (replication_source_addr, replication_source) = if is_master {
        (Some(tablet.engine_addr()), Some(tablet.alias.clone()))
    } else {
        (status.source_addr, tablet.parent.clone())
    };
    info!(tablet = %tablet.alias, position, slave_start_required, "source quiesced for snapshot");
    Ok(Quiesced {
        original_type: tablet.tablet_type,
        was_read_only,
        slave_start_required,
        position,
        replication_source_addr,
        replication_source,
    })
}

async fn resume(ctx: &AgentContext, q: &Quiesced) -> Result<(), AgentError> {
    ctx.engine.set_read_only(q.was_read_only).await?;
    if q.slave_start_required {
        ctx.engine.resume_replication().await?;
    }
    Ok(())
}

/// Undoes `quiesce` after a failure, keeping the original error.
async fn resume_after_failure(ctx: &AgentContext, q: &Quiesced, err: AgentError) -> AgentError {
    if let Err(e) = resume(ctx, q).await {
        warn!(tablet = %ctx.alias, error = %e, "could not return source to duty after failed snapshot");
    }
    err
}

fn manifest(
    tablet: &Tablet,
    q: &Quiesced,
    key_range: KeyRange,
    tables: Vec<TableSchema>,
    files: Vec<SnapshotFile>,
    server_mode: bool,
) -> SnapshotManifest {
    SnapshotManifest {
        source: tablet.alias.clone(),
        source_addr: tablet.engine_addr(),
        db_name: tablet.db_name.clone(),
        keyspace: tablet.keyspace.clone(),
        key_range,
        position: q.position,
        replication_source_addr: q.replication_source_addr.clone(),
        replication_source: q.replication_source.clone(),
        tables,
        files,
        server_mode,
        slave_start_required: q.slave_start_required,
        created_at: Utc::now(),
    }
}

async fn export_full(
    ctx: &AgentContext,
    tablet: &Tablet,
    tables: &[TableSchema],
    q: &Quiesced,
    concurrency: usize,
    server_mode: bool,
) -> Result<String, AgentError> {
    let root = &ctx.config.snapshot_root;
    let rel_dir = full_data_dir(&tablet.alias, &tablet.db_name);
    remove_dir_if_exists(&root.join(&rel_dir)).await?;
    let files = export_tables(
        &ctx.engine,
        &tablet.db_name,
        tables,
        &KeyRange::full(),
        root,
        &rel_dir,
        concurrency,
    )
    .await?;
    let m = manifest(tablet, q, KeyRange::full(), tables.to_vec(), files, server_mode);
    let path = default_manifest_path(&tablet.alias);
    write_json(root, &path, &m).await?;
    Ok(path)
}

async fn export_range(
    ctx: &AgentContext,
    tablet: &Tablet,
    tables: &[TableSchema],
    range: &KeyRange,
    q: &Quiesced,
    concurrency: usize,
) -> Result<String, AgentError> {
    let root = &ctx.config.snapshot_root;
    let rel_dir = range_data_dir(&tablet.alias, &tablet.keyspace, range);
    remove_dir_if_exists(&root.join(&rel_dir)).await?;
    let files = export_tables(&ctx.engine, &tablet.db_name, tables, range, root, &rel_dir, concurrency).await?;
    let m = manifest(tablet, q, range.clone(), tables.to_vec(), files, false);
    let path = format!("{}/{}", rel_dir, PARTIAL_MANIFEST);
    write_json(root, &path, &m).await?;
    Ok(path)
}

/// Exports the whole database.
///
/// In server mode the source stays read-only, is marked as a snapshot
/// source, and a non-master source moves to spare until `snapshot_source_end`.
pub async fn snapshot(
    ctx: &AgentContext,
    concurrency: usize,
    server_mode: bool,
    force: bool,
) -> Result<SnapshotReply, AgentError> {
    let tablet = ctx.tablet().await?;
    validate_snapshot_dir(&ctx.config.snapshot_root.join(tablet_dir(&tablet.alias))).await?;
    check_source(&tablet, force)?;
    let tables = ctx.engine.tables(&tablet.db_name).await?;

    let q = quiesce(ctx, &tablet).await?;
    let manifest_path = match export_full(ctx, &tablet, &tables, &q, concurrency, server_mode).await {
        Ok(path) => path,
        Err(e) => return Err(resume_after_failure(ctx, &q, e).await),
    };

    if server_mode {
        let updated = ctx
            .topo
            .update_tablet(&tablet.alias, |t| {
                t.state = TabletState::SnapshotSource;
                if t.tablet_type != TabletType::Master {
                    t.tablet_type = TabletType::Spare;
                }
                Ok(())
            })
            .await?;
        ctx.rebuild_shard(&updated).await?;
    } else {
        resume(ctx, &q).await?;
    }
    info!(tablet = %tablet.alias, manifest = %manifest_path, server_mode, "snapshot complete");

    Ok(SnapshotReply {
        manifest_path,
        parent_path: paths::tablet(&tablet.alias),
        slave_start_required: q.slave_start_required,
        read_only: server_mode || q.was_read_only,
        original_type: q.original_type,
        server_mode,
    })
}

/// Returns a server-mode snapshot source to its original type.
pub async fn snapshot_source_end(
    ctx: &AgentContext,
    original_type: TabletType,
    slave_start_required: bool,
    read_only: bool,
) -> Result<(), AgentError> {
    let tablet = ctx.tablet().await?;
    if tablet.state != TabletState::SnapshotSource {
        return Err(AgentError::InvalidArgument(format!(
            "tablet {} is not a snapshot source",
            tablet.alias
        )));
    }
    let read_only = original_type != TabletType::Master && read_only;
    ctx.engine.set_read_only(read_only).await?;
    if slave_start_required {
        ctx.engine.resume_replication().await?;
    }
    let updated = ctx
        .topo
        .update_tablet(&tablet.alias, |t| {
            t.tablet_type = original_type;
            t.state = TabletState::Serving;
            Ok(())
        })
        .await?;
    ctx.rebuild_shard(&updated).await?;
    info!(tablet = %tablet.alias, tablet_type = %original_type, "snapshot source ended");
    Ok(())
}

/// Exports the rows of one key range.
pub async fn partial_snapshot(
    ctx: &AgentContext,
    key_range: &KeyRange,
    key_column: &str,
    concurrency: usize,
) -> Result<SnapshotReply, AgentError> {
    let tablet = ctx.tablet().await?;
    validate_snapshot_dir(&ctx.config.snapshot_root.join(tablet_dir(&tablet.alias))).await?;
    check_source(&tablet, false)?;
    let tables = select_tables(ctx, &tablet, &[], key_column).await?;

    let q = quiesce(ctx, &tablet).await?;
    let manifest_path = match export_range(ctx, &tablet, &tables, key_range, &q, concurrency).await {
        Ok(path) => path,
        Err(e) => return Err(resume_after_failure(ctx, &q, e).await),
    };
    resume(ctx, &q).await?;

    Ok(SnapshotReply {
        manifest_path,
        parent_path: paths::tablet(&tablet.alias),
        slave_start_required: q.slave_start_required,
        read_only: q.was_read_only,
        original_type: q.original_type,
        server_mode: false,
    })
}

/// Exports one unit per key range plus an index of the units.
pub async fn multi_snapshot(
    ctx: &AgentContext,
    ranges: &[KeyRange],
    only_tables: &[String],
    key_column: &str,
    concurrency: usize,
    force: bool,
) -> Result<MultiSnapshotReply, AgentError> {
    check_ranges(ranges)?;
    let tablet = ctx.tablet().await?;
    validate_snapshot_dir(&ctx.config.snapshot_root.join(tablet_dir(&tablet.alias))).await?;
    check_source(&tablet, force)?;
    let tables = select_tables(ctx, &tablet, only_tables, key_column).await?;

    let q = quiesce(ctx, &tablet).await?;
    let mut manifest_paths = Vec::with_capacity(ranges.len());
    for range in ranges {
        match export_range(ctx, &tablet, &tables, range, &q, concurrency).await {
            Ok(path) => manifest_paths.push(path),
            Err(e) => return Err(resume_after_failure(ctx, &q, e).await),
        }
    }
    let index = MultiSnapshotIndex {
        source: tablet.alias.clone(),
        key_column: key_column.to_string(),
        manifests: manifest_paths.clone(),
    };
    let index_path = multi_index_path(&tablet.alias);
    if let Err(e) = write_json(&ctx.config.snapshot_root, &index_path, &index).await {
        return Err(resume_after_failure(ctx, &q, e).await);
    }
    resume(ctx, &q).await?;
    info!(tablet = %tablet.alias, units = ranges.len(), "multi-snapshot complete");

    Ok(MultiSnapshotReply {
        index_path,
        manifest_paths,
    })
}
