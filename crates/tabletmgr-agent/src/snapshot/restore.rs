//! Destination side: fetch, load, and rejoin replication.

use std::time::Duration;

use tabletmgr_topo::{KeyRange, Tablet, TabletAlias, TabletState, TabletType};
use tracing::info;

use super::export::decode_rows;
use super::fetch::{fetch_files, fetch_with_retry, FetchRetry, SnapshotFetcher};
use super::manifest::{default_manifest_path, multi_index_path, parse_json, MultiSnapshotIndex, SnapshotManifest};
use crate::action::{FetchOptions, RestoreReply, DEFAULT_WAIT_TIMEOUT_MS};
use crate::agent::AgentContext;
use crate::engine::{Position, ReplicationSource, Row};
use crate::error::AgentError;

fn check_target(tablet: &Tablet) -> Result<(), AgentError> {
    if tablet.tablet_type != TabletType::Idle {
        return Err(AgentError::InvalidArgument(format!(
            "restore target {} must be idle, not {}",
            tablet.alias, tablet.tablet_type
        )));
    }
    if tablet.keyspace.is_empty() || tablet.shard.is_empty() {
        return Err(AgentError::InvalidArgument(format!(
            "restore target {} has no keyspace and shard assigned",
            tablet.alias
        )));
    }
    Ok(())
}

async fn fetch_json<T: serde::de::DeserializeOwned>(
    ctx: &AgentContext,
    fetcher: &dyn SnapshotFetcher,
    path: &str,
    retry: &FetchRetry,
) -> Result<T, AgentError> {
    let data = fetch_with_retry(fetcher, &ctx.faults, path, None, retry).await?;
    parse_json(path, &data)
}

async fn ensure_empty(ctx: &AgentContext, db: &str) -> Result<(), AgentError> {
    for table in ctx.engine.tables(db).await? {
        if !ctx.engine.read_rows(db, &table.name).await?.is_empty() {
            return Err(AgentError::InvalidArgument(format!(
                "database {} is not empty (table {} has rows)",
                db, table.name
            )));
        }
    }
    Ok(())
}

/// Fetches and verifies every file of `manifest`, keeping rows inside
/// `keep`. Nothing is written to the engine.
async fn fetch_unit(
    ctx: &AgentContext,
    fetcher: &dyn SnapshotFetcher,
    manifest: &SnapshotManifest,
    keep: &KeyRange,
    fetch: &FetchOptions,
) -> Result<Vec<(String, Vec<Row>)>, AgentError> {
    let retry = ctx.fetch_retry(fetch);
    let blobs = fetch_files(fetcher, &ctx.faults, &manifest.files, fetch.concurrency, &retry).await?;
    let mut unit = Vec::with_capacity(blobs.len());
    for (file, data) in manifest.files.iter().zip(blobs) {
        let decoded: Vec<Row> = decode_rows(&data)?
            .into_iter()
            .filter(|r| keep.contains(&r.key))
            .collect();
        unit.push((file.table.clone(), decoded));
    }
    Ok(unit)
}

/// Creates the tables of `manifest` and loads a fetched unit. Returns
/// (files, rows).
async fn load_unit(
    ctx: &AgentContext,
    manifest: &SnapshotManifest,
    db: &str,
    unit: Vec<(String, Vec<Row>)>,
) -> Result<(usize, usize), AgentError> {
    for schema in &manifest.tables {
        ctx.engine.create_table(db, schema).await?;
    }
    let files = unit.len();
    let mut rows = 0;
    for (table, decoded) in unit {
        rows += decoded.len();
        ctx.engine.load_rows(db, &table, decoded).await?;
    }
    Ok((files, rows))
}

/// Fetches and loads every file of `manifest`, keeping rows inside `keep`.
/// Returns (files, rows).
async fn load(
    ctx: &AgentContext,
    fetcher: &dyn SnapshotFetcher,
    manifest: &SnapshotManifest,
    db: &str,
    keep: &KeyRange,
    fetch: &FetchOptions,
) -> Result<(usize, usize), AgentError> {
    let unit = fetch_unit(ctx, fetcher, manifest, keep, fetch).await?;
    load_unit(ctx, manifest, db, unit).await
}

async fn start_replication(
    ctx: &AgentContext,
    tablet: &Tablet,
    manifest: &SnapshotManifest,
    wait: bool,
) -> Result<Option<Position>, AgentError> {
    let Some(addr) = manifest.replication_source_addr.clone() else {
        return Ok(None);
    };
    ctx.engine
        .start_replication(ReplicationSource {
            addr,
            source_db: manifest.db_name.clone(),
            target_db: tablet.db_name.clone(),
            position: manifest.position,
            key_range: manifest.key_range.clone(),
        })
        .await?;
    if wait {
        ctx.engine
            .wait_for_replication_start(Duration::from_millis(DEFAULT_WAIT_TIMEOUT_MS))
            .await?;
    }
    Ok(Some(manifest.position))
}

async fn finish(
    ctx: &AgentContext,
    tablet_type: TabletType,
    manifest: &SnapshotManifest,
) -> Result<(), AgentError> {
    let parent = manifest.replication_source.clone();
    let key_range = manifest.key_range.clone();
    let updated = ctx
        .topo
        .update_tablet(&ctx.alias, |t| {
            t.tablet_type = tablet_type;
            t.state = TabletState::Serving;
            t.parent = parent.clone();
            if !key_range.is_full() {
                t.key_range = key_range.clone();
            }
            Ok(())
        })
        .await?;
    ctx.rebuild_shard(&updated).await?;
    Ok(())
}

/// Loads a full snapshot from `source` into an empty database and starts
/// replication at the captured position.
pub async fn restore(
    ctx: &AgentContext,
    source: &TabletAlias,
    manifest_path: Option<&str>,
    fetch: &FetchOptions,
    dont_wait_for_slave_start: bool,
    tablet_type: TabletType,
) -> Result<RestoreReply, AgentError> {
    let tablet = ctx.tablet().await?;
    check_target(&tablet)?;
    let source_tablet = ctx.topo.get_tablet(source).await?;
    let fetcher = ctx.fetcher_for(&source_tablet);
    let path = manifest_path
        .map(str::to_string)
        .unwrap_or_else(|| default_manifest_path(source));
    let manifest: SnapshotManifest = fetch_json(ctx, fetcher.as_ref(), &path, &ctx.fetch_retry(fetch)).await?;

    ctx.engine.create_database(&tablet.db_name).await?;
    ensure_empty(ctx, &tablet.db_name).await?;
    let (files, rows) = load(ctx, fetcher.as_ref(), &manifest, &tablet.db_name, &KeyRange::full(), fetch).await?;
    let position = start_replication(ctx, &tablet, &manifest, !dont_wait_for_slave_start).await?;
    finish(ctx, tablet_type, &manifest).await?;
    info!(tablet = %ctx.alias, source = %source, files, rows, "restore complete");
    Ok(RestoreReply { files, rows, position })
}

/// Loads one key range into a pre-provisioned database and starts filtered
/// replication.
pub async fn partial_restore(
    ctx: &AgentContext,
    source: &TabletAlias,
    manifest_path: &str,
    fetch: &FetchOptions,
    tablet_type: TabletType,
) -> Result<RestoreReply, AgentError> {
    let tablet = ctx.tablet().await?;
    check_target(&tablet)?;
    if !ctx.engine.database_exists(&tablet.db_name).await? {
        return Err(AgentError::InvalidArgument(format!(
            "database {} does not exist; partial restore needs a pre-provisioned database",
            tablet.db_name
        )));
    }
    let source_tablet = ctx.topo.get_tablet(source).await?;
    let fetcher = ctx.fetcher_for(&source_tablet);
    let manifest: SnapshotManifest =
        fetch_json(ctx, fetcher.as_ref(), manifest_path, &ctx.fetch_retry(fetch)).await?;

    let (files, rows) = load(
        ctx,
        fetcher.as_ref(),
        &manifest,
        &tablet.db_name,
        &manifest.key_range,
        fetch,
    )
    .await?;
    let position = start_replication(ctx, &tablet, &manifest, true).await?;
    finish(ctx, tablet_type, &manifest).await?;
    info!(tablet = %ctx.alias, source = %source, range = %manifest.key_range, files, rows, "partial restore complete");
    Ok(RestoreReply { files, rows, position })
}

/// Merges the multi-snapshot units of `sources` that intersect `key_range`,
/// loading only rows inside it. Nothing is loaded unless every unit
/// fetches. Replication is not started.
pub async fn multi_restore(
    ctx: &AgentContext,
    sources: &[TabletAlias],
    key_range: &KeyRange,
    fetch: &FetchOptions,
) -> Result<RestoreReply, AgentError> {
    if sources.is_empty() {
        return Err(AgentError::InvalidArgument("no multi-restore sources given".to_string()));
    }
    let tablet = ctx.tablet().await?;
    let retry = ctx.fetch_retry(fetch);

    // Every unit is fetched and verified before any row is loaded.
    let mut units = Vec::new();
    for source in sources {
        let source_tablet = ctx.topo.get_tablet(source).await?;
        let fetcher = ctx.fetcher_for(&source_tablet);
        let index: MultiSnapshotIndex =
            fetch_json(ctx, fetcher.as_ref(), &multi_index_path(source), &retry).await?;
        for path in &index.manifests {
            let manifest: SnapshotManifest = fetch_json(ctx, fetcher.as_ref(), path, &retry).await?;
            if !manifest.key_range.intersects(key_range) {
                continue;
            }
            let unit = fetch_unit(ctx, fetcher.as_ref(), &manifest, key_range, fetch).await?;
            units.push((manifest, unit));
        }
    }

    ctx.engine.create_database(&tablet.db_name).await?;
    let mut reply = RestoreReply::default();
    for (manifest, unit) in units {
        let (files, rows) = load_unit(ctx, &manifest, &tablet.db_name, unit).await?;
        reply.files += files;
        reply.rows += rows;
    }
    info!(tablet = %ctx.alias, range = %key_range, files = reply.files, rows = reply.rows, "multi-restore complete");
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_target() {
        let mut t = Tablet::idle(TabletAlias::new("test", 5), "localhost", 1, 2);
        let err = check_target(&t).unwrap_err();
        assert!(err.to_string().contains("no keyspace"));
        t.keyspace = "test_keyspace".to_string();
        t.shard = "0".to_string();
        assert!(check_target(&t).is_ok());
        t.tablet_type = TabletType::Replica;
        assert!(check_target(&t).unwrap_err().to_string().contains("must be idle"));
    }
}
