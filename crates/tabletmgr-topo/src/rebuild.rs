//! Recomputes shard membership and the serving graph from tablet records.
//!
//! Output is deterministic (sorted) and nodes are only written when their
//! content changes, so a rebuild with no intervening mutation is a no-op.
//! Callers that need exclusion hold the shard lock around the rebuild.

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::error::TopoError;
use crate::paths;
use crate::topo::Topo;
use crate::types::{EndPoints, Shard, SrvKeyspace, SrvShardRef, Tablet, TabletAlias, TabletType};

/// What a rebuild changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Shard record after the rebuild.
    pub shard: Shard,
    /// Number of nodes written or deleted.
    pub changes: usize,
}

/// Master chosen from tablet records: the recorded one if still a master,
/// otherwise the lowest alias of type master.
fn pick_master(current: &Shard, tablets: &[Tablet]) -> Option<TabletAlias> {
    let masters: Vec<&Tablet> = tablets
        .iter()
        .filter(|t| t.tablet_type == TabletType::Master)
        .collect();
    if let Some(recorded) = &current.master {
        if masters.iter().any(|t| &t.alias == recorded) {
            return Some(recorded.clone());
        }
    }
    masters.first().map(|t| t.alias.clone())
}

/// Rebuilds the shard record and its serving-graph entries in every cell.
pub async fn rebuild_shard_graph(topo: &Topo, keyspace: &str, shard: &str) -> Result<RebuildReport, TopoError> {
    let tablets: Vec<Tablet> = topo
        .tablets_in_shard(keyspace, shard)
        .await?
        .into_iter()
        .filter(Tablet::is_in_replication_graph)
        .collect();

    let (current, version) = match topo.get_shard_versioned(keyspace, shard).await {
        Ok((s, v)) => (s, Some(v)),
        Err(e) if e.is_not_found() => (Shard::for_name(shard)?, None),
        Err(e) => return Err(e),
    };

    let master = pick_master(&current, &tablets);
    let mut replicas: Vec<_> = tablets
        .iter()
        .map(|t| t.alias.clone())
        .filter(|a| Some(a) != master.as_ref())
        .collect();
    replicas.sort();
    let cells: BTreeSet<String> = tablets.iter().map(|t| t.alias.cell.clone()).collect();
    let rebuilt = Shard {
        master,
        replicas,
        key_range: current.key_range.clone(),
        cells: cells.into_iter().collect(),
    };

    let mut changes = 0;
    if version.is_none() || rebuilt != current {
        topo.put_shard(keyspace, shard, &rebuilt, version).await?;
        changes += 1;
    }

    for cell in topo.cells().await? {
        for tablet_type in TabletType::SERVING {
            let mut entries: Vec<_> = tablets
                .iter()
                .filter(|t| {
                    t.alias.cell == cell && t.tablet_type == tablet_type && t.is_in_serving_graph()
                })
                .map(Tablet::endpoint)
                .collect();
            entries.sort_by_key(|e| e.uid);
            let path = paths::endpoints(&cell, keyspace, shard, tablet_type);
            let changed = if entries.is_empty() {
                topo.delete_if_exists(&path).await?
            } else {
                topo.put_if_changed(&path, &EndPoints { entries }).await?
            };
            if changed {
                changes += 1;
            }
        }
    }

    debug!(keyspace, shard, changes, master = ?rebuilt.master, "rebuilt shard graph");
    Ok(RebuildReport {
        shard: rebuilt,
        changes,
    })
}

/// Rebuilds every shard of a keyspace, then the per-cell `SrvKeyspace`.
pub async fn rebuild_keyspace_graph(topo: &Topo, keyspace: &str) -> Result<usize, TopoError> {
    let mut changes = 0;
    let mut shards = Vec::new();
    for name in topo.shard_names(keyspace).await? {
        let report = rebuild_shard_graph(topo, keyspace, &name).await?;
        changes += report.changes;
        shards.push((name, report.shard));
    }
    shards.sort_by(|a, b| a.1.key_range.start.cmp(&b.1.key_range.start).then(a.0.cmp(&b.0)));

    for cell in topo.cells().await? {
        let mut srv = SrvKeyspace::default();
        for tablet_type in TabletType::SERVING {
            let mut refs = Vec::new();
            for (name, shard) in &shards {
                let path = paths::endpoints(&cell, keyspace, name, tablet_type);
                if topo.store().exists(&path).await? {
                    refs.push(SrvShardRef {
                        name: name.clone(),
                        key_range: shard.key_range.clone(),
                    });
                }
            }
            if !refs.is_empty() {
                srv.partitions.insert(tablet_type, refs);
            }
        }
        let path = paths::srv_keyspace(&cell, keyspace);
        let changed = if srv.partitions.is_empty() {
            // Keep the node as a directory for shard entries; only clear data.
            if topo.store().exists(&path).await? {
                topo.put_if_changed(&path, &srv).await?
            } else {
                false
            }
        } else {
            topo.put_if_changed(&path, &srv).await?
        };
        if changed {
            changes += 1;
        }
    }

    info!(keyspace, changes, "rebuilt keyspace graph");
    Ok(changes)
}
