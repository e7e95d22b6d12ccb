//! Layout of the coordination tree.
//!
//! ```text
//! /global/keyspaces/<ks>                              Keyspace
//! /global/keyspaces/<ks>/action/<seq>                 keyspace lock queue
//! /global/keyspaces/<ks>/shards/<shard>               Shard
//! /global/keyspaces/<ks>/shards/<shard>/action/<seq>  shard lock queue
//! /cells/<cell>/tablets/<uid>                         Tablet
//! /cells/<cell>/tablets/<uid>/pid                     agent liveness (ephemeral)
//! /cells/<cell>/tablets/<uid>/action/<seq>            action queue
//! /cells/<cell>/tablets/<uid>/actionlog/<seq>         published results
//! /cells/<cell>/serving/<ks>                          SrvKeyspace
//! /cells/<cell>/serving/<ks>/<shard>/<type>           EndPoints
//! ```

use crate::types::{TabletAlias, TabletType};

/// Root of the keyspace tree.
pub const KEYSPACES_ROOT: &str = "/global/keyspaces";
/// Root of the per-cell trees.
pub const CELLS_ROOT: &str = "/cells";

/// Keyspace record.
pub fn keyspace(ks: &str) -> String {
    format!("{}/{}", KEYSPACES_ROOT, ks)
}

/// Keyspace lock queue.
pub fn keyspace_action_dir(ks: &str) -> String {
    format!("{}/action", keyspace(ks))
}

/// Parent of all shard records of a keyspace.
pub fn shards_dir(ks: &str) -> String {
    format!("{}/shards", keyspace(ks))
}

/// Shard record.
pub fn shard(ks: &str, shard: &str) -> String {
    format!("{}/{}", shards_dir(ks), shard)
}

/// Shard lock queue.
pub fn shard_action_dir(ks: &str, shard_name: &str) -> String {
    format!("{}/action", shard(ks, shard_name))
}

/// Per-cell root.
pub fn cell(cell: &str) -> String {
    format!("{}/{}", CELLS_ROOT, cell)
}

/// Parent of all tablet records in a cell.
pub fn tablets_dir(cell_name: &str) -> String {
    format!("{}/tablets", cell(cell_name))
}

/// Tablet record.
pub fn tablet(alias: &TabletAlias) -> String {
    format!("{}/{}", tablets_dir(&alias.cell), alias.uid_str())
}

/// Ephemeral agent liveness node.
pub fn tablet_pid(alias: &TabletAlias) -> String {
    format!("{}/pid", tablet(alias))
}

/// Tablet action queue.
pub fn tablet_action_dir(alias: &TabletAlias) -> String {
    format!("{}/action", tablet(alias))
}

/// Tablet action results.
pub fn tablet_actionlog_dir(alias: &TabletAlias) -> String {
    format!("{}/actionlog", tablet(alias))
}

/// Result path corresponding to a queued action path.
///
/// `/cells/c/tablets/0000000001/action/0000000007` maps to
/// `/cells/c/tablets/0000000001/actionlog/0000000007`.
pub fn actionlog_for(action_path: &str) -> Option<String> {
    let (dir, seq) = action_path.rsplit_once('/')?;
    let parent = dir.strip_suffix("/action")?;
    Some(format!("{}/actionlog/{}", parent, seq))
}

/// Serving graph root for a keyspace in a cell.
pub fn srv_keyspace(cell_name: &str, ks: &str) -> String {
    format!("{}/serving/{}", cell(cell_name), ks)
}

/// Serving graph directory for a shard in a cell.
pub fn srv_shard(cell_name: &str, ks: &str, shard_name: &str) -> String {
    format!("{}/{}", srv_keyspace(cell_name, ks), shard_name)
}

/// Serving graph endpoints for (cell, keyspace, shard, type).
pub fn endpoints(cell_name: &str, ks: &str, shard_name: &str, tablet_type: TabletType) -> String {
    format!("{}/{}", srv_shard(cell_name, ks, shard_name), tablet_type)
}

/// Last path component.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parent path, `None` for the root.
pub fn parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        Some(0) if path.len() > 1 => Some("/"),
        Some(0) | None => None,
        Some(i) => Some(&path[..i]),
    }
}

/// Joins a directory and a child name.
pub fn join(dir: &str, child: &str) -> String {
    if dir == "/" {
        format!("/{}", child)
    } else {
        format!("{}/{}", dir, child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tablet_paths() {
        let alias = TabletAlias::new("test_nj", 62344);
        assert_eq!(tablet(&alias), "/cells/test_nj/tablets/0000062344");
        assert_eq!(tablet_pid(&alias), "/cells/test_nj/tablets/0000062344/pid");
        assert_eq!(
            tablet_action_dir(&alias),
            "/cells/test_nj/tablets/0000062344/action"
        );
    }

    #[test]
    fn test_actionlog_for() {
        assert_eq!(
            actionlog_for("/cells/c/tablets/0000000001/action/0000000007").as_deref(),
            Some("/cells/c/tablets/0000000001/actionlog/0000000007")
        );
        assert_eq!(actionlog_for("/cells/c/tablets/0000000001/pid"), None);
    }

    #[test]
    fn test_endpoints_path() {
        assert_eq!(
            endpoints("test_nj", "test_keyspace", "0", TabletType::Master),
            "/cells/test_nj/serving/test_keyspace/0/master"
        );
    }

    #[test]
    fn test_parent_and_base() {
        assert_eq!(parent("/a/b/c"), Some("/a/b"));
        assert_eq!(parent("/a"), Some("/"));
        assert_eq!(parent("/"), None);
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(join("/", "a"), "/a");
        assert_eq!(join("/a", "b"), "/a/b");
    }
}
