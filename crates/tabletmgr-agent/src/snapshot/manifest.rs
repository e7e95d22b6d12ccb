//! Snapshot artifacts and where they live under the snapshot root.
//!
//! ```text
//! <root>/tablet-<uid>/snapshot_manifest.json
//! <root>/tablet-<uid>/data/<db>/<table>.csv.zst
//! <root>/tablet-<uid>/multi_snapshot_manifest.json
//! <root>/tablet-<uid>/data/<keyspace>-<start>,<end>/partial_snapshot_manifest.json
//! <root>/tablet-<uid>/data/<keyspace>-<start>,<end>/<table>.csv.zst
//! ```
//!
//! Every path stored in a manifest or reply is relative to the root.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tabletmgr_topo::{KeyRange, TabletAlias};

use crate::engine::{Position, TableSchema};
use crate::error::AgentError;

/// Full snapshot manifest name.
pub const SNAPSHOT_MANIFEST: &str = "snapshot_manifest.json";
/// Per-range manifest name.
pub const PARTIAL_MANIFEST: &str = "partial_snapshot_manifest.json";
/// Multi-snapshot index name.
pub const MULTI_INDEX: &str = "multi_snapshot_manifest.json";
/// Data file suffix.
pub const DATA_SUFFIX: &str = ".csv.zst";

/// Directory of one tablet's snapshots, relative to the root.
pub fn tablet_dir(alias: &TabletAlias) -> String {
    format!("tablet-{}", alias.uid_str())
}

/// Default full-snapshot manifest of a tablet.
pub fn default_manifest_path(alias: &TabletAlias) -> String {
    format!("{}/{}", tablet_dir(alias), SNAPSHOT_MANIFEST)
}

/// Multi-snapshot index of a tablet.
pub fn multi_index_path(alias: &TabletAlias) -> String {
    format!("{}/{}", tablet_dir(alias), MULTI_INDEX)
}

/// Data directory for a full snapshot of `db`.
pub fn full_data_dir(alias: &TabletAlias, db: &str) -> String {
    format!("{}/data/{}", tablet_dir(alias), db)
}

/// Data directory for one key range.
pub fn range_data_dir(alias: &TabletAlias, keyspace: &str, range: &KeyRange) -> String {
    format!("{}/data/{}", tablet_dir(alias), range.dir_name(keyspace))
}

/// One exported table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    /// Table name.
    pub table: String,
    /// Data file, relative to the root.
    pub path: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// blake3 of the compressed bytes, hex.
    pub hash: String,
    /// Rows in the file.
    pub rows: usize,
}

/// Describes one export unit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Tablet the data came from.
    pub source: TabletAlias,
    /// Source engine address.
    pub source_addr: String,
    /// Database exported.
    pub db_name: String,
    /// Keyspace of the source.
    pub keyspace: String,
    /// Rows exported; full for a whole-database snapshot.
    pub key_range: KeyRange,
    /// Source position at export time.
    pub position: Position,
    /// Engine a restored copy replicates from; `None` disables replication.
    pub replication_source_addr: Option<String>,
    /// Tablet owning `replication_source_addr`, when known.
    pub replication_source: Option<TabletAlias>,
    /// Table definitions.
    pub tables: Vec<TableSchema>,
    /// Data files, one per table.
    pub files: Vec<SnapshotFile>,
    /// The source was left as a snapshot source.
    pub server_mode: bool,
    /// The source stopped replication for the export.
    pub slave_start_required: bool,
    /// Export time.
    pub created_at: DateTime<Utc>,
}

/// Index of a multi-snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiSnapshotIndex {
    /// Tablet the data came from.
    pub source: TabletAlias,
    /// Column the data was split on.
    pub key_column: String,
    /// Partial manifests, relative to the root, in range order.
    pub manifests: Vec<String>,
}

/// Writes a JSON artifact at `root/rel`, creating directories.
pub async fn write_json<T: Serialize>(root: &Path, rel: &str, value: &T) -> Result<(), AgentError> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(&path, data).await?;
    Ok(())
}

/// Decodes a JSON artifact.
pub fn parse_json<T: DeserializeOwned>(rel: &str, data: &[u8]) -> Result<T, AgentError> {
    serde_json::from_slice(data).map_err(|e| AgentError::Data(format!("bad artifact {}: {}", rel, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletmgr_topo::KeyspaceId;

    #[test]
    fn test_layout() {
        let alias = TabletAlias::new("test", 62344);
        assert_eq!(default_manifest_path(&alias), "tablet-0000062344/snapshot_manifest.json");
        assert_eq!(multi_index_path(&alias), "tablet-0000062344/multi_snapshot_manifest.json");
        assert_eq!(full_data_dir(&alias, "vt_test"), "tablet-0000062344/data/vt_test");
        let range = KeyRange::new(KeyspaceId::default(), KeyspaceId::from_hex("80").unwrap()).unwrap();
        assert_eq!(
            range_data_dir(&alias, "test_keyspace", &range),
            "tablet-0000062344/data/test_keyspace-,80"
        );
    }

    #[tokio::test]
    async fn test_write_and_parse() {
        let dir = tempfile::tempdir().unwrap();
        let index = MultiSnapshotIndex {
            source: TabletAlias::new("test", 1),
            key_column: "id".to_string(),
            manifests: vec!["a".to_string(), "b".to_string()],
        };
        write_json(dir.path(), "tablet-0000000001/multi_snapshot_manifest.json", &index)
            .await
            .unwrap();
        let data = std::fs::read(dir.path().join("tablet-0000000001/multi_snapshot_manifest.json")).unwrap();
        let back: MultiSnapshotIndex = parse_json("x", &data).unwrap();
        assert_eq!(back, index);
        assert!(parse_json::<MultiSnapshotIndex>("x", b"nope").is_err());
    }
}
