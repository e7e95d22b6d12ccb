//! Typed access to keyspace, shard, tablet and serving-graph records.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::TopoError;
use crate::paths;
use crate::store::{CreateMode, TopoStore, Version};
use crate::types::{
    AgentInfo, EndPoints, Keyspace, Shard, SrvKeyspace, Tablet, TabletAlias, TabletType,
};

/// Attempts for read-modify-write loops before giving up on contention.
const UPDATE_RETRIES: usize = 16;

/// Typed wrapper around a `TopoStore`. Records are JSON.
#[derive(Clone)]
pub struct Topo {
    store: Arc<dyn TopoStore>,
}

impl Topo {
    /// Wraps a store.
    pub fn new(store: Arc<dyn TopoStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &Arc<dyn TopoStore> {
        &self.store
    }

    /// Reads and decodes a record.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Version), TopoError> {
        let (data, version) = self.store.get(path).await?;
        let value = serde_json::from_slice(&data).map_err(|e| TopoError::codec(path, e))?;
        Ok((value, version))
    }

    /// Encodes and writes a record, with optional compare-and-set.
    pub async fn set_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected: Option<Version>,
    ) -> Result<Version, TopoError> {
        let data = encode(path, value)?;
        self.store.set(path, data, expected).await
    }

    /// Creates a record, failing with `NodeExists` if present.
    pub async fn create_json<T: Serialize>(&self, path: &str, value: &T) -> Result<(), TopoError> {
        let data = encode(path, value)?;
        self.store.create(path, data, CreateMode::PERSISTENT).await?;
        Ok(())
    }

    // Keyspaces

    /// Creates a keyspace record.
    pub async fn create_keyspace(&self, name: &str, ks: &Keyspace) -> Result<(), TopoError> {
        self.create_json(&paths::keyspace(name), ks).await?;
        debug!(keyspace = name, "created keyspace");
        Ok(())
    }

    /// Reads a keyspace record.
    pub async fn get_keyspace(&self, name: &str) -> Result<Keyspace, TopoError> {
        Ok(self.get_json(&paths::keyspace(name)).await?.0)
    }

    /// Overwrites a keyspace record.
    pub async fn put_keyspace(&self, name: &str, ks: &Keyspace) -> Result<(), TopoError> {
        self.set_json(&paths::keyspace(name), ks, None).await?;
        Ok(())
    }

    /// Names of all keyspaces.
    pub async fn keyspaces(&self) -> Result<Vec<String>, TopoError> {
        self.children_or_empty(paths::KEYSPACES_ROOT).await
    }

    // Shards

    /// Creates a shard record.
    pub async fn create_shard(&self, ks: &str, name: &str) -> Result<Shard, TopoError> {
        let shard = Shard::for_name(name)?;
        self.create_json(&paths::shard(ks, name), &shard).await?;
        debug!(keyspace = ks, shard = name, "created shard");
        Ok(shard)
    }

    /// Reads a shard record.
    pub async fn get_shard(&self, ks: &str, name: &str) -> Result<Shard, TopoError> {
        Ok(self.get_json(&paths::shard(ks, name)).await?.0)
    }

    /// Reads a shard record with its version.
    pub async fn get_shard_versioned(&self, ks: &str, name: &str) -> Result<(Shard, Version), TopoError> {
        self.get_json(&paths::shard(ks, name)).await
    }

    /// Writes a shard record.
    pub async fn put_shard(
        &self,
        ks: &str,
        name: &str,
        shard: &Shard,
        expected: Option<Version>,
    ) -> Result<Version, TopoError> {
        self.set_json(&paths::shard(ks, name), shard, expected).await
    }

    /// Names of the shards of a keyspace.
    pub async fn shard_names(&self, ks: &str) -> Result<Vec<String>, TopoError> {
        self.children_or_empty(&paths::shards_dir(ks)).await
    }

    // Tablets

    /// Creates a tablet record.
    pub async fn create_tablet(&self, tablet: &Tablet) -> Result<(), TopoError> {
        self.create_json(&paths::tablet(&tablet.alias), tablet).await?;
        debug!(tablet = %tablet.alias, tablet_type = %tablet.tablet_type, "created tablet");
        Ok(())
    }

    /// Reads a tablet record.
    pub async fn get_tablet(&self, alias: &TabletAlias) -> Result<Tablet, TopoError> {
        Ok(self.get_json(&paths::tablet(alias)).await?.0)
    }

    /// Reads a tablet record with its version.
    pub async fn get_tablet_versioned(&self, alias: &TabletAlias) -> Result<(Tablet, Version), TopoError> {
        self.get_json(&paths::tablet(alias)).await
    }

    /// Writes a tablet record unconditionally.
    pub async fn put_tablet(&self, tablet: &Tablet) -> Result<(), TopoError> {
        self.set_json(&paths::tablet(&tablet.alias), tablet, None).await?;
        Ok(())
    }

    /// Read-modify-write on a tablet record, retried on `BadVersion`.
    pub async fn update_tablet<F>(&self, alias: &TabletAlias, mut f: F) -> Result<Tablet, TopoError>
    where
        F: FnMut(&mut Tablet) -> Result<(), TopoError> + Send,
    {
        let path = paths::tablet(alias);
        for _ in 0..UPDATE_RETRIES {
            let (mut tablet, version) = self.get_json::<Tablet>(&path).await?;
            f(&mut tablet)?;
            match self.set_json(&path, &tablet, Some(version)).await {
                Ok(_) => return Ok(tablet),
                Err(TopoError::BadVersion { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TopoError::DeadlineExceeded {
            what: format!("update of {} kept racing", path),
        })
    }

    /// Removes a tablet record and everything under it.
    pub async fn delete_tablet(&self, alias: &TabletAlias) -> Result<(), TopoError> {
        self.store.delete_recursive(&paths::tablet(alias)).await
    }

    /// Cells that have a tablet directory.
    pub async fn cells(&self) -> Result<Vec<String>, TopoError> {
        self.children_or_empty(paths::CELLS_ROOT).await
    }

    /// Aliases of all tablets in a cell.
    pub async fn tablet_aliases(&self, cell: &str) -> Result<Vec<TabletAlias>, TopoError> {
        let names = self.children_or_empty(&paths::tablets_dir(cell)).await?;
        Ok(names
            .iter()
            .filter_map(|n| n.parse::<u32>().ok())
            .map(|uid| TabletAlias::new(cell, uid))
            .collect())
    }

    /// All tablet records in all cells, ordered by alias.
    pub async fn all_tablets(&self) -> Result<Vec<Tablet>, TopoError> {
        let mut tablets = Vec::new();
        for cell in self.cells().await? {
            for alias in self.tablet_aliases(&cell).await? {
                match self.get_tablet(&alias).await {
                    Ok(t) => tablets.push(t),
                    // Deleted between listing and reading.
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        tablets.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(tablets)
    }

    /// Tablet records assigned to a shard (any type except idle/scrap).
    pub async fn tablets_in_shard(&self, ks: &str, shard: &str) -> Result<Vec<Tablet>, TopoError> {
        Ok(self
            .all_tablets()
            .await?
            .into_iter()
            .filter(|t| t.is_assigned() && t.keyspace == ks && t.shard == shard)
            .collect())
    }

    /// Liveness record of a tablet's agent, `None` when no agent is running.
    pub async fn get_agent_info(&self, alias: &TabletAlias) -> Result<Option<AgentInfo>, TopoError> {
        match self.get_json(&paths::tablet_pid(alias)).await {
            Ok((info, _)) => Ok(Some(info)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    // Serving graph

    /// Endpoints for (cell, keyspace, shard, type).
    pub async fn get_endpoints(
        &self,
        cell: &str,
        ks: &str,
        shard: &str,
        tablet_type: TabletType,
    ) -> Result<EndPoints, TopoError> {
        Ok(self
            .get_json(&paths::endpoints(cell, ks, shard, tablet_type))
            .await?
            .0)
    }

    /// Keyspace serving graph for a cell.
    pub async fn get_srv_keyspace(&self, cell: &str, ks: &str) -> Result<SrvKeyspace, TopoError> {
        Ok(self.get_json(&paths::srv_keyspace(cell, ks)).await?.0)
    }

    /// Writes `value` at `path` unless the stored record already decodes to
    /// the same value. Returns true when something was written.
    pub async fn put_if_changed<T>(&self, path: &str, value: &T) -> Result<bool, TopoError>
    where
        T: Serialize + DeserializeOwned + PartialEq + Sync,
    {
        match self.get_json::<T>(path).await {
            Ok((current, _)) if current == *value => Ok(false),
            Ok(_) | Err(TopoError::NotFound { .. }) | Err(TopoError::Codec { .. }) => {
                self.set_json(path, value, None).await?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Deletes a node if present. Returns true when something was deleted.
    pub async fn delete_if_exists(&self, path: &str) -> Result<bool, TopoError> {
        match self.store.delete(path, None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Children of `path`, empty when the node is missing.
    pub async fn children_or_empty(&self, path: &str) -> Result<Vec<String>, TopoError> {
        match self.store.children(path).await {
            Ok(c) => Ok(c),
            Err(e) if e.is_not_found() => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn encode<T: Serialize>(path: &str, value: &T) -> Result<Vec<u8>, TopoError> {
    serde_json::to_vec_pretty(value).map_err(|e| TopoError::codec(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTopoServer;
    use crate::types::TabletState;

    fn topo() -> Topo {
        Topo::new(Arc::new(MemoryTopoServer::new().connect()))
    }

    fn tablet(uid: u32, ks: &str, shard: &str, t: TabletType) -> Tablet {
        let mut tablet = Tablet::idle(TabletAlias::new("test_nj", uid), "localhost", 6700, 3700);
        tablet.keyspace = ks.to_string();
        tablet.shard = shard.to_string();
        tablet.tablet_type = t;
        tablet
    }

    #[tokio::test]
    async fn test_keyspace_and_shard_crud() {
        let topo = topo();
        topo.create_keyspace("test_keyspace", &Keyspace::default()).await.unwrap();
        assert!(matches!(
            topo.create_keyspace("test_keyspace", &Keyspace::default()).await,
            Err(TopoError::NodeExists { .. })
        ));
        topo.create_shard("test_keyspace", "0").await.unwrap();
        topo.create_shard("test_keyspace", "-80").await.unwrap();
        assert_eq!(topo.keyspaces().await.unwrap(), vec!["test_keyspace"]);
        assert_eq!(topo.shard_names("test_keyspace").await.unwrap(), vec!["-80", "0"]);
        let shard = topo.get_shard("test_keyspace", "-80").await.unwrap();
        assert!(shard.key_range.start.is_empty());
        assert_eq!(shard.key_range.end.to_hex(), "80");
    }

    #[tokio::test]
    async fn test_tablet_listing_and_update() {
        let topo = topo();
        topo.create_tablet(&tablet(2, "ks", "0", TabletType::Replica)).await.unwrap();
        topo.create_tablet(&tablet(1, "ks", "0", TabletType::Master)).await.unwrap();
        topo.create_tablet(&tablet(3, "", "", TabletType::Idle)).await.unwrap();

        let all = topo.all_tablets().await.unwrap();
        assert_eq!(all.iter().map(|t| t.alias.uid).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(topo.tablets_in_shard("ks", "0").await.unwrap().len(), 2);

        let alias = TabletAlias::new("test_nj", 2);
        let updated = topo
            .update_tablet(&alias, |t| {
                t.state = TabletState::Restoring;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.state, TabletState::Restoring);
        assert_eq!(topo.get_tablet(&alias).await.unwrap().state, TabletState::Restoring);
        assert!(topo.get_agent_info(&alias).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_put_if_changed() {
        let topo = topo();
        let ks = Keyspace {
            sharding_column: Some("id".to_string()),
        };
        assert!(topo.put_if_changed("/x", &ks).await.unwrap());
        assert!(!topo.put_if_changed("/x", &ks).await.unwrap());
        assert!(topo.delete_if_exists("/x").await.unwrap());
        assert!(!topo.delete_if_exists("/x").await.unwrap());
    }
}
