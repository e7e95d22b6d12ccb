//! Topology validation.
//!
//! Each check appends a human-readable problem; an empty list means the
//! checked scope is consistent. Pinging is optional since it needs every
//! tablet's agent to answer within the RPC bound.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use tabletmgr_agent::rpc;
use tabletmgr_topo::{paths, Shard, Tablet, TabletAlias, TabletType};
use tracing::{debug, warn};

use crate::error::WranglerError;
use crate::wrangler::Wrangler;

impl Wrangler {
    /// Validates every keyspace, plus tablets pointing at missing shards.
    pub async fn validate(&self, ping: bool) -> Result<Vec<String>, WranglerError> {
        let mut problems = Vec::new();
        let keyspaces: BTreeSet<String> = self.topo().keyspaces().await?.into_iter().collect();
        for ks in &keyspaces {
            problems.extend(self.validate_keyspace(ks, ping).await?);
        }

        for tablet in self.topo().all_tablets().await? {
            if !tablet.is_assigned() {
                continue;
            }
            if !keyspaces.contains(&tablet.keyspace) {
                problems.push(format!(
                    "tablet {} references missing keyspace {}",
                    tablet.alias, tablet.keyspace
                ));
            } else if let Err(e) = self.topo().get_shard(&tablet.keyspace, &tablet.shard).await {
                if !e.is_not_found() {
                    return Err(e.into());
                }
                problems.push(format!(
                    "tablet {} references missing shard {}/{}",
                    tablet.alias, tablet.keyspace, tablet.shard
                ));
            }
        }
        Ok(problems)
    }

    /// Validates every shard of a keyspace and checks shard ranges for
    /// overlap.
    pub async fn validate_keyspace(&self, keyspace: &str, ping: bool) -> Result<Vec<String>, WranglerError> {
        self.topo().get_keyspace(keyspace).await?;
        let mut problems = Vec::new();
        let mut shards = Vec::new();
        for name in self.topo().shard_names(keyspace).await? {
            problems.extend(self.validate_shard(keyspace, &name, ping).await?);
            shards.push((name.clone(), self.topo().get_shard(keyspace, &name).await?));
        }
        for (i, (a, sa)) in shards.iter().enumerate() {
            for (b, sb) in &shards[i + 1..] {
                if sa.key_range.intersects(&sb.key_range) {
                    problems.push(format!(
                        "shards {}/{} and {}/{} have overlapping key ranges",
                        keyspace, a, keyspace, b
                    ));
                }
            }
        }
        Ok(problems)
    }

    /// Validates one shard: a single master, membership against tablet
    /// records, parents, the serving graph and, with `ping`, live agents and
    /// replication sources.
    pub async fn validate_shard(&self, keyspace: &str, shard: &str, ping: bool) -> Result<Vec<String>, WranglerError> {
        let record = self.topo().get_shard(keyspace, shard).await?;
        let tablets = self.topo().tablets_in_shard(keyspace, shard).await?;
        let mut problems = Vec::new();

        check_master(keyspace, shard, &record, &tablets, &mut problems);
        check_membership(keyspace, shard, &record, &tablets, &mut problems);
        self.check_serving_graph(keyspace, shard, &tablets, &mut problems).await?;
        if ping {
            self.check_live(&record, &tablets, &mut problems).await?;
        }

        if problems.is_empty() {
            debug!(keyspace, shard, "shard validated");
        } else {
            warn!(keyspace, shard, problems = problems.len(), "shard validation found problems");
        }
        Ok(problems)
    }

    /// `validate_shard` with problems turned into an error.
    pub async fn require_valid_shard(&self, keyspace: &str, shard: &str, ping: bool) -> Result<(), WranglerError> {
        let problems = self.validate_shard(keyspace, shard, ping).await?;
        if problems.is_empty() {
            Ok(())
        } else {
            Err(WranglerError::Validation(problems))
        }
    }

    async fn check_serving_graph(
        &self,
        keyspace: &str,
        shard: &str,
        tablets: &[Tablet],
        problems: &mut Vec<String>,
    ) -> Result<(), WranglerError> {
        let mut expected: BTreeMap<(String, TabletType), BTreeSet<u32>> = BTreeMap::new();
        for t in tablets.iter().filter(|t| t.is_in_serving_graph()) {
            expected
                .entry((t.alias.cell.clone(), t.tablet_type))
                .or_default()
                .insert(t.alias.uid);
        }
        for cell in self.topo().cells().await? {
            for tablet_type in TabletType::SERVING {
                let want = expected.remove(&(cell.clone(), tablet_type)).unwrap_or_default();
                let have: BTreeSet<u32> = match self.topo().get_endpoints(&cell, keyspace, shard, tablet_type).await {
                    Ok(eps) => eps.entries.iter().map(|e| e.uid).collect(),
                    Err(e) if e.is_not_found() => BTreeSet::new(),
                    Err(e) => return Err(e.into()),
                };
                if want != have {
                    problems.push(format!(
                        "serving graph {} is stale: has {:?}, records say {:?}",
                        paths::endpoints(&cell, keyspace, shard, tablet_type),
                        have,
                        want
                    ));
                }
            }
        }
        Ok(())
    }

    async fn check_live(&self, record: &Shard, tablets: &[Tablet], problems: &mut Vec<String>) -> Result<(), WranglerError> {
        let master = record
            .master
            .as_ref()
            .and_then(|m| tablets.iter().find(|t| &t.alias == m && t.tablet_type == TabletType::Master));
        let timeout = self.rpc_timeout();
        let dialer = self.dialer();

        let pings = join_all(tablets.iter().map(|t| async move {
            let reply = rpc::ping(dialer, t, timeout).await;
            let status = match (&reply, t.tablet_type) {
                (Ok(_), ty) if ty != TabletType::Master => Some(rpc::replication_status(dialer, t, timeout).await),
                _ => None,
            };
            (t, reply, status)
        }))
        .await;

        for (tablet, reply, status) in pings {
            if let Err(e) = reply {
                problems.push(format!("tablet {} did not answer ping: {}", tablet.alias, e));
                continue;
            }
            let (Some(master), Some(status)) = (master, status) else {
                continue;
            };
            match status {
                Ok(s) if s.source_addr.as_deref() == Some(master.engine_addr().as_str()) => {}
                Ok(s) => problems.push(format!(
                    "tablet {} replicates from {}, master {} is at {}",
                    tablet.alias,
                    s.source_addr.unwrap_or_else(|| "nothing".to_string()),
                    master.alias,
                    master.engine_addr()
                )),
                Err(e) => problems.push(format!(
                    "tablet {} replication status unavailable: {}",
                    tablet.alias, e
                )),
            }
        }
        Ok(())
    }
}

fn check_master(keyspace: &str, shard: &str, record: &Shard, tablets: &[Tablet], problems: &mut Vec<String>) {
    let masters: Vec<&TabletAlias> = tablets
        .iter()
        .filter(|t| t.tablet_type == TabletType::Master)
        .map(|t| &t.alias)
        .collect();
    match (masters.as_slice(), &record.master) {
        ([], None) => problems.push(format!("shard {}/{} has no master", keyspace, shard)),
        ([], Some(m)) => problems.push(format!(
            "shard {}/{} records master {} but no tablet is a master",
            keyspace, shard, m
        )),
        ([only], recorded) => {
            if recorded.as_ref() != Some(*only) {
                problems.push(format!(
                    "shard {}/{} records master {:?} but tablet {} is the master",
                    keyspace,
                    shard,
                    recorded.as_ref().map(|a| a.to_string()),
                    only
                ));
            }
        }
        (many, _) => problems.push(format!(
            "shard {}/{} has {} masters: {}",
            keyspace,
            shard,
            many.len(),
            many.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(", ")
        )),
    }
}

fn check_membership(keyspace: &str, shard: &str, record: &Shard, tablets: &[Tablet], problems: &mut Vec<String>) {
    let recorded: BTreeSet<&TabletAlias> = record.replicas.iter().collect();
    for t in tablets.iter().filter(|t| t.is_in_replication_graph() && t.tablet_type != TabletType::Master) {
        if !recorded.contains(&t.alias) {
            problems.push(format!(
                "tablet {} is missing from shard {}/{} replicas",
                t.alias, keyspace, shard
            ));
        }
        match (&t.parent, &record.master) {
            (Some(p), Some(m)) if p != m => problems.push(format!(
                "tablet {} replicates from {}, shard master is {}",
                t.alias, p, m
            )),
            (None, Some(m)) => problems.push(format!("tablet {} has no parent, shard master is {}", t.alias, m)),
            _ => {}
        }
    }
    for alias in &record.replicas {
        match tablets.iter().find(|t| &t.alias == alias) {
            Some(t) if t.is_in_replication_graph() && t.tablet_type != TabletType::Master => {}
            Some(t) => problems.push(format!(
                "shard {}/{} lists {} as a replica but it is {}",
                keyspace, shard, alias, t.tablet_type
            )),
            None => problems.push(format!(
                "shard {}/{} lists {} as a replica but its record is not in the shard",
                keyspace, shard, alias
            )),
        }
    }
}
