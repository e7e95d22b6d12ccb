//! Shard reparenting.
//!
//! The shard lock is held from the first check to the final validation.
//! Graceful mode stops writes on the current master, promotes the candidate
//! once it has caught up and repoints every live replica. Forced mode skips
//! demotion and is meant for a dead master; a former master it cannot
//! repoint is scrapped. Once the candidate is promoted the shard record is
//! always committed: replicas that fail to repoint are reported for
//! `ReparentTablet`, and a graceful reparent records the old master as a
//! spare even when it cannot be repointed.

use serde::Serialize;
use tabletmgr_agent::{rpc, ActionArgs, ActionReply, Position};
use tabletmgr_topo::{Tablet, TabletAlias, TabletType};
use tracing::{info, warn};

use crate::error::WranglerError;
use crate::wrangler::{unexpected, Wrangler};

/// Outcome of a shard reparent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReparentReport {
    /// New master.
    pub master: Option<TabletAlias>,
    /// Master before the reparent, when one was live.
    pub old_master: Option<TabletAlias>,
    /// Position the candidate caught up to before promotion.
    pub position: Option<Position>,
    /// Tablets now replicating from the new master.
    pub repointed: Vec<TabletAlias>,
    /// Tablets left behind; each needs `ReparentTablet` once reachable.
    pub needs_reparent_tablet: Vec<TabletAlias>,
    /// Unreachable former masters scrapped by a forced reparent.
    pub scrapped: Vec<TabletAlias>,
    /// Validation problems found after the reparent.
    pub problems: Vec<String>,
}

impl Wrangler {
    /// Makes `candidate` the master of a shard.
    pub async fn reparent_shard(
        &self,
        keyspace: &str,
        shard: &str,
        candidate: &TabletAlias,
        force: bool,
    ) -> Result<ReparentReport, WranglerError> {
        let lock = self.lock_shard(keyspace, shard, "ReparentShard").await?;
        let result = self.reparent_locked(keyspace, shard, candidate, force).await;
        if let Err(e) = &result {
            warn!(keyspace, shard, candidate = %candidate, state = "reparenting-failed", error = %e, "reparent failed");
        }
        if let Err(e) = lock.release().await {
            warn!(keyspace, shard, error = %e, "could not release shard lock");
        }
        result
    }

    async fn reparent_locked(
        &self,
        keyspace: &str,
        shard: &str,
        candidate: &TabletAlias,
        force: bool,
    ) -> Result<ReparentReport, WranglerError> {
        let record = self.topo().get_shard(keyspace, shard).await?;
        let tablets = self.topo().tablets_in_shard(keyspace, shard).await?;
        let elect = tablets.iter().find(|t| &t.alias == candidate).ok_or_else(|| {
            WranglerError::InvalidArgument(format!("tablet {} is not in shard {}/{}", candidate, keyspace, shard))
        })?;
        if !matches!(elect.tablet_type, TabletType::Replica | TabletType::Spare) {
            return Err(WranglerError::InvalidArgument(format!(
                "candidate {} is {}; it must be a replica or spare",
                candidate, elect.tablet_type
            )));
        }

        // A master record that was scrapped or removed is no master at all.
        let old_master = record
            .master
            .as_ref()
            .and_then(|m| tablets.iter().find(|t| &t.alias == m && t.tablet_type == TabletType::Master));
        info!(
            keyspace,
            shard,
            state = "stable",
            master = ?old_master.map(|t| t.alias.to_string()),
            "shard before reparent"
        );

        let mut report = ReparentReport {
            old_master: old_master.map(|t| t.alias.clone()),
            ..Default::default()
        };
        let wait_timeout_ms = self.action_timeout().as_millis() as u64;

        match old_master {
            Some(master) if !force => {
                self.check_master_reachable(master).await?;
                info!(keyspace, shard, state = "reparenting", master = %master.alias, candidate = %candidate, "demoting master");
                let position = self.demote_master(&master.alias).await?;
                report.position = Some(position);
                let promote = ActionArgs::PromoteSlave {
                    wait_position: Some(position),
                    wait_timeout_ms,
                };
                if let Err(e) = self.run(candidate, promote).await {
                    warn!(master = %master.alias, error = %e, "promotion failed, restoring writes on old master");
                    if let Err(rollback) = self.set_read_write(&master.alias).await {
                        warn!(master = %master.alias, error = %rollback, "could not restore old master");
                    }
                    return Err(e);
                }
            }
            _ => {
                info!(keyspace, shard, state = "reparenting", candidate = %candidate, force, "promoting without demotion");
                let promote = ActionArgs::PromoteSlave {
                    wait_position: None,
                    wait_timeout_ms,
                };
                match self.run(candidate, promote).await? {
                    ActionReply::Position(p) => report.position = Some(p),
                    ActionReply::None => {}
                    other => return Err(unexpected("PromoteSlave", other)),
                }
            }
        }

        // Former masters first.
        let mut others: Vec<&Tablet> = tablets
            .iter()
            .filter(|t| &t.alias != candidate && t.is_in_replication_graph())
            .collect();
        others.sort_by_key(|t| t.tablet_type != TabletType::Master);

        for tablet in others {
            let live = self.topo().get_agent_info(&tablet.alias).await?.is_some();
            let outcome = if tablet.tablet_type == TabletType::Lag || !live {
                None
            } else {
                let restart = ActionArgs::RestartSlave {
                    master: candidate.clone(),
                };
                match self.run(&tablet.alias, restart).await {
                    Ok(_) => Some(()),
                    Err(e) => {
                        warn!(tablet = %tablet.alias, error = %e, "could not repoint tablet");
                        None
                    }
                }
            };
            match outcome {
                Some(()) => report.repointed.push(tablet.alias.clone()),
                None if force && tablet.tablet_type == TabletType::Master => {
                    self.scrap_record(&tablet.alias).await?;
                    report.scrapped.push(tablet.alias.clone());
                }
                None => {
                    if tablet.tablet_type == TabletType::Master {
                        self.demote_record(&tablet.alias, candidate).await?;
                    }
                    warn!(tablet = %tablet.alias, tablet_type = %tablet.tablet_type, "not repointing tablet; run ReparentTablet on it");
                    report.needs_reparent_tablet.push(tablet.alias.clone());
                }
            }
        }

        self.set_shard_master(keyspace, shard, candidate).await?;
        self.rebuild_shard_graph_locked(keyspace, shard).await?;
        report.master = Some(candidate.clone());
        report.problems = self.validate_shard(keyspace, shard, false).await?;
        for problem in &report.problems {
            warn!(keyspace, shard, problem = %problem, "post-reparent validation");
        }
        info!(keyspace, shard, state = "stable", master = %candidate, repointed = report.repointed.len(), "reparent finished");
        Ok(report)
    }

    /// Repoints one replica at its shard's current master, waiting for it to
    /// catch up. Used for tablets a shard reparent left behind.
    pub async fn reparent_tablet(&self, alias: &TabletAlias) -> Result<Position, WranglerError> {
        let tablet = self.topo().get_tablet(alias).await?;
        if !tablet.is_in_replication_graph() || tablet.tablet_type == TabletType::Master {
            return Err(WranglerError::InvalidArgument(format!(
                "tablet {} is {}; only replicas can be reparented",
                alias, tablet.tablet_type
            )));
        }
        let shard = self.topo().get_shard(&tablet.keyspace, &tablet.shard).await?;
        let master = shard.master.ok_or_else(|| {
            WranglerError::InvalidArgument(format!("shard {}/{} has no master", tablet.keyspace, tablet.shard))
        })?;
        let args = ActionArgs::ReparentPosition {
            master: master.clone(),
            wait_timeout_ms: self.action_timeout().as_millis() as u64,
        };
        let position = match self.run(alias, args).await? {
            ActionReply::Position(p) => p,
            other => return Err(unexpected("ReparentPosition", other)),
        };
        info!(tablet = %alias, master = %master, position, "tablet reparented");
        Ok(position)
    }

    async fn check_master_reachable(&self, master: &Tablet) -> Result<(), WranglerError> {
        rpc::ping(self.dialer(), master, self.rpc_timeout())
            .await
            .map(|_| ())
            .map_err(|e| WranglerError::MasterUnreachable {
                master: master.alias.to_string(),
                msg: format!("ValidateShard verification failed: {}", e),
            })
    }

    async fn scrap_record(&self, alias: &TabletAlias) -> Result<(), WranglerError> {
        warn!(tablet = %alias, "scrapping unreachable former master");
        self.topo()
            .update_tablet(alias, |t| {
                t.tablet_type = TabletType::Scrap;
                t.parent = None;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Records a demoted master that did not answer RestartSlave as a spare
    /// of the new master.
    async fn demote_record(&self, alias: &TabletAlias, master: &TabletAlias) -> Result<(), WranglerError> {
        warn!(tablet = %alias, master = %master, "recording unrepointed former master as spare");
        self.topo()
            .update_tablet(alias, |t| {
                if t.tablet_type == TabletType::Master {
                    t.tablet_type = TabletType::Spare;
                }
                t.parent = Some(master.clone());
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn set_shard_master(&self, keyspace: &str, shard: &str, master: &TabletAlias) -> Result<(), WranglerError> {
        let (mut record, version) = self.topo().get_shard_versioned(keyspace, shard).await?;
        record.master = Some(master.clone());
        record.replicas.retain(|r| r != master);
        self.topo().put_shard(keyspace, shard, &record, Some(version)).await?;
        Ok(())
    }
}
