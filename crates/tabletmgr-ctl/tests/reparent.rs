//! Shard reparenting against an in-process cluster.

mod common;

use std::time::Duration;

use common::{TestCluster, KEYSPACE};
use tabletmgr_agent::ActionArgs;
use tabletmgr_ctl::{Wrangler, WranglerError};
use tabletmgr_topo::{TabletAlias, TabletType};

const MASTER: u32 = 62344;
const CANDIDATE: u32 = 62044;
const SPARE_A: u32 = 41983;
const SPARE_B: u32 = 31981;

fn alias(uid: u32) -> TabletAlias {
    TestCluster::alias(uid)
}

async fn masters(c: &TestCluster) -> Vec<TabletAlias> {
    c.wr.topo()
        .tablets_in_shard(KEYSPACE, "0")
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.tablet_type == TabletType::Master)
        .map(|t| t.alias)
        .collect()
}

async fn tablet_type(c: &TestCluster, uid: u32) -> TabletType {
    c.wr.topo().get_tablet(&alias(uid)).await.unwrap().tablet_type
}

#[tokio::test]
async fn test_graceful_reparent_with_spares() {
    let mut c = TestCluster::new().await;
    c.init_shard(
        "0",
        MASTER,
        &[
            (CANDIDATE, TabletType::Replica),
            (SPARE_A, TabletType::Spare),
            (SPARE_B, TabletType::Spare),
        ],
    )
    .await;
    let pos = c.insert(MASTER, 1..=4).await;
    c.catch_up(CANDIDATE, pos).await;

    let report = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap();
    assert_eq!(report.master, Some(alias(CANDIDATE)));
    assert_eq!(report.old_master, Some(alias(MASTER)));
    assert_eq!(report.position, Some(pos));
    assert!(report.needs_reparent_tablet.is_empty());
    assert!(report.problems.is_empty(), "{:?}", report.problems);

    assert_eq!(masters(&c).await, vec![alias(CANDIDATE)]);
    assert_eq!(tablet_type(&c, MASTER).await, TabletType::Spare);
    assert_eq!(tablet_type(&c, SPARE_A).await, TabletType::Spare);
    assert_eq!(tablet_type(&c, SPARE_B).await, TabletType::Spare);

    let candidate = c.wr.topo().get_tablet(&alias(CANDIDATE)).await.unwrap();
    let resolved = c
        .wr
        .resolve(common::CELL, KEYSPACE, "0", TabletType::Master, "engine")
        .await
        .unwrap();
    assert_eq!(resolved, vec![candidate.engine_addr()]);

    // Spares stay in the replication graph but out of the serving set.
    let shard = c.wr.topo().get_shard(KEYSPACE, "0").await.unwrap();
    assert!(shard.replicas.contains(&alias(SPARE_A)));
    assert!(shard.replicas.contains(&alias(SPARE_B)));
    assert!(shard.replicas.contains(&alias(MASTER)));
    assert!(c
        .wr
        .resolve(common::CELL, KEYSPACE, "0", TabletType::Replica, "engine")
        .await
        .is_err());

    // Writes now flow from the new master to everyone else.
    assert!(c.engine(MASTER).is_read_only().await.unwrap());
    let pos = c.insert(CANDIDATE, 5..=6).await;
    for uid in [MASTER, SPARE_A, SPARE_B] {
        c.catch_up(uid, pos).await;
        assert_eq!(c.row_count(uid, common::DB).await, 6);
    }
    assert!(c.wr.validate_shard(KEYSPACE, "0", true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_forced_reparent_scraps_dead_master() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica), (SPARE_A, TabletType::Spare)])
        .await;
    let pos = c.insert(MASTER, 1..=3).await;
    c.catch_up(CANDIDATE, pos).await;
    c.catch_up(SPARE_A, pos).await;
    c.kill_agent(MASTER).await;

    let report = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), true)
        .await
        .unwrap();
    assert_eq!(report.scrapped, vec![alias(MASTER)]);
    assert_eq!(report.repointed, vec![alias(SPARE_A)]);
    assert!(report.problems.is_empty(), "{:?}", report.problems);
    assert_eq!(masters(&c).await, vec![alias(CANDIDATE)]);
    assert_eq!(tablet_type(&c, MASTER).await, TabletType::Scrap);

    let pos = c.insert(CANDIDATE, 4..=5).await;
    c.catch_up(SPARE_A, pos).await;
    assert_eq!(c.row_count(SPARE_A, common::DB).await, 5);
}

#[tokio::test]
async fn test_graceful_reparent_with_down_master_fails() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica)]).await;
    c.kill_agent(MASTER).await;
    let before = c.wr.topo().get_shard(KEYSPACE, "0").await.unwrap();

    let err = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::MasterUnreachable { .. }), "{}", err);
    let msg = err.to_string();
    assert!(msg.contains("dial failed"), "{}", msg);
    assert!(msg.contains("ValidateShard verification failed"), "{}", msg);

    assert_eq!(c.wr.topo().get_shard(KEYSPACE, "0").await.unwrap(), before);
    assert_eq!(tablet_type(&c, MASTER).await, TabletType::Master);
    assert_eq!(tablet_type(&c, CANDIDATE).await, TabletType::Replica);
}

#[tokio::test]
async fn test_scrapped_master_then_reparent() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica), (SPARE_A, TabletType::Spare)])
        .await;
    let pos = c.insert(MASTER, 1..=2).await;
    c.catch_up(CANDIDATE, pos).await;
    c.kill_agent(MASTER).await;

    c.wr.scrap_tablet(&alias(MASTER), true, true).await.unwrap();
    let report = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap();
    assert_eq!(report.old_master, None);
    assert_eq!(report.repointed, vec![alias(SPARE_A)]);
    assert_eq!(masters(&c).await, vec![alias(CANDIDATE)]);
    assert_eq!(tablet_type(&c, MASTER).await, TabletType::Scrap);
    assert!(!c.engine(CANDIDATE).is_read_only().await.unwrap());
}

#[tokio::test]
async fn test_lag_tablet_needs_reparent_tablet() {
    const LAG: u32 = 62016;
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica), (LAG, TabletType::Lag)])
        .await;
    let pos = c.insert(MASTER, 1..=3).await;
    c.catch_up(CANDIDATE, pos).await;

    let report = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap();
    assert_eq!(report.needs_reparent_tablet, vec![alias(LAG)]);
    assert!(
        report.problems.iter().any(|p| p.contains(&alias(LAG).to_string())),
        "{:?}",
        report.problems
    );
    let lag = c.wr.topo().get_tablet(&alias(LAG)).await.unwrap();
    assert_eq!(lag.parent, Some(alias(MASTER)));

    let new_pos = c.insert(CANDIDATE, 4..=5).await;
    let caught = c.wr.reparent_tablet(&alias(LAG)).await.unwrap();
    assert!(caught >= new_pos);
    let lag = c.wr.topo().get_tablet(&alias(LAG)).await.unwrap();
    assert_eq!(lag.parent, Some(alias(CANDIDATE)));
    assert_eq!(lag.tablet_type, TabletType::Lag);
    assert_eq!(c.row_count(LAG, common::DB).await, 5);
    assert!(c.wr.validate_shard(KEYSPACE, "0", false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reparent_rejects_master_and_busy_shard() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica)]).await;

    let err = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(MASTER), false)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::InvalidArgument(_)));

    let held = c.wr.lock_shard(KEYSPACE, "0", "test").await.unwrap();
    let impatient = Wrangler::new(c.store(), c.dialer.clone()).with_lock_timeout(Duration::from_millis(100));
    let err = impatient
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert!(err.to_string().contains("busy"));
    held.release().await.unwrap();
    assert_eq!(tablet_type(&c, CANDIDATE).await, TabletType::Replica);
}

#[tokio::test]
async fn test_busy_replica_does_not_leave_two_masters() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica), (SPARE_A, TabletType::Replica)])
        .await;
    let pos = c.insert(MASTER, 1..=3).await;
    c.catch_up(CANDIDATE, pos).await;

    // SPARE_A cannot run RestartSlave inside the action bound.
    let busy = c
        .wr
        .enqueue(&alias(SPARE_A), ActionArgs::Sleep { duration_ms: 4_000 })
        .await
        .unwrap();
    let hurried = Wrangler::new(c.store(), c.dialer.clone())
        .with_action_timeout(Duration::from_millis(1_500))
        .with_lock_timeout(Duration::from_secs(2))
        .with_rpc_timeout(Duration::from_millis(500));
    let report = hurried
        .reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap();
    assert_eq!(report.master, Some(alias(CANDIDATE)));
    assert_eq!(report.repointed, vec![alias(MASTER)]);
    assert_eq!(report.needs_reparent_tablet, vec![alias(SPARE_A)]);

    assert_eq!(masters(&c).await, vec![alias(CANDIDATE)]);
    let shard = c.wr.topo().get_shard(KEYSPACE, "0").await.unwrap();
    assert_eq!(shard.master, Some(alias(CANDIDATE)));
    assert_eq!(tablet_type(&c, MASTER).await, TabletType::Spare);
    assert!(!c.engine(CANDIDATE).is_read_only().await.unwrap());
    let problems = c.wr.validate_shard(KEYSPACE, "0", false).await.unwrap();
    assert!(problems.iter().all(|p| !p.contains("masters")), "{:?}", problems);

    c.wr.wait_for_action(&busy, Duration::from_secs(10)).await.unwrap();
    c.wr.reparent_tablet(&alias(SPARE_A)).await.unwrap();
    assert!(c.wr.validate_shard(KEYSPACE, "0", false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reparent_error_survives_lock_release() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(CANDIDATE, TabletType::Replica)]).await;
    let err = c
        .wr
        .reparent_shard(KEYSPACE, "0", &alias(SPARE_A), false)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::InvalidArgument(_)), "{}", err);
    // The lock was released, so the next reparent proceeds.
    c.wr.reparent_shard(KEYSPACE, "0", &alias(CANDIDATE), false)
        .await
        .unwrap();
}
