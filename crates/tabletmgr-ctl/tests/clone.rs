//! Snapshot, clone and restore flows against an in-process cluster.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use clap::Parser;
use common::{TestCluster, TestTablet, CELL, DB, KEYSPACE};
use proptest::prelude::*;
use tabletmgr_agent::snapshot::{decode_rows, SnapshotManifest};
use tabletmgr_agent::{AgentConfig, DataEngine, FetchOptions, MemoryEngine};
use tabletmgr_ctl::cli::Cli;
use tabletmgr_ctl::{CloneOptions, InitTablet, WranglerError};
use tabletmgr_topo::{KeyRange, KeyspaceId, TabletAlias, TabletState, TabletType};

const MASTER: u32 = 62344;
const REPLICA: u32 = 62044;
const DST: u32 = 41983;

/// Master plus one caught-up replica holding rows `1..=rows`.
async fn shard_with_rows(rows: u64) -> TestCluster {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(REPLICA, TabletType::Replica)]).await;
    let pos = c.insert(MASTER, 1..=rows).await;
    c.catch_up(REPLICA, pos).await;
    c
}

async fn idle_destination(c: &mut TestCluster, uid: u32) {
    c.add_tablet(uid, None, TabletType::Idle).await;
    c.start_agent(uid).await;
}

async fn keys(c: &TestCluster, uid: u32, db: &str) -> BTreeSet<KeyspaceId> {
    c.engine(uid)
        .read_rows(db, common::TABLE)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.key)
        .collect()
}

#[tokio::test]
async fn test_clone_replica_onto_idle_tablet() {
    let mut c = shard_with_rows(20).await;
    idle_destination(&mut c, DST).await;

    let reply = c
        .wr
        .clone_tablet(&TestCluster::alias(REPLICA), &TestCluster::alias(DST), CloneOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.rows, 20);
    assert!(reply.files >= 1);

    let dst = c.wr.topo().get_tablet(&TestCluster::alias(DST)).await.unwrap();
    assert_eq!(dst.tablet_type, TabletType::Replica);
    assert_eq!(dst.state, TabletState::Serving);
    assert_eq!(dst.keyspace, KEYSPACE);
    assert_eq!(dst.db_name, DB);
    assert_eq!(dst.parent, Some(TestCluster::alias(MASTER)));
    assert_eq!(keys(&c, DST, DB).await, keys(&c, MASTER, DB).await);

    // The source went back to replicating.
    let pos = c.insert(MASTER, 21..=25).await;
    c.catch_up(REPLICA, pos).await;
    c.catch_up(DST, pos).await;
    assert_eq!(c.row_count(DST, DB).await, 25);

    let shard = c.wr.topo().get_shard(KEYSPACE, "0").await.unwrap();
    assert!(shard.replicas.contains(&TestCluster::alias(DST)));
    assert!(c.wr.validate_shard(KEYSPACE, "0", true).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_clone_with_bad_snapshot_dir_scraps_destination() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, Some("0"), TabletType::Master).await;
    let mut config = c.agent_config();
    let blocker = c.dir.path().join("not_a_dir");
    std::fs::write(&blocker, b"file").unwrap();
    config.snapshot_root = blocker;
    c.start_agent_with(MASTER, config).await;
    c.insert(MASTER, 1..=3).await;
    idle_destination(&mut c, DST).await;

    let opts = CloneOptions {
        force: true,
        ..Default::default()
    };
    let err = c
        .wr
        .clone_tablet(&TestCluster::alias(MASTER), &TestCluster::alias(DST), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::Transfer(_)), "{}", err);
    assert!(err.to_string().contains("Cannot validate snapshot directory"), "{}", err);

    let dst = c.wr.topo().get_tablet(&TestCluster::alias(DST)).await.unwrap();
    assert_eq!(dst.tablet_type, TabletType::Scrap);
    // The source was never quiesced.
    assert!(!c.engine(MASTER).is_read_only().await.unwrap());
}

#[tokio::test]
async fn test_server_mode_snapshot_and_source_end() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, Some("0"), TabletType::Master).await;
    c.start_agent(MASTER).await;
    c.insert(MASTER, 1..=5).await;

    let cli = Cli::try_parse_from(["tmctl", "Snapshot", "--force", "--server-mode", "62344"]).unwrap();
    let mut out = Vec::new();
    cli.execute(&c.wr, CELL, &mut out).await.unwrap();
    let out = String::from_utf8(out).unwrap();
    assert!(out.contains("ReadOnly: true"), "{}", out);
    assert!(out.contains("OriginalType: master"), "{}", out);
    assert!(out.contains("SlaveStartRequired: false"), "{}", out);
    let manifest = out
        .lines()
        .find_map(|l| l.strip_prefix("Manifest: "))
        .unwrap()
        .to_string();
    let data = std::fs::read(c.agent_config().snapshot_root.join(&manifest)).unwrap();
    let parsed: SnapshotManifest = serde_json::from_slice(&data).unwrap();
    assert!(parsed.server_mode);
    assert_eq!(parsed.files.iter().map(|f| f.rows).sum::<usize>(), 5);

    let alias = TestCluster::alias(MASTER);
    let source = c.wr.topo().get_tablet(&alias).await.unwrap();
    assert_eq!(source.state, TabletState::SnapshotSource);
    assert!(c.engine(MASTER).is_read_only().await.unwrap());

    let cli = Cli::try_parse_from(["tmctl", "SnapshotSourceEnd", "62344", "master"]).unwrap();
    cli.execute(&c.wr, CELL, &mut Vec::new()).await.unwrap();
    let source = c.wr.topo().get_tablet(&alias).await.unwrap();
    assert_eq!(source.state, TabletState::Serving);
    assert_eq!(source.tablet_type, TabletType::Master);
    assert!(!c.engine(MASTER).is_read_only().await.unwrap());
}

#[tokio::test]
async fn test_fetch_retries_absorb_transient_failures() {
    let mut c = shard_with_rows(10).await;
    c.add_tablet(DST, None, TabletType::Idle).await;
    let mut config = c.agent_config();
    config.simulate_fetch_failures = 2;
    c.start_agent_with(DST, config).await;

    let opts = CloneOptions {
        fetch: FetchOptions {
            concurrency: 2,
            retry_count: 3,
        },
        ..Default::default()
    };
    let reply = c
        .wr
        .clone_tablet(&TestCluster::alias(REPLICA), &TestCluster::alias(DST), opts)
        .await
        .unwrap();
    assert_eq!(reply.rows, 10);
}

#[tokio::test]
async fn test_fetch_retries_exhausted_scraps_destination() {
    let mut c = shard_with_rows(10).await;
    c.add_tablet(DST, None, TabletType::Idle).await;
    let mut config = c.agent_config();
    config.simulate_fetch_failures = 2;
    c.start_agent_with(DST, config).await;

    let opts = CloneOptions {
        fetch: FetchOptions {
            concurrency: 2,
            retry_count: 1,
        },
        ..Default::default()
    };
    let err = c
        .wr
        .clone_tablet(&TestCluster::alias(REPLICA), &TestCluster::alias(DST), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::Transfer(_)), "{}", err);
    let dst = c.wr.topo().get_tablet(&TestCluster::alias(DST)).await.unwrap();
    assert_eq!(dst.tablet_type, TabletType::Scrap);

    // The source is untouched by the failed restore.
    let pos = c.insert(MASTER, [11]).await;
    c.catch_up(REPLICA, pos).await;
    assert_eq!(
        c.wr.topo().get_tablet(&TestCluster::alias(REPLICA)).await.unwrap().tablet_type,
        TabletType::Replica
    );
}

#[tokio::test]
async fn test_partial_clone_keeps_only_range() {
    let mut c = shard_with_rows(60).await;
    idle_destination(&mut c, DST).await;
    c.engine(DST).create_database(DB).await.unwrap();

    let range = KeyRange::from_hex("", "0000000000000028").unwrap();
    let reply = c
        .wr
        .partial_clone(
            &TestCluster::alias(REPLICA),
            &TestCluster::alias(DST),
            &range,
            None,
            CloneOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(reply.rows, 39);

    let dst = c.wr.topo().get_tablet(&TestCluster::alias(DST)).await.unwrap();
    assert_eq!(dst.tablet_type, TabletType::Spare);
    assert_eq!(dst.key_range, range);
    let got = keys(&c, DST, DB).await;
    assert_eq!(got.len(), 39);
    assert!(got.iter().all(|k| range.contains(k)));

    // Filtered replication only carries in-range rows.
    let pos = c.insert(MASTER, [0, 90]).await;
    c.catch_up(DST, pos).await;
    let got = keys(&c, DST, DB).await;
    assert!(got.contains(&KeyspaceId::from_u64(0)));
    assert!(!got.contains(&KeyspaceId::from_u64(90)));
}

#[tokio::test]
async fn test_partial_clone_needs_provisioned_database() {
    let mut c = shard_with_rows(5).await;
    idle_destination(&mut c, DST).await;

    let range = KeyRange::from_hex("", "0000000000000028").unwrap();
    let err = c
        .wr
        .partial_clone(
            &TestCluster::alias(REPLICA),
            &TestCluster::alias(DST),
            &range,
            None,
            CloneOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"), "{}", err);
    let dst = c.wr.topo().get_tablet(&TestCluster::alias(DST)).await.unwrap();
    assert_eq!(dst.tablet_type, TabletType::Scrap);
}

const MERGED: &str = "vt_merged";

/// Snapshots REPLICA split at 0x20 and brings up DST in the lower shard with
/// its own database name, running with `config`.
async fn merge_destination(c: &mut TestCluster, config: AgentConfig) -> TabletAlias {
    c.wr.multi_snapshot(
        &TestCluster::alias(REPLICA),
        "-0000000000000020-",
        vec![],
        None,
        2,
        false,
    )
    .await
    .unwrap();

    let alias = TestCluster::alias(DST);
    let mut req = InitTablet::idle(alias.clone(), "localhost", 20_000, 20_001)
        .assigned(KEYSPACE, "-0000000000000028", TabletType::Spare);
    req.db_name = Some(MERGED.to_string());
    let tablet = c.wr.init_tablet(req).await.unwrap();
    let engine: Arc<dyn DataEngine> = MemoryEngine::new(tablet.engine_addr(), c.directory.clone());
    c.directory.register(&engine);
    c.tablets.insert(
        DST,
        TestTablet {
            alias: alias.clone(),
            engine,
            agent: None,
        },
    );
    c.start_agent_with(DST, config).await;
    alias
}

#[tokio::test]
async fn test_multi_restore_keeps_keys_below_end() {
    let mut c = shard_with_rows(60).await;
    let config = c.agent_config();
    let alias = merge_destination(&mut c, config).await;

    let end = KeyspaceId::from_hex("0000000000000028").unwrap();
    let reply = c
        .wr
        .multi_restore(&alias, vec![TestCluster::alias(REPLICA)], end.clone(), FetchOptions::default())
        .await
        .unwrap();
    assert_eq!(reply.rows, 39);
    assert!(reply.position.is_none());

    let got = keys(&c, DST, MERGED).await;
    assert_eq!(got.len(), 39);
    assert!(got.iter().all(|k| *k < end));
    assert!(!c.engine(DST).database_exists(DB).await.unwrap());
}

#[tokio::test]
async fn test_multi_restore_fetch_exhausted_scraps_destination() {
    let mut c = shard_with_rows(60).await;
    let mut config = c.agent_config();
    config.simulate_fetch_failures = 2;
    let alias = merge_destination(&mut c, config).await;

    let fetch = FetchOptions {
        concurrency: 2,
        retry_count: 1,
    };
    let end = KeyspaceId::from_hex("0000000000000028").unwrap();
    let err = c
        .wr
        .multi_restore(&alias, vec![TestCluster::alias(REPLICA)], end, fetch)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("simulated fetch failure"), "{}", err);
    assert_eq!(c.wr.topo().get_tablet(&alias).await.unwrap().tablet_type, TabletType::Scrap);
    assert!(!c.engine(DST).database_exists(MERGED).await.unwrap());
}

#[tokio::test]
async fn test_multi_restore_loads_nothing_when_a_later_source_fails() {
    let mut c = shard_with_rows(60).await;
    let config = c.agent_config();
    let alias = merge_destination(&mut c, config).await;

    // MASTER never took a multi-snapshot, so its index is missing.
    let sources = vec![TestCluster::alias(REPLICA), TestCluster::alias(MASTER)];
    let end = KeyspaceId::from_hex("0000000000000028").unwrap();
    c.wr.multi_restore(&alias, sources, end, FetchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(c.wr.topo().get_tablet(&alias).await.unwrap().tablet_type, TabletType::Scrap);
    assert!(!c.engine(DST).database_exists(MERGED).await.unwrap());
}

fn split_spec(splits: &BTreeSet<u64>) -> String {
    let inner: Vec<String> = splits.iter().map(|s| format!("{:016x}", s)).collect();
    format!("-{}-", inner.join("-"))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn prop_multi_snapshot_partitions_rows(
        ids in prop::collection::btree_set(0u64..200, 1..40),
        splits in prop::collection::btree_set(1u64..200, 0..4),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut c = TestCluster::new().await;
            c.add_tablet(MASTER, Some("0"), TabletType::Master).await;
            c.start_agent(MASTER).await;
            c.insert(MASTER, ids.iter().copied()).await;

            let reply = c
                .wr
                .multi_snapshot(&TestCluster::alias(MASTER), &split_spec(&splits), vec![], None, 2, true)
                .await
                .unwrap();
            assert_eq!(reply.manifest_paths.len(), splits.len() + 1);

            let root = c.agent_config().snapshot_root;
            let mut seen = Vec::new();
            let mut ranges = Vec::new();
            for path in &reply.manifest_paths {
                let manifest: SnapshotManifest =
                    serde_json::from_slice(&std::fs::read(root.join(path)).unwrap()).unwrap();
                for file in &manifest.files {
                    let rows = decode_rows(&std::fs::read(root.join(&file.path)).unwrap()).unwrap();
                    assert_eq!(rows.len(), file.rows);
                    for row in rows {
                        assert!(manifest.key_range.contains(&row.key));
                        seen.push(row.key);
                    }
                }
                ranges.push(manifest.key_range);
            }

            assert!(ranges[0].start.is_empty());
            assert!(ranges[ranges.len() - 1].end.is_empty());
            for w in ranges.windows(2) {
                assert_eq!(w[0].end, w[1].start);
            }
            let expected: Vec<KeyspaceId> = ids.iter().map(|id| KeyspaceId::from_u64(*id)).collect();
            seen.sort();
            assert_eq!(seen, expected);

            // The source is writable again afterwards.
            assert!(!c.engine(MASTER).is_read_only().await.unwrap());
        });
    }
}
