//! Tablet-level commands, action queue behaviour and validation.

mod common;

use std::time::{Duration, Instant};

use clap::Parser;
use common::{TestCluster, CELL, DB, KEYSPACE, TABLE};
use tabletmgr_agent::{ActionArgs, EngineError, HOOK_MISSING, INTERRUPTED_MESSAGE, PURGED_MESSAGE};
use tabletmgr_ctl::cli::Cli;
use tabletmgr_ctl::WranglerError;
use tabletmgr_topo::TabletType;

const MASTER: u32 = 62344;
const REPLICA: u32 = 62044;

async fn run_cli(c: &TestCluster, args: &[&str]) -> anyhow::Result<String> {
    let cli = Cli::try_parse_from(std::iter::once("tmctl").chain(args.iter().copied()))?;
    let mut out = Vec::new();
    cli.execute(&c.wr, CELL, &mut out).await?;
    Ok(String::from_utf8(out)?)
}

#[tokio::test]
async fn test_sanity_rows_and_read_only_toggle() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, Some("0"), TabletType::Master).await;
    c.start_agent(MASTER).await;
    c.insert(MASTER, 1..=4).await;
    assert_eq!(c.row_count(MASTER, DB).await, 4);

    c.wr.ping(&TestCluster::alias(MASTER)).await.unwrap();
    run_cli(&c, &["SetReadOnly", "62344"]).await.unwrap();
    assert!(c.engine(MASTER).is_read_only().await.unwrap());
    let err = c
        .engine(MASTER)
        .insert(DB, TABLE, common::rows([5]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ReadOnly));

    run_cli(&c, &["SetReadWrite", "test_nj-0000062344"]).await.unwrap();
    assert!(!c.engine(MASTER).is_read_only().await.unwrap());
    c.insert(MASTER, [5]).await;
    assert_eq!(c.row_count(MASTER, DB).await, 5);
}

#[tokio::test]
async fn test_execute_hook_missing_and_bad_name() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, None, TabletType::Idle).await;
    c.start_agent(MASTER).await;
    let alias = TestCluster::alias(MASTER);

    let result = c.wr.execute_hook(&alias, "nonexistent_hook", vec![]).await.unwrap();
    assert_eq!(result.exit_status, HOOK_MISSING);
    assert!(result.stdout.starts_with("Skipping missing hook"), "{}", result.stdout);
    assert_eq!(result.stderr, "");

    let err = c
        .wr
        .execute_hook(&alias, "/bin/ls", vec![])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("hook name cannot have a '/' in it"), "{}", err);

    let out = run_cli(&c, &["ExecuteHook", "62344", "nonexistent_hook", "flag", "k=v"])
        .await
        .unwrap();
    assert!(out.contains("\"ExitStatus\": -1"), "{}", out);
}

#[tokio::test]
async fn test_interrupted_action_reports_interrupt() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, None, TabletType::Idle).await;
    c.start_agent(MASTER).await;
    let alias = TestCluster::alias(MASTER);

    let handle = c
        .wr
        .enqueue(&alias, ActionArgs::Sleep { duration_ms: 30_000 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    c.interrupt_agent(MASTER).await;

    let err = c
        .wr
        .wait_for_action(&handle, Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        WranglerError::Interrupted { action, message } => {
            assert_eq!(action, "Sleep");
            assert_eq!(message, INTERRUPTED_MESSAGE);
        }
        other => panic!("expected interrupted, got {}", other),
    }
}

#[tokio::test]
async fn test_action_wait_times_out() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, None, TabletType::Idle).await;
    c.start_agent(MASTER).await;
    let alias = TestCluster::alias(MASTER);

    let handle = c
        .wr
        .enqueue(&alias, ActionArgs::Sleep { duration_ms: 2_000 })
        .await
        .unwrap();
    let started = Instant::now();
    let err = c
        .wr
        .wait_for_action(&handle, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{}", err);
    assert!(err.to_string().contains("deadline exceeded"));
    assert!(started.elapsed() < Duration::from_secs(1));

    // The action itself still completes.
    c.wr.wait_for_action(&handle, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn test_no_wait_then_wait_for_action() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, None, TabletType::Idle).await;
    c.start_agent(MASTER).await;

    let out = run_cli(&c, &["--no-wait", "Ping", "62344"]).await.unwrap();
    let path = out.trim();
    assert!(path.starts_with("/"), "{}", out);
    let out = run_cli(&c, &["WaitForAction", path]).await.unwrap();
    assert!(out.contains("Pong"), "{}", out);
}

#[tokio::test]
async fn test_purge_actions_fails_waiters() {
    let mut c = TestCluster::new().await;
    c.add_tablet(MASTER, None, TabletType::Idle).await;
    let alias = TestCluster::alias(MASTER);

    let mut handles = Vec::new();
    for _ in 0..3 {
        handles.push(c.wr.enqueue(&alias, ActionArgs::Ping).await.unwrap());
    }
    assert_eq!(c.wr.purge_tablet_actions(&alias).await.unwrap(), 3);
    let err = c
        .wr
        .wait_for_action(&handles[0], Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains(PURGED_MESSAGE), "{}", err);

    // A fresh agent finds an empty queue.
    c.start_agent(MASTER).await;
    c.wr.ping(&alias).await.unwrap();
}

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(REPLICA, TabletType::Replica)]).await;

    c.wr.rebuild_shard_graph(KEYSPACE, "0").await.unwrap();
    let before = c.wr.topo().get_endpoints(CELL, KEYSPACE, "0", TabletType::Replica).await.unwrap();
    let again = c.wr.rebuild_shard_graph(KEYSPACE, "0").await.unwrap();
    assert_eq!(again.changes, 0);
    let after = c.wr.topo().get_endpoints(CELL, KEYSPACE, "0", TabletType::Replica).await.unwrap();
    assert_eq!(before, after);

    c.wr.rebuild_keyspace_graph(KEYSPACE).await.unwrap();
    let srv = c.wr.topo().get_srv_keyspace(CELL, KEYSPACE).await.unwrap();
    assert_eq!(c.wr.rebuild_keyspace_graph(KEYSPACE).await.unwrap(), 0);
    assert_eq!(c.wr.topo().get_srv_keyspace(CELL, KEYSPACE).await.unwrap(), srv);
}

#[tokio::test]
async fn test_validate_with_ping_names_dead_agent() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(REPLICA, TabletType::Replica)]).await;
    assert!(c.wr.validate(true).await.unwrap().is_empty());
    run_cli(&c, &["ValidateShard", "--ping", "test_keyspace/0"]).await.unwrap();

    c.kill_agent(REPLICA).await;
    let problems = c.wr.validate_shard(KEYSPACE, "0", true).await.unwrap();
    assert_eq!(problems.len(), 1, "{:?}", problems);
    assert!(problems[0].contains(&TestCluster::alias(REPLICA).to_string()));

    let err = run_cli(&c, &["ValidateShard", "--ping", "test_keyspace/0"])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("validation failed"), "{}", err);
}

#[tokio::test]
async fn test_change_slave_type_and_list_idle() {
    let mut c = TestCluster::new().await;
    c.init_shard("0", MASTER, &[(REPLICA, TabletType::Replica)]).await;
    c.add_tablet(100, None, TabletType::Idle).await;

    let out = run_cli(&c, &["ListIdle"]).await.unwrap();
    assert!(out.contains("test_nj-0000000100"), "{}", out);

    let replica = TestCluster::alias(REPLICA);
    c.wr.change_slave_type(&replica, TabletType::Spare, false).await.unwrap();
    assert_eq!(
        c.wr.topo().get_tablet(&replica).await.unwrap().tablet_type,
        TabletType::Spare
    );
    assert!(c
        .wr
        .resolve(CELL, KEYSPACE, "0", TabletType::Replica, "engine")
        .await
        .is_err());
    let err = c
        .wr
        .change_slave_type(&TestCluster::alias(MASTER), TabletType::Replica, false)
        .await
        .unwrap_err();
    assert!(matches!(err, WranglerError::InvalidArgument(_)));

    let out = run_cli(&c, &["Resolve", "test_keyspace.0.master:agent"]).await.unwrap();
    let master = c.wr.topo().get_tablet(&TestCluster::alias(MASTER)).await.unwrap();
    assert_eq!(out.trim(), master.agent_addr());
}
