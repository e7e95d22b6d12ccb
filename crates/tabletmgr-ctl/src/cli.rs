//! `tmctl` command-line surface.

use crate::clone::CloneOptions;
use crate::config::CtlConfig;
use crate::error::WranglerError;
use crate::wrangler::{InitTablet, Wrangler};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tabletmgr_agent::{ActionArgs, ActionHandle, FetchOptions, SnapshotReply, TcpDialer};
use tabletmgr_topo::{KeyRange, KeyspaceId, RemoteTopoClient, TabletAlias, TabletType, TopoStore};

/// Operator control surface.
#[derive(Debug, Parser)]
#[command(name = "tmctl")]
#[command(about = "tabletmgr control CLI", long_about = None)]
pub struct Cli {
    /// Coordination store address.
    #[arg(long, env = "TM_TOPO")]
    pub topo: Option<String>,

    /// Cell for tablet arguments given as a bare uid.
    #[arg(long, env = "TM_CELL")]
    pub cell: Option<String>,

    /// Bound on waiting for an action (e.g. `30s`, `500ms`, `5m`).
    #[arg(long, value_parser = parse_duration)]
    pub wait_time: Option<Duration>,

    /// Bound on waiting for a shard or keyspace lock.
    #[arg(long, value_parser = parse_duration)]
    pub lock_timeout: Option<Duration>,

    /// Queue tablet actions and print their paths without waiting.
    #[arg(long)]
    pub no_wait: bool,

    /// Config file (TOML or JSON).
    #[arg(long, env = "TM_CTL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Command to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Fetch knobs shared by the restore commands.
#[derive(Debug, Clone, Args)]
pub struct FetchArgs {
    /// Files fetched at once.
    #[arg(long, default_value = "3")]
    pub fetch_concurrency: usize,
    /// Retries per file after the first attempt.
    #[arg(long, default_value = "3")]
    pub fetch_retry_count: u32,
}

impl From<&FetchArgs> for FetchOptions {
    fn from(a: &FetchArgs) -> Self {
        FetchOptions {
            concurrency: a.fetch_concurrency,
            retry_count: a.fetch_retry_count,
        }
    }
}

/// Commands, named as operators type them.
#[derive(Debug, Subcommand)]
#[command(rename_all = "PascalCase")]
pub enum Command {
    /// Creates a keyspace.
    CreateKeyspace {
        keyspace: String,
        #[arg(long)]
        sharding_column: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Creates a tablet record.
    InitTablet {
        tablet: String,
        hostname: String,
        port: u16,
        engine_port: u16,
        keyspace: Option<String>,
        shard: Option<String>,
        tablet_type: Option<TabletType>,
        #[arg(long)]
        parent: Option<String>,
        #[arg(long)]
        db_name_override: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Rebuilds a shard's serving graph (`keyspace/shard`).
    RebuildShardGraph { shard: String },
    /// Rebuilds every shard of a keyspace.
    RebuildKeyspaceGraph { keyspace: String },
    /// Validates the whole topology.
    Validate {
        #[arg(long)]
        ping: bool,
    },
    /// Validates one keyspace.
    ValidateKeyspace {
        keyspace: String,
        #[arg(long)]
        ping: bool,
    },
    /// Validates one shard (`keyspace/shard`).
    ValidateShard {
        shard: String,
        #[arg(long)]
        ping: bool,
    },
    /// Round trip through a tablet's action queue.
    Ping { tablet: String },
    /// Makes a tablet's engine read-only.
    SetReadOnly { tablet: String },
    /// Makes a tablet's engine read-write.
    SetReadWrite { tablet: String },
    /// Makes a master read-only and prints its position.
    DemoteMaster { tablet: String },
    /// Scraps a tablet.
    ScrapTablet {
        tablet: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        skip_rebuild: bool,
    },
    /// Changes a non-master tablet's type.
    ChangeSlaveType {
        tablet: String,
        tablet_type: TabletType,
        #[arg(long)]
        force: bool,
    },
    /// Makes a tablet the master of its shard (`keyspace/shard`).
    ReparentShard {
        shard: String,
        tablet: String,
        #[arg(long)]
        force: bool,
    },
    /// Repoints one replica at its shard master.
    ReparentTablet { tablet: String },
    /// Exports a tablet's database.
    Snapshot {
        tablet: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        server_mode: bool,
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },
    /// Returns a server-mode snapshot source to its original type.
    SnapshotSourceEnd {
        tablet: String,
        original_type: TabletType,
        #[arg(long)]
        slave_start_required: bool,
        #[arg(long)]
        read_write: bool,
    },
    /// Restores a snapshot onto an idle tablet.
    Restore {
        source: String,
        dst: String,
        #[arg(long)]
        manifest: Option<String>,
        #[arg(long)]
        dont_wait_for_slave_start: bool,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Snapshot plus restore onto an idle tablet.
    Clone {
        source: String,
        dst: String,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        server_mode: bool,
        #[arg(long, default_value = "4")]
        concurrency: usize,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Exports one key range (hex bounds, empty for open).
    PartialSnapshot {
        tablet: String,
        start: String,
        end: String,
        #[arg(long)]
        key_column: Option<String>,
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },
    /// Partial snapshot plus restore onto a pre-provisioned idle tablet.
    PartialClone {
        source: String,
        dst: String,
        start: String,
        end: String,
        #[arg(long)]
        key_column: Option<String>,
        #[arg(long, default_value = "4")]
        concurrency: usize,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Exports one unit per range of a split spec.
    MultiSnapshot {
        tablet: String,
        #[arg(long, default_value = "-")]
        spec: String,
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        #[arg(long)]
        key_column: Option<String>,
        #[arg(long, default_value = "4")]
        concurrency: usize,
        #[arg(long)]
        force: bool,
    },
    /// Merges multi-snapshots into a tablet.
    MultiRestore {
        dst: String,
        #[arg(required = true)]
        sources: Vec<String>,
        #[arg(long)]
        end: Option<String>,
        #[command(flatten)]
        fetch: FetchArgs,
    },
    /// Runs a hook on a tablet's host.
    ExecuteHook {
        tablet: String,
        hook: String,
        params: Vec<String>,
    },
    /// Holds a tablet's queue.
    Sleep {
        tablet: String,
        #[arg(value_parser = parse_duration)]
        duration: Duration,
    },
    /// Prints addresses serving `keyspace.shard.type[:port]`.
    Resolve { target: String },
    /// Lists idle tablets of a cell.
    ListIdle { cell: Option<String> },
    /// Empties a tablet's action queue or a lock directory.
    PurgeActions { target: String },
    /// Waits for a queued action and prints its result.
    WaitForAction { path: String },
}

impl Cli {
    /// Connects to the coordination store and runs the command.
    pub async fn run(self) -> Result<()> {
        let config = self.config()?;
        let store: Arc<dyn TopoStore> = Arc::new(
            RemoteTopoClient::connect(&config.topo)
                .await
                .with_context(|| format!("connecting to coordination store {}", config.topo))?,
        );
        let dialer = Arc::new(TcpDialer::new(config.auth_token.clone()));
        let wr = Wrangler::new(store.clone(), dialer)
            .with_action_timeout(config.wait_time())
            .with_lock_timeout(config.lock_timeout())
            .with_rpc_timeout(config.rpc_timeout());
        let result = self.execute(&wr, &config.cell, &mut std::io::stdout()).await;
        if let Err(e) = store.close().await {
            tracing::debug!("closing coordination store session: {}", e);
        }
        result
    }

    /// File values overridden by flags.
    pub fn config(&self) -> Result<CtlConfig> {
        let mut config = match &self.config {
            Some(path) => CtlConfig::from_file(path)?,
            None => CtlConfig::default(),
        };
        if let Some(topo) = &self.topo {
            config.topo = topo.clone();
        }
        if let Some(cell) = &self.cell {
            config.cell = cell.clone();
        }
        if let Some(d) = self.wait_time {
            config.wait_time_ms = d.as_millis() as u64;
        }
        if let Some(d) = self.lock_timeout {
            config.lock_timeout_ms = d.as_millis() as u64;
        }
        Ok(config)
    }

    /// Runs the command against `wr`, writing results to `out`.
    pub async fn execute(&self, wr: &Wrangler, cell: &str, out: &mut dyn Write) -> Result<()> {
        let alias = |s: &str| parse_alias(s, cell);
        match &self.command {
            Command::CreateKeyspace {
                keyspace,
                sharding_column,
                force,
            } => wr.create_keyspace(keyspace, sharding_column.clone(), *force).await?,
            Command::InitTablet {
                tablet,
                hostname,
                port,
                engine_port,
                keyspace,
                shard,
                tablet_type,
                parent,
                db_name_override,
                force,
            } => {
                let req = InitTablet {
                    alias: alias(tablet)?,
                    hostname: hostname.clone(),
                    port: *port,
                    engine_port: *engine_port,
                    keyspace: keyspace.clone().unwrap_or_default(),
                    shard: shard.clone().unwrap_or_default(),
                    tablet_type: tablet_type.unwrap_or(TabletType::Idle),
                    db_name: db_name_override.clone(),
                    parent: parent.as_deref().map(alias).transpose()?,
                    force: *force,
                };
                let tablet = wr.init_tablet(req).await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&tablet)?)?;
            }
            Command::RebuildShardGraph { shard } => {
                let (ks, shard) = split_shard(shard)?;
                let report = wr.rebuild_shard_graph(ks, shard).await?;
                writeln!(out, "{} nodes changed", report.changes)?;
            }
            Command::RebuildKeyspaceGraph { keyspace } => {
                let changes = wr.rebuild_keyspace_graph(keyspace).await?;
                writeln!(out, "{} nodes changed", changes)?;
            }
            Command::Validate { ping } => report_problems(wr.validate(*ping).await?, out)?,
            Command::ValidateKeyspace { keyspace, ping } => {
                report_problems(wr.validate_keyspace(keyspace, *ping).await?, out)?
            }
            Command::ValidateShard { shard, ping } => {
                let (ks, shard) = split_shard(shard)?;
                report_problems(wr.validate_shard(ks, shard, *ping).await?, out)?
            }
            Command::Ping { tablet } => self.action(wr, &alias(tablet)?, ActionArgs::Ping, out).await?,
            Command::SetReadOnly { tablet } => {
                self.action(wr, &alias(tablet)?, ActionArgs::SetReadOnly, out).await?
            }
            Command::SetReadWrite { tablet } => {
                self.action(wr, &alias(tablet)?, ActionArgs::SetReadWrite, out).await?
            }
            Command::DemoteMaster { tablet } => {
                self.action(wr, &alias(tablet)?, ActionArgs::DemoteMaster, out).await?
            }
            Command::ScrapTablet {
                tablet,
                force,
                skip_rebuild,
            } => wr.scrap_tablet(&alias(tablet)?, *force, *skip_rebuild).await?,
            Command::ChangeSlaveType {
                tablet,
                tablet_type,
                force,
            } => wr.change_slave_type(&alias(tablet)?, *tablet_type, *force).await?,
            Command::ReparentShard { shard, tablet, force } => {
                let (ks, shard) = split_shard(shard)?;
                let report = wr.reparent_shard(ks, shard, &alias(tablet)?, *force).await?;
                for t in &report.needs_reparent_tablet {
                    writeln!(out, "tablet {} was not reparented; run ReparentTablet {}", t, t)?;
                }
                for p in &report.problems {
                    writeln!(out, "problem: {}", p)?;
                }
                writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            }
            Command::ReparentTablet { tablet } => {
                let position = wr.reparent_tablet(&alias(tablet)?).await?;
                writeln!(out, "Position: {}", position)?;
            }
            Command::Snapshot {
                tablet,
                force,
                server_mode,
                concurrency,
            } => {
                let reply = wr.snapshot(&alias(tablet)?, *concurrency, *server_mode, *force).await?;
                write!(out, "{}", snapshot_block(&reply))?;
            }
            Command::SnapshotSourceEnd {
                tablet,
                original_type,
                slave_start_required,
                read_write,
            } => {
                let args = ActionArgs::SnapshotSourceEnd {
                    original_type: *original_type,
                    slave_start_required: *slave_start_required,
                    read_only: !*read_write,
                };
                self.action(wr, &alias(tablet)?, args, out).await?
            }
            Command::Restore {
                source,
                dst,
                manifest,
                dont_wait_for_slave_start,
                fetch,
            } => {
                let reply = wr
                    .restore(
                        &alias(source)?,
                        manifest.as_deref(),
                        &alias(dst)?,
                        fetch.into(),
                        *dont_wait_for_slave_start,
                    )
                    .await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
            }
            Command::Clone {
                source,
                dst,
                force,
                server_mode,
                concurrency,
                fetch,
            } => {
                let opts = CloneOptions {
                    concurrency: *concurrency,
                    server_mode: *server_mode,
                    force: *force,
                    fetch: fetch.into(),
                };
                let reply = wr.clone_tablet(&alias(source)?, &alias(dst)?, opts).await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
            }
            Command::PartialSnapshot {
                tablet,
                start,
                end,
                key_column,
                concurrency,
            } => {
                let range = KeyRange::from_hex(start, end)?;
                let reply = wr
                    .partial_snapshot(&alias(tablet)?, &range, key_column.as_deref(), *concurrency)
                    .await?;
                write!(out, "{}", snapshot_block(&reply))?;
            }
            Command::PartialClone {
                source,
                dst,
                start,
                end,
                key_column,
                concurrency,
                fetch,
            } => {
                let range = KeyRange::from_hex(start, end)?;
                let opts = CloneOptions {
                    concurrency: *concurrency,
                    fetch: fetch.into(),
                    ..Default::default()
                };
                let reply = wr
                    .partial_clone(&alias(source)?, &alias(dst)?, &range, key_column.as_deref(), opts)
                    .await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
            }
            Command::MultiSnapshot {
                tablet,
                spec,
                tables,
                key_column,
                concurrency,
                force,
            } => {
                let reply = wr
                    .multi_snapshot(
                        &alias(tablet)?,
                        spec,
                        tables.clone(),
                        key_column.as_deref(),
                        *concurrency,
                        *force,
                    )
                    .await?;
                writeln!(out, "Index: {}", reply.index_path)?;
                for path in &reply.manifest_paths {
                    writeln!(out, "Manifest: {}", path)?;
                }
            }
            Command::MultiRestore {
                dst,
                sources,
                end,
                fetch,
            } => {
                let sources = sources.iter().map(|s| alias(s)).collect::<Result<Vec<_>>>()?;
                let end = KeyspaceId::from_hex(end.as_deref().unwrap_or_default())?;
                let reply = wr.multi_restore(&alias(dst)?, sources, end, fetch.into()).await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
            }
            Command::ExecuteHook { tablet, hook, params } => {
                let args = ActionArgs::ExecuteHook {
                    name: hook.clone(),
                    params: params.clone(),
                };
                self.action(wr, &alias(tablet)?, args, out).await?
            }
            Command::Sleep { tablet, duration } => {
                let args = ActionArgs::Sleep {
                    duration_ms: duration.as_millis() as u64,
                };
                self.action(wr, &alias(tablet)?, args, out).await?
            }
            Command::Resolve { target } => {
                let (ks, shard, tablet_type, port) = parse_resolve_target(target)?;
                for addr in wr.resolve(cell, ks, shard, tablet_type, port).await? {
                    writeln!(out, "{}", addr)?;
                }
            }
            Command::ListIdle { cell: listed } => {
                for tablet in wr.list_idle(listed.as_deref().unwrap_or(cell)).await? {
                    writeln!(out, "{} {}", tablet.alias, tablet.agent_addr())?;
                }
            }
            Command::PurgeActions { target } => {
                let purged = if target.starts_with('/') {
                    wr.purge_actions(target).await?
                } else {
                    wr.purge_tablet_actions(&alias(target)?).await?
                };
                writeln!(out, "purged {} actions", purged)?;
            }
            Command::WaitForAction { path } => {
                let handle = ActionHandle::from_path(path)?;
                let reply = wr.wait_for_action(&handle, wr.action_timeout()).await?;
                writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
            }
        }
        Ok(())
    }

    async fn action(&self, wr: &Wrangler, alias: &TabletAlias, args: ActionArgs, out: &mut dyn Write) -> Result<()> {
        if self.no_wait {
            let handle = wr.enqueue(alias, args).await?;
            writeln!(out, "{}", handle.path)?;
            return Ok(());
        }
        let reply = wr.run(alias, args).await?;
        writeln!(out, "{}", serde_json::to_string_pretty(&reply)?)?;
        Ok(())
    }
}

/// Key: value lines describing a snapshot.
pub fn snapshot_block(reply: &SnapshotReply) -> String {
    format!(
        "Manifest: {}\nParentPath: {}\nSlaveStartRequired: {}\nReadOnly: {}\nOriginalType: {}\n",
        reply.manifest_path, reply.parent_path, reply.slave_start_required, reply.read_only, reply.original_type
    )
}

fn report_problems(problems: Vec<String>, out: &mut dyn Write) -> Result<()> {
    if problems.is_empty() {
        return Ok(());
    }
    for p in &problems {
        writeln!(out, "{}", p)?;
    }
    Err(WranglerError::Validation(problems).into())
}

/// `cell-uid`, or a bare uid in `cell`.
pub fn parse_alias(s: &str, cell: &str) -> Result<TabletAlias> {
    if let Ok(uid) = s.parse::<u32>() {
        return Ok(TabletAlias::new(cell, uid));
    }
    s.parse::<TabletAlias>()
        .with_context(|| format!("invalid tablet alias {:?}", s))
}

/// `keyspace/shard`.
pub fn split_shard(s: &str) -> Result<(&str, &str)> {
    match s.split_once('/') {
        Some((ks, shard)) if !ks.is_empty() && !shard.is_empty() => Ok((ks, shard)),
        _ => anyhow::bail!("expected keyspace/shard, got {:?}", s),
    }
}

/// `keyspace.shard.type[:port]`; the port name defaults to `engine`.
pub fn parse_resolve_target(s: &str) -> Result<(&str, &str, TabletType, &str)> {
    let (addr, port) = s.split_once(':').unwrap_or((s, "engine"));
    let mut parts = addr.splitn(3, '.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(ks), Some(shard), Some(ty)) if !ks.is_empty() && !shard.is_empty() => {
            Ok((ks, shard, ty.parse::<TabletType>()?, port))
        }
        _ => anyhow::bail!("expected keyspace.shard.type[:port], got {:?}", s),
    }
}

/// `500ms`, `30s`, `5m`, `1h`, or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().map_err(|_| format!("invalid duration {:?}", s))?;
    match unit {
        "" | "s" => Ok(Duration::from_secs(n)),
        "ms" => Ok(Duration::from_millis(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration unit {:?} in {:?}", unit, s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_parse_resolve_target() {
        let (ks, shard, ty, port) = parse_resolve_target("test_keyspace.-80.master").unwrap();
        assert_eq!((ks, shard, ty, port), ("test_keyspace", "-80", TabletType::Master, "engine"));
        let (_, _, ty, port) = parse_resolve_target("ks.0.replica:agent").unwrap();
        assert_eq!((ty, port), (TabletType::Replica, "agent"));
        assert!(parse_resolve_target("ks.0").is_err());
    }

    #[test]
    fn test_parse_alias_with_default_cell() {
        assert_eq!(parse_alias("62344", "test_nj").unwrap(), TabletAlias::new("test_nj", 62344));
        assert_eq!(
            parse_alias("test_ny-0000000100", "test_nj").unwrap(),
            TabletAlias::new("test_ny", 100)
        );
        assert!(parse_alias("bogus", "test").is_err());
    }

    #[test]
    fn test_command_names() {
        let cli = Cli::try_parse_from([
            "tmctl",
            "--wait-time",
            "5s",
            "ReparentShard",
            "--force",
            "test_keyspace/0",
            "62044",
        ])
        .unwrap();
        assert_eq!(cli.wait_time, Some(Duration::from_secs(5)));
        assert!(matches!(cli.command, Command::ReparentShard { force: true, .. }));

        let cli = Cli::try_parse_from(["tmctl", "MultiSnapshot", "--spec=-0000000000000003-", "--tables", "a,b", "1"]).unwrap();
        match cli.command {
            Command::MultiSnapshot { spec, tables, .. } => {
                assert_eq!(spec, "-0000000000000003-");
                assert_eq!(tables, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_block() {
        let reply = SnapshotReply {
            manifest_path: "tablet-0000062344/snapshot_manifest.json".to_string(),
            parent_path: "/cells/test/tablets/0000062344".to_string(),
            slave_start_required: false,
            read_only: true,
            original_type: TabletType::Master,
            server_mode: true,
        };
        let block = snapshot_block(&reply);
        assert!(block.contains("Manifest: tablet-0000062344/snapshot_manifest.json\n"));
        assert!(block.contains("SlaveStartRequired: false\n"));
        assert!(block.contains("ReadOnly: true\n"));
        assert!(block.contains("OriginalType: master\n"));
    }
}
