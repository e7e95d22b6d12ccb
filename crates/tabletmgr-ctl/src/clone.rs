//! Clone: snapshot a serving tablet and restore it onto an idle one.

use tabletmgr_agent::{ActionArgs, ActionReply, FetchOptions, RestoreReply, SnapshotReply};
use tabletmgr_topo::{KeyRange, TabletAlias, TabletType};
use tracing::{info, warn};

use crate::error::WranglerError;
use crate::wrangler::{unexpected, Wrangler};

/// Knobs for `clone`.
#[derive(Clone, Debug)]
pub struct CloneOptions {
    /// Parallel export/import workers.
    pub concurrency: usize,
    /// Keep the source out of serving while files are served from it.
    pub server_mode: bool,
    /// Overwrite an existing snapshot directory.
    pub force: bool,
    /// Fetch parallelism and retries.
    pub fetch: FetchOptions,
}

impl Default for CloneOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            server_mode: false,
            force: false,
            fetch: FetchOptions::default(),
        }
    }
}

impl Wrangler {
    /// Copies `source`'s database onto idle tablet `dst`, which ends up a
    /// replica of the source's shard. Any failure scraps `dst`; a server-mode
    /// source is always returned to its original type.
    pub async fn clone_tablet(
        &self,
        source: &TabletAlias,
        dst: &TabletAlias,
        opts: CloneOptions,
    ) -> Result<RestoreReply, WranglerError> {
        let source_tablet = self.topo().get_tablet(source).await?;
        if !source_tablet.is_assigned() {
            return Err(WranglerError::InvalidArgument(format!(
                "source {} is {} and has nothing to clone",
                source, source_tablet.tablet_type
            )));
        }
        self.check_idle(dst).await?;
        info!(source = %source, dst = %dst, server_mode = opts.server_mode, "clone starting");

        let snapshot = match self.snapshot(source, opts.concurrency, opts.server_mode, opts.force).await {
            Ok(s) => s,
            Err(e) => return self.scrap_on_failure(dst, Err(transfer("snapshot", e))).await,
        };

        let restored = async {
            self.prepare_destination(dst, &source_tablet, None).await?;
            let args = ActionArgs::Restore {
                source: source.clone(),
                manifest_path: Some(snapshot.manifest_path.clone()),
                fetch: opts.fetch.clone(),
                dont_wait_for_slave_start: false,
                tablet_type: TabletType::Replica,
            };
            match self.run(dst, args).await {
                Ok(ActionReply::Restore(reply)) => Ok(reply),
                Ok(other) => Err(unexpected("Restore", other)),
                Err(e) => Err(transfer("restore", e)),
            }
        }
        .await;

        self.end_server_mode(source, &snapshot).await;
        let reply = self.scrap_on_failure(dst, restored).await?;
        info!(source = %source, dst = %dst, manifest = %snapshot.manifest_path, "clone finished");
        Ok(reply)
    }

    /// Copies one key range of `source` onto idle tablet `dst`, whose target
    /// database must already exist. `dst` ends up a spare covering the range.
    pub async fn partial_clone(
        &self,
        source: &TabletAlias,
        dst: &TabletAlias,
        key_range: &KeyRange,
        key_column: Option<&str>,
        opts: CloneOptions,
    ) -> Result<RestoreReply, WranglerError> {
        let source_tablet = self.topo().get_tablet(source).await?;
        self.check_idle(dst).await?;
        info!(source = %source, dst = %dst, start = %key_range.start, end = %key_range.end, "partial clone starting");

        let snapshot = match self.partial_snapshot(source, key_range, key_column, opts.concurrency).await {
            Ok(s) => s,
            Err(e) => return self.scrap_on_failure(dst, Err(transfer("partial snapshot", e))).await,
        };

        let restored = async {
            self.prepare_destination(dst, &source_tablet, Some(key_range)).await?;
            let args = ActionArgs::PartialRestore {
                source: source.clone(),
                manifest_path: snapshot.manifest_path.clone(),
                fetch: opts.fetch.clone(),
                tablet_type: TabletType::Spare,
            };
            match self.run(dst, args).await {
                Ok(ActionReply::Restore(reply)) => Ok(reply),
                Ok(other) => Err(unexpected("PartialRestore", other)),
                Err(e) => Err(transfer("partial restore", e)),
            }
        }
        .await;
        self.scrap_on_failure(dst, restored).await
    }

    async fn end_server_mode(&self, source: &TabletAlias, snapshot: &SnapshotReply) {
        if !snapshot.server_mode {
            return;
        }
        if let Err(e) = self.snapshot_source_end(source, snapshot).await {
            warn!(source = %source, error = %e, "could not return snapshot source to duty");
        }
    }
}

fn transfer(phase: &str, e: WranglerError) -> WranglerError {
    match e {
        WranglerError::Remote { message, .. } => WranglerError::Transfer(format!("{}: {}", phase, message)),
        other => other,
    }
}
