//! Snapshot transfer with bounded concurrency and per-file retry.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use tabletmgr_topo::Tablet;
use tracing::{debug, warn};

use super::export::content_hash;
use super::manifest::SnapshotFile;
use crate::error::{FetchError, RpcError};
use crate::rpc::{self, TabletDialer};

/// Reads snapshot files by path relative to the source's snapshot root.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    /// Fetches one file.
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError>;
}

/// Resolves a manifest path under `root`. Only plain relative paths are
/// accepted.
pub fn snapshot_file_path(root: &Path, path: &str) -> Option<PathBuf> {
    let rel = Path::new(path);
    if path.is_empty() || rel.is_absolute() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

/// Reads from a snapshot root shared with the source.
#[derive(Clone, Debug)]
pub struct LocalFetcher {
    root: PathBuf,
}

impl LocalFetcher {
    /// Creates a fetcher over `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl SnapshotFetcher for LocalFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        let full = snapshot_file_path(&self.root, path).ok_or_else(|| FetchError::Fatal {
            path: path.to_string(),
            msg: "invalid snapshot path".to_string(),
        })?;
        match tokio::fs::read(full).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(FetchError::Fatal {
                path: path.to_string(),
                msg: e.to_string(),
            }),
            Err(e) => Err(FetchError::Retryable {
                path: path.to_string(),
                msg: e.to_string(),
            }),
        }
    }
}

/// Asks the source tablet's agent for files.
pub struct RpcFetcher {
    dialer: Arc<dyn TabletDialer>,
    source: Tablet,
    timeout: Duration,
}

impl RpcFetcher {
    /// Creates a fetcher against `source`.
    pub fn new(dialer: Arc<dyn TabletDialer>, source: Tablet, timeout: Duration) -> Self {
        Self {
            dialer,
            source,
            timeout,
        }
    }
}

#[async_trait]
impl SnapshotFetcher for RpcFetcher {
    async fn fetch(&self, path: &str) -> Result<Vec<u8>, FetchError> {
        rpc::fetch_file(self.dialer.as_ref(), &self.source, path, self.timeout)
            .await
            .map_err(|e| match e {
                RpcError::Remote { msg, .. } => FetchError::Fatal {
                    path: path.to_string(),
                    msg,
                },
                RpcError::Unauthenticated { addr } => FetchError::Fatal {
                    path: path.to_string(),
                    msg: format!("unauthenticated by {}", addr),
                },
                other => FetchError::Retryable {
                    path: path.to_string(),
                    msg: other.to_string(),
                },
            })
    }
}

/// Fails the first `fail_first` attempts of every file.
#[derive(Debug, Default)]
pub struct FaultInjector {
    fail_first: u32,
    attempts: DashMap<String, u32>,
}

impl FaultInjector {
    /// Creates an injector; zero disables it.
    pub fn new(fail_first: u32) -> Self {
        Self {
            fail_first,
            attempts: DashMap::new(),
        }
    }

    /// Counts an attempt on `path` and fails it while under the threshold.
    pub fn check(&self, path: &str) -> Result<(), FetchError> {
        if self.fail_first == 0 {
            return Ok(());
        }
        let mut n = self.attempts.entry(path.to_string()).or_insert(0);
        *n += 1;
        if *n <= self.fail_first {
            return Err(FetchError::Retryable {
                path: path.to_string(),
                msg: format!("simulated fetch failure {}/{}", *n, self.fail_first),
            });
        }
        Ok(())
    }

    /// Attempts seen for `path`.
    pub fn attempts(&self, path: &str) -> u32 {
        self.attempts.get(path).map(|n| *n).unwrap_or(0)
    }
}

/// Retry settings for one file.
#[derive(Clone, Debug)]
pub struct FetchRetry {
    /// Retries after the first attempt.
    pub retry_count: u32,
    /// First backoff; doubles per attempt.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
}

impl FetchRetry {
    /// Creates settings with a 2s backoff ceiling.
    pub fn new(retry_count: u32, initial_backoff: Duration) -> Self {
        Self {
            retry_count,
            initial_backoff,
            max_backoff: Duration::from_secs(2),
        }
    }

    /// Backoff before retry `attempt` (1-based), with up to 25% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Fetches `path` with retries. `expected_hash`, when set, is verified and a
/// mismatch counts as a retryable failure.
pub async fn fetch_with_retry(
    fetcher: &dyn SnapshotFetcher,
    faults: &FaultInjector,
    path: &str,
    expected_hash: Option<&str>,
    retry: &FetchRetry,
) -> Result<Vec<u8>, FetchError> {
    let attempts = retry.retry_count + 1;
    let mut last = String::new();
    for attempt in 1..=attempts {
        if attempt > 1 {
            tokio::time::sleep(retry.backoff(attempt - 1)).await;
        }
        let result = match faults.check(path) {
            Ok(()) => fetcher.fetch(path).await,
            Err(e) => Err(e),
        };
        let result = result.and_then(|data| match expected_hash {
            Some(expected) => {
                let actual = content_hash(&data);
                if actual == expected {
                    Ok(data)
                } else {
                    Err(FetchError::HashMismatch {
                        path: path.to_string(),
                        expected: expected.to_string(),
                        actual,
                    })
                }
            }
            None => Ok(data),
        });
        match result {
            Ok(data) => {
                debug!(path = %path, attempt, bytes = data.len(), "fetched snapshot file");
                return Ok(data);
            }
            Err(e) if e.is_retryable() => {
                warn!(path = %path, attempt, attempts, error = %e, "snapshot fetch failed, will retry");
                last = e.to_string();
            }
            Err(e) => return Err(e),
        }
    }
    Err(FetchError::Exhausted {
        path: path.to_string(),
        attempts,
        last,
    })
}

/// Fetches and verifies every file, at most `concurrency` at once. Results
/// come back in input order.
pub async fn fetch_files(
    fetcher: &dyn SnapshotFetcher,
    faults: &FaultInjector,
    files: &[SnapshotFile],
    concurrency: usize,
    retry: &FetchRetry,
) -> Result<Vec<Vec<u8>>, FetchError> {
    let fetches: Vec<BoxFuture<'_, Result<Vec<u8>, FetchError>>> = files
        .iter()
        .map(|file| fetch_with_retry(fetcher, faults, &file.path, Some(&file.hash), retry).boxed())
        .collect();
    stream::iter(fetches)
        .buffered(concurrency.max(1))
        .try_collect()
        .await
}
