//! Operator hooks: named executables in a fixed directory on the tablet host.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::HookError;

/// Exit status reported for a hook that does not exist.
pub const HOOK_MISSING: i32 = -1;

/// Captured outcome of a hook run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookResult {
    /// Process exit status, or `HOOK_MISSING`.
    #[serde(rename = "ExitStatus")]
    pub exit_status: i32,
    /// Standard output, verbatim.
    #[serde(rename = "Stdout")]
    pub stdout: String,
    /// Standard error, verbatim, plus an `ERROR:` line on non-zero exit.
    #[serde(rename = "Stderr")]
    pub stderr: String,
}

/// Turns `flag` into `--flag` and `key=value` into `--key=value`.
pub fn hook_args(params: &[String]) -> Vec<String> {
    params
        .iter()
        .map(|p| {
            let p = p.trim_start_matches('-');
            format!("--{}", p)
        })
        .collect()
}

/// Runs hooks out of one directory.
#[derive(Clone, Debug)]
pub struct HookRunner {
    dir: PathBuf,
    timeout: Duration,
}

impl HookRunner {
    /// Creates a runner for `dir` with a per-run time bound.
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    /// Hook directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Runs hook `name` with `params`. `env` is added to the hook environment.
    pub async fn execute(
        &self,
        name: &str,
        params: &[String],
        env: &[(&str, String)],
    ) -> Result<HookResult, HookError> {
        if name.contains('/') {
            return Err(HookError::InvalidName);
        }
        let path = self.dir.join(name);
        if name.is_empty() || !path.is_file() {
            debug!(hook = %name, path = %path.display(), "hook not found");
            return Ok(HookResult {
                exit_status: HOOK_MISSING,
                stdout: format!("Skipping missing hook: {}\n", path.display()),
                stderr: String::new(),
            });
        }

        let args = hook_args(params);
        info!(hook = %name, args = ?args, "executing hook");
        let mut cmd = Command::new(&path);
        cmd.args(&args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in env {
            cmd.env(k, v);
        }
        let child = cmd.spawn().map_err(|source| HookError::Spawn {
            name: name.to_string(),
            source,
        })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(HookError::Spawn {
                    name: name.to_string(),
                    source,
                })
            }
            Err(_) => {
                warn!(hook = %name, timeout_ms = self.timeout.as_millis() as u64, "hook timed out");
                return Err(HookError::Timeout {
                    name: name.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        let exit_status = output.status.code().unwrap_or(-1);
        let mut result = HookResult {
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if exit_status != 0 {
            result
                .stderr
                .push_str(&format!("ERROR: exit status {}\n", exit_status));
        }
        debug!(hook = %name, exit_status, "hook finished");
        Ok(result)
    }
}
