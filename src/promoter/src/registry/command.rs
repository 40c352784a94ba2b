//! Typed subprocess boundary.
//!
//! The registry wire protocol is delegated to an external CLI. The core only
//! sees `Invocation` (argv) going out and `CommandOutput` (exit code, stdout,
//! stderr) coming back; nothing else about subprocess plumbing leaks past this
//! module.

use crate::error::{PromoterError, Result};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;

/// Timeout for read commands (listing, manifest fetches).
pub const LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for write commands (copies and tag operations).
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(300);

/// Retry attempts for transient failures.
pub const MAX_ATTEMPTS: u32 = 3;

/// An argv vector ready to spawn. Comparable so dry-run reports and tests can
/// treat planned invocations as sets.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Invocation {
    pub argv: Vec<String>,
}

impl Invocation {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The single seam between the core and the outside world. Stateless and safe
/// to share across workers.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Spawn the invocation and wait for it, up to `timeout`.
    ///
    /// Spawn failures and timeouts surface as `Transient`; a nonzero exit is
    /// not an error at this layer (callers decide what the exit code means).
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput>;
}

/// Real runner backed by `tokio::process`.
pub struct SubprocessRunner;

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, invocation: &Invocation, timeout: Duration) -> Result<CommandOutput> {
        let (program, args) = invocation
            .argv
            .split_first()
            .ok_or_else(|| PromoterError::Exec("empty command invocation".to_string()))?;

        tracing::debug!("Spawning: {}", invocation);

        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PromoterError::Transient(format!("failed to spawn '{}': {}", invocation, e))
            })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                PromoterError::Transient(format!("failed to wait for '{}': {}", invocation, e))
            })?,
            Err(_) => {
                return Err(PromoterError::Transient(format!(
                    "'{}' timed out after {:?}",
                    invocation, timeout
                )));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Run with exponential backoff on transient failures (1s, 2s, 4s).
///
/// Semantic failures (nonzero exit) are returned to the caller immediately and
/// never retried. Exhausting all attempts upgrades the transient error
/// to an execution error.
pub async fn run_with_retry(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    timeout: Duration,
) -> Result<CommandOutput> {
    let mut last_transient = None;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            let delay_ms = 1000 * (1u64 << (attempt - 1));
            tracing::warn!(
                "Retrying '{}' (attempt {}/{}) after {}ms",
                invocation,
                attempt + 1,
                MAX_ATTEMPTS,
                delay_ms
            );
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        match runner.run(invocation, timeout).await {
            Ok(output) => return Ok(output),
            Err(e) if e.is_transient() => {
                tracing::warn!("Transient failure for '{}': {}", invocation, e);
                last_transient = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    let reason = last_transient
        .map(|e| e.to_string())
        .unwrap_or_else(|| "transient failure".to_string());
    Err(PromoterError::Exec(format!(
        "'{}' failed after {} attempts: {}",
        invocation, MAX_ATTEMPTS, reason
    )))
}
