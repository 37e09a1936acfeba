//! Reasoning-layer subprocess interface.
//!
//! The LLM is never called from inside the core; it observes the same
//! vault and writes back into it. The scheduler shells out to it for the
//! recurring duties (`process-inbox`, `morning-briefing`,
//! `update-dashboard`, `weekly-audit`) and only looks at the exit code.

use std::process::Stdio;

use adjutant_core::config::ReasonerConfig;
use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::vault::Vault;
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};

/// Result of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvokeResult {
    /// The command exited zero.
    Success,
    /// The command exited non-zero.
    Failed(i32),
    /// The command exceeded the timeout and was killed.
    TimedOut,
    /// The command binary is not installed; the duty was skipped.
    Skipped,
}

impl InvokeResult {
    /// Ledger `result` label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed(_) => "failed",
            Self::TimedOut => "timeout",
            Self::Skipped => "skipped",
        }
    }
}

/// Handle for invoking the reasoning layer.
#[derive(Clone)]
pub struct Reasoner {
    config: ReasonerConfig,
    ledger: EventLog,
    vault: Vault,
    dry_run: bool,
}

impl Reasoner {
    /// Build the handle.
    #[must_use]
    pub fn new(config: ReasonerConfig, ledger: EventLog, vault: Vault, dry_run: bool) -> Self {
        Self {
            config,
            ledger,
            vault,
            dry_run,
        }
    }

    /// Run one reasoning command (`claude --print /<command>`) against the
    /// vault and record the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only when the ledger cannot record the outcome;
    /// command failures are reported in the result.
    pub async fn invoke(&self, command: &str) -> Result<InvokeResult, Failure> {
        if self.dry_run {
            info!(command, "dry-run: would invoke reasoning layer");
            return Ok(InvokeResult::Skipped);
        }

        let skill = format!("/{command}");
        info!(program = %self.config.command, skill, "invoking reasoning layer");
        let spawned = Command::new(&self.config.command)
            .arg("--print")
            .arg(&skill)
            .env("VAULT_PATH", self.vault.root())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        let result = match spawned {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(program = %self.config.command, "reasoning command not found, skipping");
                InvokeResult::Skipped
            },
            Err(err) => {
                warn!(error = %err, "failed to spawn reasoning command");
                InvokeResult::Failed(-1)
            },
            Ok(mut child) => {
                match tokio::time::timeout(self.config.timeout, child.wait()).await {
                    Ok(Ok(status)) if status.success() => InvokeResult::Success,
                    Ok(Ok(status)) => InvokeResult::Failed(status.code().unwrap_or(-1)),
                    Ok(Err(err)) => {
                        warn!(error = %err, "reasoning command wait failed");
                        InvokeResult::Failed(-1)
                    },
                    Err(_) => {
                        let _ = child.kill().await;
                        warn!(
                            command,
                            timeout_secs = self.config.timeout.as_secs(),
                            "reasoning command timed out"
                        );
                        InvokeResult::TimedOut
                    },
                }
            },
        };

        self.ledger
            .append(
                EventRecord::new(format!("scheduled_{command}"), result.as_str())
                    .with_detail(json!({ "command": command })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::retry::{Clock, SystemClock};
    use adjutant_core::vault::Stage;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(command: &str) -> (tempfile::TempDir, Reasoner) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        vault.ensure_layout().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = EventLog::new(vault.stage_path(Stage::Logs), clock).with_actor("test");
        let config = ReasonerConfig {
            command: command.to_string(),
            timeout: Duration::from_secs(5),
        };
        (dir, Reasoner::new(config, ledger, vault, false))
    }

    #[tokio::test]
    async fn test_missing_binary_is_skipped() {
        let (_dir, reasoner) = setup("definitely-not-a-real-binary-xyz");
        let result = reasoner.invoke("process-inbox").await.unwrap();
        assert_eq!(result, InvokeResult::Skipped);
    }

    #[tokio::test]
    async fn test_true_succeeds_false_fails() {
        let (_dir, reasoner) = setup("true");
        assert_eq!(
            reasoner.invoke("process-inbox").await.unwrap(),
            InvokeResult::Success
        );

        let (_dir, reasoner) = setup("false");
        assert!(matches!(
            reasoner.invoke("process-inbox").await.unwrap(),
            InvokeResult::Failed(_)
        ));
    }
}
