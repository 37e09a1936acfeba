//! Git-backed vault sync bridge.
//!
//! A daemon that periodically pulls the shared remote, then pushes local
//! changes. Conflicts are resolved per directory:
//!
//! | Directory | Policy |
//! |---|---|
//! | `Needs_Action/`, `Signals/` | prefer remote (cloud-authoritative) |
//! | `Done/`, `Rejected/`, `Logs/` | prefer local (both peers' stems coexist) |
//! | `Pending_Approval/`, `Approved/` | same-stem conflicts: later `status` wins |
//! | `Dashboard.md`, `.env`, `.adjutant/` sidecars | never synced |
//!
//! Remote deletions are honoured only in the remote-preferred directories
//! and refused (restored) elsewhere. A rolling `Signals/SYNC_STATUS.md`
//! records the outcome of every cycle.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::sync::Arc;

use adjutant_core::config::SyncConfig;
use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::Clock;
use adjutant_core::vault::{NoteStatus, Stage, Vault};
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::shutdown::ShutdownToken;

/// Directories where the remote side wins conflicts and deletions.
const REMOTE_PREFERRED: &[&str] = &["Needs_Action/", "Signals/"];

/// Directories where same-stem conflicts resolve by later note status.
const STATUS_RANKED: &[&str] = &["Pending_Approval/", "Approved/"];

/// Outcome of one pull.
#[derive(Debug, Default, Clone)]
pub struct PullOutcome {
    /// Whether the pull ran (a missing remote skips it).
    pub performed: bool,
    /// Files updated from the remote.
    pub files_updated: usize,
    /// Conflicts resolved by policy.
    pub conflicts_resolved: usize,
}

/// Outcome of one push.
#[derive(Debug, Default, Clone)]
pub struct PushOutcome {
    /// Whether the push ran.
    pub performed: bool,
    /// Files committed and pushed.
    pub files_pushed: usize,
}

/// Outcome of one pull+push cycle.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    /// Pull half.
    pub pull: PullOutcome,
    /// Push half.
    pub push: PushOutcome,
}

/// The sync bridge.
pub struct SyncBridge {
    vault: Vault,
    ledger: EventLog,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    dry_run: bool,
}

impl SyncBridge {
    /// Build the bridge.
    #[must_use]
    pub fn new(
        vault: Vault,
        ledger: EventLog,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        dry_run: bool,
    ) -> Self {
        Self {
            vault,
            ledger,
            clock,
            config,
            dry_run,
        }
    }

    /// Run one git command inside the repository containing the vault.
    async fn git(&self, root: &Path, args: &[&str]) -> Result<Output, Failure> {
        debug!(?args, "git");
        Command::new("git")
            .arg("-C")
            .arg(root)
            .args(args)
            .output()
            .await
            .map_err(|err| Failure::transient("failed to run git").with_source(err))
    }

    /// Repository root containing the vault, if the vault is in a repo.
    async fn repo_root(&self) -> Option<PathBuf> {
        let output = self
            .git(self.vault.root(), &["rev-parse", "--show-toplevel"])
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!root.is_empty()).then(|| PathBuf::from(root))
    }

    async fn has_remote(&self, root: &Path) -> bool {
        match self.git(root, &["remote"]).await {
            Ok(output) => !String::from_utf8_lossy(&output.stdout).trim().is_empty(),
            Err(_) => false,
        }
    }

    async fn current_branch(&self, root: &Path) -> String {
        match self.git(root, &["branch", "--show-current"]).await {
            Ok(output) => {
                let branch = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if branch.is_empty() {
                    self.config.branch.clone()
                } else {
                    branch
                }
            },
            Err(_) => self.config.branch.clone(),
        }
    }

    /// Pull the remote and resolve conflicts per directory policy.
    ///
    /// # Errors
    ///
    /// Returns an error when git itself cannot run; a failed fetch or
    /// merge is reported in the outcome.
    pub async fn pull(&self) -> Result<PullOutcome, Failure> {
        let Some(root) = self.repo_root().await else {
            warn!("vault is not inside a git repository, skipping pull");
            return Ok(PullOutcome::default());
        };
        if !self.has_remote(&root).await {
            warn!("no git remote configured, skipping pull");
            return Ok(PullOutcome::default());
        }
        let branch = self.current_branch(&root).await;

        let fetch = self.git(&root, &["fetch", self.config.remote.as_str()]).await?;
        if !fetch.status.success() {
            warn!(
                stderr = %String::from_utf8_lossy(&fetch.stderr).trim(),
                "git fetch failed"
            );
            return Ok(PullOutcome::default());
        }

        let upstream = format!("{}/{branch}", self.config.remote);
        let range = format!("HEAD..{upstream}");
        let diff = self
            .git(&root, &["diff", range.as_str(), "--name-only"])
            .await?;
        let incoming: Vec<String> = String::from_utf8_lossy(&diff.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if incoming.is_empty() {
            debug!("already up to date");
            return Ok(PullOutcome {
                performed: true,
                ..Default::default()
            });
        }
        if self.dry_run {
            info!(files = incoming.len(), "dry-run: would merge remote changes");
            return Ok(PullOutcome {
                performed: true,
                ..Default::default()
            });
        }

        let merge = self
            .git(&root, &["merge", "--no-edit", upstream.as_str()])
            .await?;
        let mut conflicts = 0;
        if !merge.status.success() {
            conflicts = self.resolve_conflicts(&root).await?;
            let commit = self
                .git(
                    &root,
                    &[
                        "commit",
                        "--no-edit",
                        "-m",
                        "vault-sync: resolve conflicts by directory policy",
                    ],
                )
                .await?;
            if !commit.status.success() {
                warn!(
                    stderr = %String::from_utf8_lossy(&commit.stderr).trim(),
                    "conflict resolution commit failed"
                );
            }
        }

        info!(files = incoming.len(), conflicts, "pull complete");
        self.ledger
            .append(
                EventRecord::new("vault_pull", "ok").with_detail(json!({
                    "files_changed": incoming.len(),
                    "conflicts": conflicts,
                })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        Ok(PullOutcome {
            performed: true,
            files_updated: incoming.len(),
            conflicts_resolved: conflicts,
        })
    }

    /// Resolve every unmerged path by the per-directory policy.
    async fn resolve_conflicts(&self, root: &Path) -> Result<usize, Failure> {
        let status = self.git(root, &["status", "--porcelain"]).await?;
        let raw = String::from_utf8_lossy(&status.stdout).to_string();
        let mut resolved = 0;
        for line in raw.lines() {
            if line.len() < 4 {
                continue;
            }
            let code = &line[..2];
            let path = line[3..].trim().to_string();
            let rel = self.vault_relative(root, &path);
            match code {
                // Both sides modified (or both added).
                "UU" | "AA" => {
                    let side = self.content_winner(root, &path, rel.as_deref()).await;
                    let checkout = ["checkout", side, "--", path.as_str()];
                    self.git(root, &checkout).await?;
                    self.git(root, &["add", "--", path.as_str()]).await?;
                    resolved += 1;
                },
                // Deleted by them: honour only in remote-preferred dirs.
                "UD" => {
                    if rel.as_deref().is_some_and(is_remote_preferred) {
                        self.git(root, &["rm", "--quiet", "--", path.as_str()]).await?;
                    } else {
                        self.git(root, &["add", "--", path.as_str()]).await?;
                    }
                    resolved += 1;
                },
                // Deleted by us, changed by them.
                "DU" => {
                    if rel.as_deref().is_some_and(is_remote_preferred) {
                        self.git(root, &["checkout", "--theirs", "--", path.as_str()])
                            .await?;
                        self.git(root, &["add", "--", path.as_str()]).await?;
                    } else {
                        self.git(root, &["rm", "--quiet", "--", path.as_str()]).await?;
                    }
                    resolved += 1;
                },
                _ => {},
            }
        }
        Ok(resolved)
    }

    /// Which side wins a both-modified conflict.
    async fn content_winner(
        &self,
        root: &Path,
        path: &str,
        rel: Option<&str>,
    ) -> &'static str {
        let Some(rel) = rel else {
            return "--ours"; // outside the vault: not ours to merge
        };
        if is_remote_preferred(rel) {
            return "--theirs";
        }
        if STATUS_RANKED.iter().any(|prefix| rel.starts_with(prefix)) {
            // Later lifecycle status wins: Approved beats pending.
            let ours = self.staged_status(root, path, 2).await;
            let theirs = self.staged_status(root, path, 3).await;
            if theirs.rank() > ours.rank() {
                return "--theirs";
            }
        }
        "--ours"
    }

    /// Note status of one side of an unmerged path (stage 2 ours, 3 theirs).
    async fn staged_status(&self, root: &Path, path: &str, stage: u8) -> NoteStatus {
        let spec = format!(":{stage}:{path}");
        match self.git(root, &["show", spec.as_str()]).await {
            Ok(output) if output.status.success() => {
                let raw = String::from_utf8_lossy(&output.stdout);
                raw.lines()
                    .find_map(|line| line.trim().strip_prefix("status:"))
                    .map_or(NoteStatus::Pending, |value| {
                        NoteStatus::parse_lenient(value)
                    })
            },
            _ => NoteStatus::Pending,
        }
    }

    /// Path relative to the vault root, if the path is inside the vault.
    fn vault_relative(&self, root: &Path, path: &str) -> Option<String> {
        let absolute = root.join(path);
        absolute
            .strip_prefix(self.vault.root())
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }

    /// Stage vault changes (excluding never-synced paths), commit, push.
    ///
    /// # Errors
    ///
    /// Returns an error when git itself cannot run.
    pub async fn push(&self, message: Option<&str>) -> Result<PushOutcome, Failure> {
        let Some(root) = self.repo_root().await else {
            warn!("vault is not inside a git repository, skipping push");
            return Ok(PushOutcome::default());
        };
        if !self.has_remote(&root).await {
            warn!("no git remote configured, skipping push");
            return Ok(PushOutcome::default());
        }

        let vault_rel = self
            .vault
            .root()
            .strip_prefix(&root)
            .map(|rel| rel.to_string_lossy().to_string())
            .unwrap_or_else(|_| ".".to_string());
        let exclude_dashboard = format!(":(exclude){vault_rel}/Dashboard.md");
        let exclude_sidecars = format!(":(exclude){vault_rel}/.adjutant");
        if self.dry_run {
            info!("dry-run: would stage and push vault changes");
            return Ok(PushOutcome::default());
        }
        let add = self
            .git(
                &root,
                &[
                    "add",
                    "--",
                    vault_rel.as_str(),
                    exclude_dashboard.as_str(),
                    exclude_sidecars.as_str(),
                    ":(exclude).env",
                ],
            )
            .await?;
        if !add.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&add.stderr).trim(), "git add failed");
            return Ok(PushOutcome::default());
        }

        let staged = self
            .git(&root, &["diff", "--cached", "--name-only"])
            .await?;
        let files: Vec<String> = String::from_utf8_lossy(&staged.stdout)
            .lines()
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if files.is_empty() {
            debug!("nothing to push");
            return Ok(PushOutcome {
                performed: true,
                files_pushed: 0,
            });
        }

        let timestamp = self.clock.now().format("%Y-%m-%d %H:%M");
        let default_message = format!("vault-sync: auto-sync {timestamp}");
        let message = message.unwrap_or(default_message.as_str());
        let commit = self.git(&root, &["commit", "-m", message]).await?;
        if !commit.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&commit.stderr).trim(), "git commit failed");
            return Ok(PushOutcome::default());
        }

        let branch = self.current_branch(&root).await;
        let push = self
            .git(
                &root,
                &["push", self.config.remote.as_str(), branch.as_str()],
            )
            .await?;
        if !push.status.success() {
            warn!(stderr = %String::from_utf8_lossy(&push.stderr).trim(), "git push failed");
            return Ok(PushOutcome::default());
        }

        info!(files = files.len(), branch, "push complete");
        self.ledger
            .append(
                EventRecord::new("vault_push", "ok").with_detail(json!({
                    "files_pushed": files.len(),
                    "branch": branch,
                })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        Ok(PushOutcome {
            performed: true,
            files_pushed: files.len(),
        })
    }

    /// One pull+push cycle, recording the rolling `SYNC_STATUS` signal.
    ///
    /// # Errors
    ///
    /// Returns an error when git itself cannot run.
    pub async fn sync_once(&self) -> Result<SyncReport, Failure> {
        let pull = self.pull().await?;
        let push = self.push(None).await?;
        let report = SyncReport { pull, push };
        self.write_status(&report)?;
        Ok(report)
    }

    /// Overwrite the rolling `Signals/SYNC_STATUS.md` (temp + rename).
    fn write_status(&self, report: &SyncReport) -> Result<(), Failure> {
        if self.dry_run {
            return Ok(());
        }
        let status = match (report.pull.performed, report.push.performed) {
            (true, true) => "synced",
            (true, false) => "pulled",
            (false, true) => "pushed",
            (false, false) => "skipped",
        };
        let now = self.clock.now();
        let body = format!(
            "---\n\
             type: sync_status\n\
             status: {status}\n\
             timestamp: {}\n\
             branch: {}\n\
             ---\n\n\
             # Vault Sync Status: {status}\n\n\
             - **files_updated**: {}\n\
             - **conflicts_resolved**: {}\n\
             - **files_pushed**: {}\n",
            now.to_rfc3339(),
            self.config.branch,
            report.pull.files_updated,
            report.pull.conflicts_resolved,
            report.push.files_pushed,
        );
        let dir = self.vault.stage_path(Stage::Signals);
        std::fs::create_dir_all(&dir)
            .map_err(|err| Failure::transient("failed to create Signals").with_source(err))?;
        let path = dir.join("SYNC_STATUS.md");
        let tmp = dir.join(".SYNC_STATUS.md.tmp");
        std::fs::write(&tmp, body)
            .map_err(|err| Failure::transient("failed to write sync status").with_source(err))?;
        std::fs::rename(&tmp, &path)
            .map_err(|err| Failure::transient("failed to replace sync status").with_source(err))?;
        Ok(())
    }

    /// Run the sync loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the failure that stopped the bridge.
    pub async fn run(&self, mut token: ShutdownToken) -> Result<(), Failure> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            branch = %self.config.branch,
            "vault sync daemon started"
        );
        let mut cycles: u64 = 0;
        loop {
            if token.is_triggered() {
                break;
            }
            match self.sync_once().await {
                Ok(report) => {
                    cycles += 1;
                    debug!(
                        cycle = cycles,
                        pulled = report.pull.files_updated,
                        pushed = report.push.files_pushed,
                        "sync cycle complete"
                    );
                },
                Err(failure) if failure.is_retryable() => {
                    warn!(error = %failure, "sync cycle failed");
                },
                Err(failure) => return Err(failure),
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.interval) => {},
                () = token.triggered() => break,
            }
        }
        info!(cycles, "vault sync daemon stopped");
        Ok(())
    }
}

fn is_remote_preferred(rel: &str) -> bool {
    REMOTE_PREFERRED.iter().any(|prefix| rel.starts_with(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::retry::SystemClock;
    use std::process::Command as StdCommand;

    fn sh(dir: &Path, program: &str, args: &[&str]) {
        let status = StdCommand::new(program)
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|_| panic!("failed to run {program}"));
        assert!(
            status.status.success(),
            "{program} {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr)
        );
    }

    fn git_repo_with_vault() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let remote = dir.path().join("remote.git");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::create_dir_all(&remote).unwrap();

        sh(&remote, "git", &["init", "--bare", "--quiet"]);
        sh(&repo, "git", &["init", "--quiet"]);
        sh(&repo, "git", &["checkout", "-b", "main", "--quiet"]);
        sh(&repo, "git", &["config", "user.email", "sync@test"]);
        sh(&repo, "git", &["config", "user.name", "sync test"]);
        sh(
            &repo,
            "git",
            &["remote", "add", "origin", remote.to_str().unwrap()],
        );

        let vault = repo.join("vault");
        std::fs::create_dir_all(&vault).unwrap();
        let v = Vault::open(&vault).unwrap();
        v.ensure_layout().unwrap();
        std::fs::write(vault.join("Needs_Action").join(".gitkeep"), "").unwrap();

        sh(&repo, "git", &["add", "."]);
        sh(&repo, "git", &["commit", "--quiet", "-m", "init"]);
        sh(&repo, "git", &["push", "--quiet", "-u", "origin", "main"]);
        (dir, repo, vault)
    }

    fn bridge(vault_path: &Path) -> SyncBridge {
        let vault = Vault::open(vault_path).unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&clock))
            .with_actor("vault_sync");
        SyncBridge::new(vault, ledger, SyncConfig::default(), clock, false)
    }

    #[tokio::test]
    async fn test_sync_pushes_new_vault_files() {
        let (_dir, repo, vault_path) = git_repo_with_vault();
        std::fs::write(
            vault_path.join("Done").join("EMAIL_x_20260101000000.md"),
            "---\ntype: email\ncreated: 2026-01-01T00:00:00+00:00\nstatus: done\n---\n\nbody\n",
        )
        .unwrap();

        let bridge = bridge(&vault_path);
        let report = bridge.sync_once().await.unwrap();
        assert!(report.push.performed);
        assert!(report.push.files_pushed >= 1);

        // The commit reached the remote.
        let log = StdCommand::new("git")
            .args(["-C", repo.to_str().unwrap(), "log", "origin/main", "--oneline"])
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&log.stdout).contains("vault-sync"));

        // Rolling status signal exists.
        let status = std::fs::read_to_string(
            vault_path.join("Signals").join("SYNC_STATUS.md"),
        )
        .unwrap();
        assert!(status.contains("type: sync_status"));
    }

    #[tokio::test]
    async fn test_dashboard_never_pushed() {
        let (_dir, repo, vault_path) = git_repo_with_vault();
        std::fs::write(vault_path.join("Dashboard.md"), "# secret local state\n").unwrap();

        let bridge = bridge(&vault_path);
        bridge.sync_once().await.unwrap();

        let files = StdCommand::new("git")
            .args([
                "-C",
                repo.to_str().unwrap(),
                "ls-tree",
                "-r",
                "--name-only",
                "origin/main",
            ])
            .output()
            .unwrap();
        assert!(!String::from_utf8_lossy(&files.stdout).contains("Dashboard.md"));
    }

    #[tokio::test]
    async fn test_no_repo_skips_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        vault.ensure_layout().unwrap();
        let bridge = bridge(dir.path());
        let report = bridge.sync_once().await.unwrap();
        assert!(!report.pull.performed);
        assert!(!report.push.performed);
    }
}
