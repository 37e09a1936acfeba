//! Signal merge: cloud peer status into the dashboard.
//!
//! Reads all `Signals/CLOUD_STATUS_*` files and the rolling
//! `Signals/SYNC_STATUS.md`, summarises cloud peer activity, and rewrites
//! only the fenced region of `Dashboard.md` between the
//! `<!-- adjutant:cloud-status:begin -->` / `end` markers. The rest of the
//! dashboard is never touched, and the rewrite goes through a temp file +
//! rename so readers never see a torn file. Processed status signals are
//! archived to `Done/` under a `SIGNAL_` prefix; `SYNC_STATUS.md` is
//! rolling and stays in place.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::Clock;
use adjutant_core::vault::{Stage, Stem, Vault};
use serde_json::json;
use tracing::{info, warn};

/// Region markers in `Dashboard.md`.
pub const REGION_BEGIN: &str = "<!-- adjutant:cloud-status:begin -->";
/// Closing marker.
pub const REGION_END: &str = "<!-- adjutant:cloud-status:end -->";

/// One parsed signal file: frontmatter keys plus `- **k**: v` bullets.
type Signal = BTreeMap<String, String>;

/// Merges cloud signals into the dashboard.
pub struct SignalMerger {
    vault: Vault,
    ledger: EventLog,
    clock: Arc<dyn Clock>,
    dry_run: bool,
}

impl SignalMerger {
    /// Build the merger.
    #[must_use]
    pub fn new(vault: Vault, ledger: EventLog, clock: Arc<dyn Clock>, dry_run: bool) -> Self {
        Self {
            vault,
            ledger,
            clock,
            dry_run,
        }
    }

    /// Merge all pending signals. Returns the number of signals read.
    ///
    /// # Errors
    ///
    /// Returns an error when the dashboard cannot be rewritten.
    pub fn merge(&self) -> Result<usize, Failure> {
        let entries = self
            .vault
            .list(Stage::Signals)
            .map_err(|err| Failure::transient("failed to list Signals").with_source(err))?;
        let mut cloud_signals: Vec<(Stem, Signal)> = Vec::new();
        let mut sync_signal: Option<Signal> = None;
        for entry in entries {
            let Ok(raw) = std::fs::read_to_string(&entry.path) else {
                continue;
            };
            let parsed = parse_signal(&raw);
            if entry.stem.as_str() == "SYNC_STATUS" {
                sync_signal = Some(parsed);
            } else if entry.stem.as_str().starts_with("CLOUD_STATUS_") {
                cloud_signals.push((entry.stem, parsed));
            }
        }
        let count = cloud_signals.len() + usize::from(sync_signal.is_some());
        if count == 0 {
            return Ok(0);
        }

        let section = self.render_section(&cloud_signals, sync_signal.as_ref())?;
        if self.dry_run {
            info!(signals = count, "dry-run: would update dashboard");
            return Ok(count);
        }
        self.rewrite_dashboard(&section)?;
        self.archive(&cloud_signals)?;

        self.ledger
            .append(
                EventRecord::new("signals_merged", "ok").with_detail(json!({
                    "signals": count,
                })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        info!(signals = count, "dashboard updated with cloud status");
        Ok(count)
    }

    /// Build the fenced dashboard section.
    fn render_section(
        &self,
        cloud_signals: &[(Stem, Signal)],
        sync_signal: Option<&Signal>,
    ) -> Result<String, Failure> {
        let latest = cloud_signals
            .iter()
            .max_by_key(|(_, signal)| signal.get("timestamp").cloned().unwrap_or_default());
        let get = |signal: Option<&Signal>, key: &str| -> String {
            signal
                .and_then(|s| s.get(key).cloned())
                .unwrap_or_else(|| "unknown".to_string())
        };
        let latest_signal = latest.map(|(_, signal)| signal);

        let pending_drafts = self
            .vault
            .list(Stage::PendingApproval)
            .map_err(|err| Failure::transient("failed to list Pending_Approval").with_source(err))?
            .into_iter()
            .filter(|entry| entry.stem.is_cloud_draft())
            .collect::<Vec<_>>();
        let cloud_in_progress = self
            .vault
            .list(Stage::InProgress(adjutant_core::vault::Peer::Cloud))
            .map_err(|err| Failure::transient("failed to list In_Progress").with_source(err))?;

        let mut out = String::new();
        out.push_str("\n## Cloud Agent Status\n\n");
        out.push_str("| Field | Value |\n|-------|-------|\n");
        out.push_str(&format!(
            "| Status | {} |\n",
            get(latest_signal, "status")
        ));
        out.push_str(&format!(
            "| Last Active | {} |\n",
            get(latest_signal, "last_active")
        ));
        out.push_str(&format!(
            "| Tasks Processed | {} |\n",
            get(latest_signal, "tasks_processed")
        ));
        out.push_str(&format!(
            "| Vault Sync | {} ({}) |\n",
            get(sync_signal, "status"),
            get(sync_signal, "timestamp"),
        ));
        out.push_str(&format!(
            "| Pending Cloud Drafts | {} |\n",
            pending_drafts.len()
        ));
        out.push_str(&format!(
            "| In-Progress (Cloud) | {} |\n",
            cloud_in_progress.len()
        ));
        if !pending_drafts.is_empty() {
            out.push_str("\n### Pending Cloud Drafts (awaiting your approval)\n\n");
            for entry in pending_drafts.iter().take(10) {
                out.push_str(&format!("- [ ] `{}`\n", entry.stem));
            }
        }
        out.push_str(&format!(
            "\n_Last merged: {}_\n",
            self.clock.now().format("%Y-%m-%d %H:%M")
        ));
        Ok(out)
    }

    /// Replace the fenced region, creating the dashboard or the markers if
    /// missing. Temp-file + rename keeps readers race-free.
    fn rewrite_dashboard(&self, section: &str) -> Result<(), Failure> {
        let path = self.vault.dashboard_path();
        let current = if path.exists() {
            std::fs::read_to_string(&path)
                .map_err(|err| Failure::transient("failed to read dashboard").with_source(err))?
        } else {
            warn!("Dashboard.md missing, creating a minimal one");
            format!("# Dashboard\n\n{REGION_BEGIN}\n{REGION_END}\n")
        };

        let updated = match (current.find(REGION_BEGIN), current.find(REGION_END)) {
            (Some(begin), Some(end)) if begin < end => {
                let mut updated = String::new();
                updated.push_str(&current[..begin + REGION_BEGIN.len()]);
                updated.push('\n');
                updated.push_str(section);
                updated.push_str(&current[end..]);
                updated
            },
            _ => {
                // No fence yet: append one at the end, non-fenced text
                // untouched.
                let mut updated = current;
                if !updated.ends_with('\n') {
                    updated.push('\n');
                }
                updated.push_str(&format!("\n{REGION_BEGIN}\n{section}{REGION_END}\n"));
                updated
            },
        };

        write_atomic(&path, &updated)
    }

    /// Archive processed `CLOUD_STATUS_*` signals to `Done/`.
    fn archive(&self, cloud_signals: &[(Stem, Signal)]) -> Result<(), Failure> {
        for (stem, _) in cloud_signals {
            let Ok(Some(src)) = self.vault.find(Stage::Signals, stem) else {
                continue;
            };
            let raw = std::fs::read_to_string(&src).unwrap_or_default();
            let archived = Stem::new(format!("SIGNAL_{stem}"));
            self.vault
                .emit_raw(Stage::Done, &archived, "md", &raw)
                .map_err(|err| Failure::transient("failed to archive signal").with_source(err))?;
            std::fs::remove_file(&src)
                .map_err(|err| Failure::transient("failed to clear signal").with_source(err))?;
        }
        Ok(())
    }
}

/// Parse a signal file: frontmatter `key: value` lines plus `- **k**: v`
/// body bullets.
#[must_use]
pub fn parse_signal(raw: &str) -> Signal {
    let mut signal = Signal::new();
    let mut in_frontmatter = false;
    for line in raw.lines() {
        let trimmed = line.trim();
        if trimmed == "---" {
            in_frontmatter = !in_frontmatter;
            continue;
        }
        if in_frontmatter {
            if let Some((key, value)) = trimmed.split_once(':') {
                signal.insert(key.trim().to_string(), value.trim().to_string());
            }
        } else if let Some(rest) = trimmed.strip_prefix("- **") {
            if let Some((key, value)) = rest.split_once("**:") {
                signal.insert(key.trim().to_string(), value.trim().to_string());
            }
        }
    }
    signal
}

/// Write a singleton file via temp + rename.
fn write_atomic(path: &Path, content: &str) -> Result<(), Failure> {
    let tmp = path.with_extension("md.tmp");
    std::fs::write(&tmp, content)
        .map_err(|err| Failure::transient("failed to write dashboard temp").with_source(err))?;
    std::fs::rename(&tmp, path)
        .map_err(|err| Failure::transient("failed to replace dashboard").with_source(err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::retry::SystemClock;

    fn setup() -> (tempfile::TempDir, SignalMerger, Vault) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        vault.ensure_layout().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&clock))
            .with_actor("merge_signals");
        let merger = SignalMerger::new(vault.clone(), ledger, clock, false);
        (dir, merger, vault)
    }

    fn write_cloud_signal(vault: &Vault, name: &str, status: &str) {
        let body = format!(
            "---\nagent: cloud\nstatus: {status}\ntimestamp: 2026-02-03T12:00:00+00:00\n---\n\n\
             - **last_active**: 2026-02-03T12:00:00+00:00\n\
             - **tasks_processed**: 7\n"
        );
        std::fs::write(vault.stage_path(Stage::Signals).join(name), body).unwrap();
    }

    #[test]
    fn test_parse_signal_frontmatter_and_bullets() {
        let signal = parse_signal(
            "---\nstatus: active\n---\n\n# Title\n\n- **tasks_processed**: 3\n",
        );
        assert_eq!(signal.get("status").map(String::as_str), Some("active"));
        assert_eq!(signal.get("tasks_processed").map(String::as_str), Some("3"));
    }

    #[test]
    fn test_merge_updates_only_fenced_region() {
        let (_dir, merger, vault) = setup();
        std::fs::write(
            vault.dashboard_path(),
            format!(
                "# My Dashboard\n\nHand-written intro.\n\n{REGION_BEGIN}\nstale\n{REGION_END}\n\n## Notes\n\nKeep me.\n"
            ),
        )
        .unwrap();
        write_cloud_signal(&vault, "CLOUD_STATUS_20260203120000.md", "active");

        assert_eq!(merger.merge().unwrap(), 1);

        let dashboard = std::fs::read_to_string(vault.dashboard_path()).unwrap();
        assert!(dashboard.contains("Hand-written intro."));
        assert!(dashboard.contains("Keep me."));
        assert!(dashboard.contains("| Status | active |"));
        assert!(!dashboard.contains("stale"));
    }

    #[test]
    fn test_signals_archived_sync_status_stays() {
        let (_dir, merger, vault) = setup();
        write_cloud_signal(&vault, "CLOUD_STATUS_20260203120000.md", "active");
        std::fs::write(
            vault.stage_path(Stage::Signals).join("SYNC_STATUS.md"),
            "---\ntype: sync_status\nstatus: pushed\ntimestamp: 2026-02-03T12:01:00+00:00\n---\n",
        )
        .unwrap();

        assert_eq!(merger.merge().unwrap(), 2);

        let signals = vault.list(Stage::Signals).unwrap();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].stem.as_str(), "SYNC_STATUS");
        let done = vault.list(Stage::Done).unwrap();
        assert_eq!(done.len(), 1);
        assert!(done[0].stem.as_str().starts_with("SIGNAL_CLOUD_STATUS_"));
    }

    #[test]
    fn test_missing_dashboard_created() {
        let (_dir, merger, vault) = setup();
        write_cloud_signal(&vault, "CLOUD_STATUS_20260203120000.md", "active");
        merger.merge().unwrap();
        let dashboard = std::fs::read_to_string(vault.dashboard_path()).unwrap();
        assert!(dashboard.contains(REGION_BEGIN));
        assert!(dashboard.contains("| Status | active |"));
    }
}
