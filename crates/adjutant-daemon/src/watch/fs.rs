//! Inbox filesystem watcher.
//!
//! Watches the vault's `Inbox/` drop folder with native filesystem
//! notifications (polling fallback when the native watcher cannot start).
//! For every dropped file it hoists the payload into `Needs_Action/` and
//! emits a companion `FILE_*` action note describing it, with priority
//! derived from filename keywords.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::Clock;
use adjutant_core::vault::{ActionNote, Preamble, Priority, Stage, Stem, Vault};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tracing::{debug, info, warn};

use super::seen::SeenSet;
use crate::shutdown::ShutdownToken;

/// Delay between a create event and processing, so the writer can finish.
const SETTLE: Duration = Duration::from_millis(500);

/// Extensions the watcher will process; everything else is ignored.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "md", "pdf", "png", "jpg", "jpeg", "csv", "xlsx", "docx", "json", "zip",
];

/// Filename keywords that raise the priority of a dropped file.
const PRIORITY_KEYWORDS: &[(&str, Priority)] = &[
    ("urgent", Priority::P0),
    ("asap", Priority::P0),
    ("important", Priority::P1),
    ("invoice", Priority::P1),
    ("payment", Priority::P1),
    ("contract", Priority::P1),
    ("review", Priority::P2),
    ("report", Priority::P2),
];

/// Priority of a dropped file based on filename keywords.
#[must_use]
pub fn detect_priority(filename: &str) -> Priority {
    let lower = filename.to_ascii_lowercase();
    PRIORITY_KEYWORDS
        .iter()
        .find(|(keyword, _)| lower.contains(keyword))
        .map_or(Priority::P3, |(_, priority)| *priority)
}

/// Human-readable type for a file extension.
#[must_use]
pub fn detect_file_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "pdf" | "docx" => "document",
        "txt" => "text",
        "md" => "note",
        "csv" | "json" => "data",
        "xlsx" => "spreadsheet",
        "png" | "jpg" | "jpeg" => "image",
        "zip" => "archive",
        _ => "file",
    }
}

/// The inbox drop-folder watcher.
pub struct InboxWatcher {
    vault: Vault,
    ledger: EventLog,
    clock: Arc<dyn Clock>,
    dry_run: bool,
    poll_interval: Duration,
    seen: SeenSet,
}

impl InboxWatcher {
    /// Build the watcher.
    #[must_use]
    pub fn new(
        vault: Vault,
        ledger: EventLog,
        config: &AdjutantConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let seen_path = vault.sidecar_dir().join("fswatch_seen.json");
        Self {
            vault,
            ledger,
            clock,
            dry_run: config.dry_run,
            poll_interval: config.orchestrator.poll_interval,
            seen: SeenSet::load(seen_path, config.watcher.seen_cap),
        }
    }

    /// Scan `Inbox/` once and process every eligible new file. Returns the
    /// number of action notes emitted.
    ///
    /// # Errors
    ///
    /// Returns a failure when the inbox cannot be read or a note cannot be
    /// written.
    pub fn scan_once(&mut self) -> Result<usize, Failure> {
        let inbox = self.vault.stage_path(Stage::Inbox);
        if !inbox.is_dir() {
            return Ok(0);
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&inbox)
            .map_err(|err| Failure::transient("failed to read Inbox").with_source(err))?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut emitted = 0;
        for path in paths {
            if self.process_file(&path)? {
                emitted += 1;
            }
        }
        if emitted > 0 {
            self.seen.save()?;
        }
        Ok(emitted)
    }

    /// Process one dropped file. Returns `true` when a note was emitted.
    fn process_file(&mut self, source: &Path) -> Result<bool, Failure> {
        let Some(name) = source.file_name().and_then(|n| n.to_str()) else {
            return Ok(false);
        };
        if name.starts_with('.') || name.starts_with('~') {
            return Ok(false);
        }
        let extension = source
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            debug!(file = name, "skipping unsupported file");
            return Ok(false);
        }

        let metadata = match source.metadata() {
            Ok(metadata) => metadata,
            // Raced with another consumer; the file is gone.
            Err(_) => return Ok(false),
        };
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        let id = format!("{name}:{mtime}:{}", metadata.len());
        if self.seen.contains(&id) {
            return Ok(false);
        }

        let created = self.clock.now();
        let priority = detect_priority(name);
        let file_type = detect_file_type(&extension);
        let topic = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("file");
        let note_stem = Stem::compose("FILE", topic, created);

        if self.dry_run {
            info!(file = name, stem = %note_stem, "dry-run: would emit file_drop note");
            self.seen.insert(id);
            return Ok(true);
        }

        // Hoist the payload into Needs_Action/ beside the note. The `_data`
        // suffix keeps its stem distinct from the note's.
        let payload_stem = Stem::new(format!("{note_stem}_data"));
        let payload_name = format!("{payload_stem}.{extension}");
        let payload_dest = self.vault.stage_path(Stage::NeedsAction).join(&payload_name);
        std::fs::rename(source, &payload_dest)
            .map_err(|err| Failure::transient("failed to hoist inbox file").with_source(err))?;

        let note = ActionNote::new(
            Preamble::new("file_drop", "review_file", created),
            format!(
                "## File Received: {name}\n\n\
                 A new **{file_type}** file was dropped into the Inbox.\n\n\
                 | Field | Value |\n|-------|-------|\n\
                 | Original Name | `{name}` |\n\
                 | Type | {file_type} |\n\
                 | Size | {} bytes |\n\
                 | Priority | {priority} |\n\
                 | Payload | `Needs_Action/{payload_name}` |\n",
                metadata.len()
            ),
        )
        .with_priority(priority)
        .with_field("source", "inbox")
        .with_field("original_name", name)
        .with_field("file_type", file_type)
        .with_field("file_size_bytes", metadata.len().to_string())
        .with_field("payload", payload_name.as_str());

        let emitted_path = self
            .vault
            .emit(Stage::NeedsAction, &note_stem, &note)
            .map_err(|err| Failure::transient("failed to emit action note").with_source(err))?;

        self.ledger
            .append(
                EventRecord::new("file_drop", "action_note_emitted")
                    .with_file(note_stem.as_str())
                    .with_detail(json!({
                        "original_name": name,
                        "file_type": file_type,
                        "file_size_bytes": metadata.len(),
                        "priority": priority.as_str(),
                        "payload": payload_name,
                    })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;

        info!(file = name, note = %emitted_path.display(), "inbox file processed");
        self.seen.insert(id);
        Ok(true)
    }

    /// Run until shutdown: native notifications when available, with a
    /// periodic fallback scan either way.
    ///
    /// # Errors
    ///
    /// Returns the failure that stopped the watcher.
    pub async fn run(&mut self, mut token: ShutdownToken) -> Result<(), Failure> {
        let inbox = self.vault.stage_path(Stage::Inbox);
        info!(inbox = %inbox.display(), "inbox watcher started");

        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(64);
        let _watcher = match start_notify(&inbox, tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = %err, "native watcher unavailable, polling only");
                None
            },
        };

        // Catch up on anything dropped while we were down.
        self.scan_once()?;

        loop {
            tokio::select! {
                event = rx.recv() => {
                    if event.is_some() {
                        // Let the writer finish, then drain coalesced events
                        // with a single scan.
                        tokio::time::sleep(SETTLE).await;
                        while rx.try_recv().is_ok() {}
                        self.scan_once()?;
                    }
                },
                () = tokio::time::sleep(self.poll_interval) => {
                    self.scan_once()?;
                },
                () = token.triggered() => break,
            }
        }
        info!("inbox watcher stopped");
        Ok(())
    }
}

/// Start the native watcher; events are squashed to unit pings.
fn start_notify(
    inbox: &Path,
    tx: tokio::sync::mpsc::Sender<()>,
) -> Result<RecommendedWatcher, notify::Error> {
    let mut watcher = RecommendedWatcher::new(
        move |result: Result<notify::Event, notify::Error>| {
            if let Ok(event) = result {
                if matches!(
                    event.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    let _ = tx.blocking_send(());
                }
            }
        },
        NotifyConfig::default(),
    )?;
    watcher.watch(inbox, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
