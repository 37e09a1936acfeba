//! Vault primitives: move, claim, release, emit, list, quarantine.
//!
//! All primitives are synchronous and tolerate partial failure: the
//! filesystem rename is the commit point, and any post-commit step that
//! fails is retried from a later scan. There are no in-place rewrites of
//! pending files.

use std::io::Write;
use std::path::PathBuf;

use serde_json::json;
use tracing::{debug, info};

use super::note::{ActionNote, NoteError};
use super::stage::{Peer, Stage};
use super::stem::Stem;
use super::Vault;
use crate::ledger::{EventLog, EventRecord, LedgerError};

/// One file in a stage directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageEntry {
    /// Identity of the note.
    pub stem: Stem,
    /// Absolute path of the file.
    pub path: PathBuf,
}

impl Vault {
    /// List a stage, filename-ascending.
    ///
    /// Hidden files, `.gitkeep`, and subdirectories are skipped, so the
    /// result is exactly the queue content in deterministic order.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage directory cannot be read.
    pub fn list(&self, stage: Stage) -> Result<Vec<StageEntry>, VaultError> {
        let dir = self.stage_path(stage);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        let read = std::fs::read_dir(&dir).map_err(|source| VaultError::Io {
            context: format!("listing {}", dir.display()),
            source,
        })?;
        for entry in read {
            let entry = entry.map_err(|source| VaultError::Io {
                context: format!("listing {}", dir.display()),
                source,
            })?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || name == ".gitkeep" || name.ends_with('~') {
                continue;
            }
            if let Some(stem) = Stem::from_path(&path) {
                entries.push(StageEntry { stem, path });
            }
        }
        entries.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
        Ok(entries)
    }

    /// Locate a stem within one stage, regardless of extension.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage directory cannot be read.
    pub fn find(&self, stage: Stage, stem: &Stem) -> Result<Option<PathBuf>, VaultError> {
        Ok(self
            .list(stage)?
            .into_iter()
            .find(|entry| &entry.stem == stem)
            .map(|entry| entry.path))
    }

    /// Locate a stem anywhere in the vault.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage directory cannot be read.
    pub fn stage_of(&self, stem: &Stem) -> Result<Option<(Stage, PathBuf)>, VaultError> {
        for stage in Stage::ALL {
            if let Some(path) = self.find(*stage, stem)? {
                return Ok(Some((*stage, path)));
            }
        }
        Ok(None)
    }

    /// Move a note between stages, preserving its stem.
    ///
    /// Fails if the destination filename already exists - the vault never
    /// overwrites. Records one `stage_transition` ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when the stem is absent from the
    /// source stage, [`VaultError::Collision`] when the destination name is
    /// taken, and [`VaultError::TerminalSource`] when `from` is `Done/` or
    /// `Rejected/` - terminal stages are absorbing.
    pub fn move_note(
        &self,
        ledger: &EventLog,
        stem: &Stem,
        from: Stage,
        to: Stage,
    ) -> Result<PathBuf, VaultError> {
        if from.is_terminal() {
            return Err(VaultError::TerminalSource { stage: from });
        }
        let src = self
            .find(from, stem)?
            .ok_or_else(|| VaultError::NotFound {
                stem: stem.clone(),
                stage: from,
            })?;
        let file_name = src.file_name().map(std::ffi::OsStr::to_os_string).ok_or_else(|| {
            VaultError::NotFound {
                stem: stem.clone(),
                stage: from,
            }
        })?;
        let dest = self.stage_path(to).join(&file_name);
        if dest.exists() {
            return Err(VaultError::Collision { dest });
        }
        std::fs::rename(&src, &dest).map_err(|source| VaultError::Io {
            context: format!("moving {} -> {}", src.display(), dest.display()),
            source,
        })?;
        info!(stem = %stem, %from, %to, "stage transition");
        ledger.append(
            EventRecord::new("stage_transition", "moved")
                .with_file(stem.as_str())
                .with_detail(json!({ "from": from.to_string(), "to": to.to_string() })),
        )?;
        Ok(dest)
    }

    /// Atomically claim a note from `Needs_Action/` for a peer.
    ///
    /// Returns `Ok(None)` when another peer won the race (the source file
    /// is gone) or the destination already exists - both are normal
    /// outcomes and are not retried.
    ///
    /// # Errors
    ///
    /// Returns an error only for unexpected I/O or ledger failures.
    pub fn claim(
        &self,
        ledger: &EventLog,
        stem: &Stem,
        peer: Peer,
    ) -> Result<Option<PathBuf>, VaultError> {
        let Some(src) = self.find(Stage::NeedsAction, stem)? else {
            debug!(stem = %stem, %peer, "claim miss: no longer pending");
            return Ok(None);
        };
        let file_name = match src.file_name() {
            Some(name) => name.to_os_string(),
            None => return Ok(None),
        };
        let dest = self.stage_path(Stage::InProgress(peer)).join(&file_name);
        if dest.exists() {
            debug!(stem = %stem, %peer, "claim miss: already claimed");
            return Ok(None);
        }
        match std::fs::rename(&src, &dest) {
            Ok(()) => {
                info!(stem = %stem, %peer, "claimed");
                ledger.append(
                    EventRecord::new("task_claimed", "claimed")
                        .with_file(stem.as_str())
                        .with_detail(json!({ "peer": peer.to_string() })),
                )?;
                Ok(Some(dest))
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // Another peer renamed it between find and rename.
                debug!(stem = %stem, %peer, "claim miss: lost the race");
                Ok(None)
            },
            Err(source) => Err(VaultError::Io {
                context: format!("claiming {} for {peer}", stem),
                source,
            }),
        }
    }

    /// Return a claimed note to `Needs_Action/` when the owner cannot
    /// finish it.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotFound`] when the peer does not hold the
    /// claim, [`VaultError::Collision`] when the pending name reappeared.
    pub fn release(
        &self,
        ledger: &EventLog,
        stem: &Stem,
        peer: Peer,
    ) -> Result<PathBuf, VaultError> {
        self.move_note(ledger, stem, Stage::InProgress(peer), Stage::NeedsAction)
    }

    /// Create a new note in a stage.
    ///
    /// If the stem collides with an existing file the name is suffixed
    /// `_2`, `_3`, ... until unique. The file is created with
    /// `create_new`, so two concurrent emitters cannot clobber each other.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn emit(
        &self,
        stage: Stage,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<PathBuf, VaultError> {
        self.emit_raw(stage, stem, "md", &note.render())
    }

    /// Create a new file in a stage from raw content.
    ///
    /// Same collision handling as [`Vault::emit`]; used for error siblings
    /// and signal files that are not action notes.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn emit_raw(
        &self,
        stage: Stage,
        stem: &Stem,
        extension: &str,
        content: &str,
    ) -> Result<PathBuf, VaultError> {
        let dir = self.stage_path(stage);
        std::fs::create_dir_all(&dir).map_err(|source| VaultError::Io {
            context: format!("creating stage directory {}", dir.display()),
            source,
        })?;
        let mut attempt = 1_u32;
        loop {
            let candidate = if attempt == 1 {
                stem.clone()
            } else {
                stem.with_suffix(attempt)
            };
            let path = dir.join(format!("{candidate}.{extension}"));
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    file.write_all(content.as_bytes())
                        .and_then(|()| file.sync_data())
                        .map_err(|source| VaultError::Io {
                            context: format!("writing {}", path.display()),
                            source,
                        })?;
                    debug!(stem = %candidate, stage = %stage, "emitted");
                    return Ok(path);
                },
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    attempt += 1;
                    if attempt > 1000 {
                        return Err(VaultError::Collision { dest: path });
                    }
                },
                Err(source) => {
                    return Err(VaultError::Io {
                        context: format!("creating {}", path.display()),
                        source,
                    });
                },
            }
        }
    }

    /// Quarantine an unprocessable file: move it to `Rejected/` and write a
    /// sibling `<stem>_error.md` describing why.
    ///
    /// # Errors
    ///
    /// Returns an error if the move or sibling write fails.
    pub fn quarantine(
        &self,
        ledger: &EventLog,
        stem: &Stem,
        from: Stage,
        reason: &str,
    ) -> Result<PathBuf, VaultError> {
        let dest = self.move_note(ledger, stem, from, Stage::Rejected)?;
        let sibling = Stem::new(format!("{stem}_error"));
        let body = format!("# Rejected: {stem}\n\n{reason}\n");
        self.emit_raw(Stage::Rejected, &sibling, "md", &body)?;
        ledger.append(
            EventRecord::new("quarantined", "rejected")
                .with_file(stem.as_str())
                .with_detail(json!({ "from": from.to_string(), "reason": reason })),
        )?;
        Ok(dest)
    }
}

/// Errors from vault primitives.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The vault root does not exist. Fatal.
    #[error("vault root missing or not a directory: {}", path.display())]
    RootMissing {
        /// Offending path.
        path: PathBuf,
    },

    /// A stem was not found where an operation expected it.
    #[error("stem {stem} not present in {stage}")]
    NotFound {
        /// The stem.
        stem: Stem,
        /// Stage that was searched.
        stage: Stage,
    },

    /// Destination filename already exists; the vault never overwrites.
    #[error("destination already exists: {}", dest.display())]
    Collision {
        /// The occupied destination path.
        dest: PathBuf,
    },

    /// `Done/` and `Rejected/` are absorbing; nothing moves out of them.
    #[error("cannot move a note out of terminal stage {stage}")]
    TerminalSource {
        /// The terminal stage.
        stage: Stage,
    },

    /// A note could not be parsed.
    #[error("unreadable note: {0}")]
    Note(#[from] NoteError),

    /// The audit ledger rejected a record.
    #[error("ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    /// An I/O error occurred.
    #[error("I/O error while {context}: {source}")]
    Io {
        /// What the operation was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}
