//! Vault state machine: the directory-as-queue protocol.
//!
//! A vault is a rooted directory containing a fixed set of stage
//! directories. Every stage is a queue ordered only by filename, and the
//! vault's state is the cross-product of filenames present in each stage.
//! All mutation goes through a handful of primitives where the filesystem
//! rename is the commit point:
//!
//! - [`Vault::move_note`]: rename preserving the stem; never overwrites
//! - [`Vault::claim`] / [`Vault::release`]: atomic
//!   `Needs_Action <-> In_Progress/<peer>` moves; losing a claim race is a
//!   normal outcome, not an error
//! - [`Vault::emit`]: create a new note, resolving stem collisions with a
//!   `_N` suffix
//! - [`Vault::quarantine`]: the integrity escape hatch - move to
//!   `Rejected/` with a sibling error record
//!
//! # Invariants
//!
//! - Files only move between stages or are created; nothing is deleted
//! - A given stem exists in at most one stage at a time
//! - `Done/` and `Rejected/` are absorbing
//! - A note in `In_Progress/<peer>/` is owned by exactly that peer
//! - Every stage transition appends one ledger record

mod note;
mod ops;
mod stage;
mod stem;


pub use note::{ActionNote, NoteError, NoteStatus, Preamble, Priority};
pub use ops::{StageEntry, VaultError};
pub use stage::{Peer, Stage};
pub use stem::Stem;

use std::path::{Path, PathBuf};

/// Handle to a vault root.
///
/// Cheap to clone; owns no open resources. Opening validates that the root
/// exists (a missing root is a fatal configuration error), while missing
/// stage directories are created lazily by [`Vault::ensure_layout`].
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    /// Open a vault at the given root.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::RootMissing`] if the root does not exist or is
    /// not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, VaultError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(VaultError::RootMissing { path: root });
        }
        Ok(Self { root })
    }

    /// Create every missing stage directory and the sidecar directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<(), VaultError> {
        for stage in Stage::ALL {
            let path = self.stage_path(*stage);
            std::fs::create_dir_all(&path).map_err(|source| VaultError::Io {
                context: format!("creating stage directory {}", path.display()),
                source,
            })?;
        }
        let sidecars = self.sidecar_dir();
        std::fs::create_dir_all(&sidecars).map_err(|source| VaultError::Io {
            context: format!("creating sidecar directory {}", sidecars.display()),
            source,
        })?;
        Ok(())
    }

    /// The vault root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a stage directory.
    #[must_use]
    pub fn stage_path(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.rel_path())
    }

    /// The `Dashboard.md` singleton.
    #[must_use]
    pub fn dashboard_path(&self) -> PathBuf {
        self.root.join("Dashboard.md")
    }

    /// The `Company_Handbook.md` singleton.
    #[must_use]
    pub fn handbook_path(&self) -> PathBuf {
        self.root.join("Company_Handbook.md")
    }

    /// The `Business_Goals.md` singleton.
    #[must_use]
    pub fn business_goals_path(&self) -> PathBuf {
        self.root.join("Business_Goals.md")
    }

    /// Directory for per-watcher seen-set sidecars and other non-synced
    /// process state.
    #[must_use]
    pub fn sidecar_dir(&self) -> PathBuf {
        self.root.join(".adjutant")
    }
}
