//! Stage and peer identifiers.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// An orchestrator peer sharing the vault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Peer {
    /// The machine next to the human; executes approved sends.
    Local,
    /// The always-on VM; drafts only.
    Cloud,
}

impl Peer {
    /// Lowercase directory name under `In_Progress/`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cloud => "cloud",
        }
    }

    /// The other peer.
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Local => Self::Cloud,
            Self::Cloud => Self::Local,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vault stage directory.
///
/// Stage names are part of the external contract - the human operator and
/// the reasoning layer both read and write against them - so the `Display`
/// form is the on-disk directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Raw drop folder for external material.
    Inbox,
    /// Work queue: pending action notes.
    NeedsAction,
    /// Claimed work, owned by one peer.
    InProgress(Peer),
    /// Reasoning-layer plans.
    Plans,
    /// Drafts awaiting the human approval gate.
    PendingApproval,
    /// Human-approved actions ready for dispatch.
    Approved,
    /// Terminal: rejected, expired, or quarantined notes.
    Rejected,
    /// Terminal: completed work.
    Done,
    /// Daily JSON-lines audit records.
    Logs,
    /// Generated briefings.
    Briefings,
    /// Transaction records.
    Accounting,
    /// Peer status signals.
    Signals,
}

impl Stage {
    /// Every stage, in lifecycle order. `ensure_layout` iterates this.
    pub const ALL: &'static [Self] = &[
        Self::Inbox,
        Self::NeedsAction,
        Self::InProgress(Peer::Local),
        Self::InProgress(Peer::Cloud),
        Self::Plans,
        Self::PendingApproval,
        Self::Approved,
        Self::Rejected,
        Self::Done,
        Self::Logs,
        Self::Briefings,
        Self::Accounting,
        Self::Signals,
    ];

    /// Path of this stage relative to the vault root.
    #[must_use]
    pub fn rel_path(self) -> PathBuf {
        match self {
            Self::InProgress(peer) => PathBuf::from("In_Progress").join(peer.as_str()),
            other => PathBuf::from(other.dir_name()),
        }
    }

    /// Directory name as written on disk (`In_Progress` for either peer).
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            Self::Inbox => "Inbox",
            Self::NeedsAction => "Needs_Action",
            Self::InProgress(_) => "In_Progress",
            Self::Plans => "Plans",
            Self::PendingApproval => "Pending_Approval",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Done => "Done",
            Self::Logs => "Logs",
            Self::Briefings => "Briefings",
            Self::Accounting => "Accounting",
            Self::Signals => "Signals",
        }
    }

    /// Whether notes never leave this stage.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Rejected)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InProgress(peer) => write!(f, "In_Progress/{peer}"),
            other => f.write_str(other.dir_name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rel_paths() {
        assert_eq!(Stage::NeedsAction.rel_path(), PathBuf::from("Needs_Action"));
        assert_eq!(
            Stage::InProgress(Peer::Cloud).rel_path(),
            PathBuf::from("In_Progress/cloud")
        );
    }

    #[test]
    fn test_terminality() {
        assert!(Stage::Done.is_terminal());
        assert!(Stage::Rejected.is_terminal());
        assert!(!Stage::Approved.is_terminal());
        assert!(!Stage::InProgress(Peer::Local).is_terminal());
    }

    #[test]
    fn test_display_matches_contract() {
        assert_eq!(Stage::PendingApproval.to_string(), "Pending_Approval");
        assert_eq!(
            Stage::InProgress(Peer::Local).to_string(),
            "In_Progress/local"
        );
    }

    #[test]
    fn test_all_covers_both_peers() {
        assert!(Stage::ALL.contains(&Stage::InProgress(Peer::Local)));
        assert!(Stage::ALL.contains(&Stage::InProgress(Peer::Cloud)));
    }
}
