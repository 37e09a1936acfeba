//! Claim-by-move protocol helpers shared by both peers.
//!
//! Two peer orchestrators share one vault. Each polls `Needs_Action/` and
//! attempts an atomic claim; because the underlying operation is a single
//! rename, only one peer succeeds. A peer that claims a note outside its
//! work zone releases it immediately. Stale claims left by a crashed peer
//! are swept back to `Needs_Action/` by the opposite peer once their
//! files' mtime exceeds the claim TTL.

use std::time::Duration;

use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::vault::{Peer, Stage, Stem, Vault};
use serde_json::json;
use tracing::{info, warn};

/// Stem prefixes the cloud peer must never touch.
const CLOUD_FORBIDDEN_PREFIXES: &[&str] = &["WHATSAPP_", "PAYMENT_", "BANKING_"];

/// Actions the cloud peer must never perform.
const CLOUD_FORBIDDEN_ACTIONS: &[&str] = &[
    "send_whatsapp",
    "whatsapp_message",
    "process_payment",
    "bank_transfer",
];

/// Whether a note is outside the cloud peer's work zone.
#[must_use]
pub fn forbidden_for_cloud(stem: &Stem, action: &str) -> bool {
    CLOUD_FORBIDDEN_PREFIXES
        .iter()
        .any(|prefix| stem.has_prefix(prefix))
        || CLOUD_FORBIDDEN_ACTIONS.contains(&action)
}

/// Whether the stem is currently claimed by any peer.
///
/// # Errors
///
/// Returns an error if an `In_Progress/` directory cannot be read.
pub fn claimed_anywhere(vault: &Vault, stem: &Stem) -> Result<bool, Failure> {
    for peer in [Peer::Local, Peer::Cloud] {
        if vault
            .find(Stage::InProgress(peer), stem)
            .map_err(|err| Failure::transient("failed to scan In_Progress").with_source(err))?
            .is_some()
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Sweep stale claims of the given (usually opposite) peer back to
/// `Needs_Action/`. Staleness is judged by file mtime against the TTL.
/// Returns the number of notes swept.
///
/// # Errors
///
/// Returns an error if the claim directory cannot be read.
pub fn sweep_stale_claims(
    vault: &Vault,
    ledger: &EventLog,
    owner: Peer,
    ttl: Duration,
) -> Result<usize, Failure> {
    let entries = vault
        .list(Stage::InProgress(owner))
        .map_err(|err| Failure::transient("failed to list In_Progress").with_source(err))?;
    let mut swept = 0;
    for entry in entries {
        let stale = entry
            .path
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .is_some_and(|age| age >= ttl);
        if !stale {
            continue;
        }
        match vault.move_note(ledger, &entry.stem, Stage::InProgress(owner), Stage::NeedsAction)
        {
            Ok(_) => {
                info!(stem = %entry.stem, %owner, "stale claim swept back");
                ledger
                    .append(
                        EventRecord::new("claim_swept", "released")
                            .with_file(entry.stem.as_str())
                            .with_detail(json!({ "peer": owner.to_string() })),
                    )
                    .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
                swept += 1;
            },
            Err(err) => {
                // The crashed peer may have come back; leave it alone.
                warn!(stem = %entry.stem, %owner, error = %err, "sweep skipped");
            },
        }
    }
    Ok(swept)
}
