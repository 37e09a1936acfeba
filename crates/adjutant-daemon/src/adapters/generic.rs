//! Generic fallback adapter.
//!
//! Approved files no automated adapter can execute still need the human to
//! act: the fallback writes a `NEEDS_MANUAL_ACTION` notice into
//! `Needs_Action/` so the owner is alerted, then lets the router archive
//! the approval to `Done/`. No external side-effect is performed.

use adjutant_core::error::Failure;
use adjutant_core::ledger::EventRecord;
use adjutant_core::vault::{ActionNote, NoteStatus, Preamble, Priority, Stage, Stem};
use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

use super::{Adapter, DispatchContext, Outcome, Route};

/// The fallback adapter; always matches.
pub struct GenericAdapter;

#[async_trait]
impl Adapter for GenericAdapter {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn channel(&self) -> Option<&'static str> {
        None
    }

    fn matches(&self, _route: &Route) -> bool {
        true
    }

    async fn dispatch(
        &self,
        ctx: &DispatchContext,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<Outcome, Failure> {
        let action = if note.preamble.action.is_empty() {
            "unknown"
        } else {
            note.preamble.action.as_str()
        };
        warn!(
            stem = %stem,
            action,
            "no automated adapter; writing manual-action notice"
        );

        if !ctx.dry_run {
            let created = note.preamble.created;
            let notice_stem = Stem::compose("NEEDS_MANUAL_ACTION", stem.as_str(), created);
            let notice = ActionNote::new(
                Preamble::new("manual_action_required", action, created),
                format!(
                    "# Manual Action Required\n\n\
                     This action was **approved** but has **no automated adapter**.\n\
                     Complete it manually.\n\n\
                     ## Action\n\n\
                     **Type:** `{}`\n\
                     **Approval file:** `{stem}`\n\n\
                     ## Original Approval\n\n{}\n",
                    note.preamble.note_type, note.body
                ),
            )
            .with_priority(Priority::P1)
            .with_status(NoteStatus::Pending)
            .with_field("source_file", stem.as_str());
            ctx.vault
                .emit(Stage::NeedsAction, &notice_stem, &notice)
                .map_err(|err| {
                    Failure::transient("failed to write manual-action notice").with_source(err)
                })?;
        }

        ctx.ledger
            .append(
                EventRecord::new("manual_action_required", "drafted")
                    .with_file(stem.as_str())
                    .with_action(action)
                    .with_detail(json!({
                        "reason": "no automated adapter for this action",
                    })),
            )
            .map_err(|err| Failure::transient("ledger append failed").with_source(err))?;

        Ok(Outcome::Drafted)
    }
}
