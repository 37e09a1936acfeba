//! Policy gate: handbook rules re-checked at dispatch time.
//!
//! Human approval is necessary but not sufficient. Even for files found in
//! `Approved/`, the orchestrator re-checks the handbook rules before any
//! external side-effect:
//!
//! - **Expiry**: a note whose `expires` deadline has passed is rejected
//! - **Amount threshold**: amounts above the configured limit require
//!   evidence that the note actually passed through `Pending_Approval/` -
//!   a `stage_transition` ledger record touching that stage, or an
//!   `APPROVAL_*` stem. A note written straight into `Approved/` by a
//!   misbehaving writer fails this check and never reaches an adapter.
//!
//! Rate limits are enforced separately by the router's token buckets;
//! policy rejections are final (no retry), rate-limit misses defer.

use chrono::{DateTime, Utc};

use crate::config::OrchestratorConfig;
use crate::ledger::{EventLog, LedgerError};
use crate::vault::{ActionNote, Stage, Stem};

/// Outcome of the policy gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// The note may be dispatched.
    Allow,
    /// The note must move to `Rejected/`; no adapter is invoked.
    Reject {
        /// Ledger `event_type` for the rejection.
        event: &'static str,
        /// Human-readable reason, written to the error sibling.
        reason: String,
    },
}

/// The policy gate.
#[derive(Debug, Clone)]
pub struct PolicyGate {
    amount_limit: f64,
    lookback_days: u32,
}

impl PolicyGate {
    /// Build the gate from orchestrator configuration.
    #[must_use]
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            amount_limit: config.approval_amount_limit,
            lookback_days: config.approval_lookback_days,
        }
    }

    /// Evaluate a note that is sitting in `Approved/`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ledger cannot be read while gathering
    /// approval evidence.
    pub fn evaluate(
        &self,
        stem: &Stem,
        note: &ActionNote,
        ledger: &EventLog,
        now: DateTime<Utc>,
    ) -> Result<PolicyDecision, LedgerError> {
        if note.preamble.is_expired(now) {
            let deadline = note
                .preamble
                .expires
                .map_or_else(String::new, |at| at.to_rfc3339());
            return Ok(PolicyDecision::Reject {
                event: "approval_expired",
                reason: format!("approval expired at {deadline}"),
            });
        }

        if let Some(amount) = note.preamble.amount() {
            if amount > self.amount_limit && !self.has_approval_evidence(stem, ledger)? {
                return Ok(PolicyDecision::Reject {
                    event: "approval_missing",
                    reason: format!(
                        "amount {amount:.2} exceeds the {:.2} threshold with no \
                         prior approval record",
                        self.amount_limit
                    ),
                });
            }
        }

        Ok(PolicyDecision::Allow)
    }

    /// Whether the ledger shows the stem passing through the approval gate.
    fn has_approval_evidence(&self, stem: &Stem, ledger: &EventLog) -> Result<bool, LedgerError> {
        if stem.is_approval() {
            return Ok(true);
        }
        let pending = Stage::PendingApproval.to_string();
        let records = ledger.records_for_stem(stem, self.lookback_days)?;
        Ok(records.iter().any(|record| {
            record.event_type == "stage_transition"
                && record.detail.as_ref().is_some_and(|detail| {
                    detail.get("from").and_then(|v| v.as_str()) == Some(pending.as_str())
                        || detail.get("to").and_then(|v| v.as_str()) == Some(pending.as_str())
                })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EventRecord;
    use crate::retry::{Clock, FixedClock};
    use crate::vault::Preamble;
    use std::sync::Arc;

    fn gate() -> PolicyGate {
        PolicyGate::from_config(&OrchestratorConfig::default())
    }

    fn setup() -> (tempfile::TempDir, EventLog, DateTime<Utc>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let now = clock.now();
        let ledger = EventLog::new(dir.path(), clock as Arc<dyn Clock>).with_actor("test");
        (dir, ledger, now)
    }

    fn note(created: DateTime<Utc>) -> ActionNote {
        ActionNote::new(Preamble::new("invoice", "send_email", created), "body")
    }

    #[test]
    fn test_expired_note_rejected() {
        let (_dir, ledger, now) = setup();
        let expired = note(now).with_expires(now - chrono::Duration::hours(1));
        let stem = Stem::new("EMAIL_x_20260101000000");
        let decision = gate().evaluate(&stem, &expired, &ledger, now).unwrap();
        assert!(matches!(
            decision,
            PolicyDecision::Reject {
                event: "approval_expired",
                ..
            }
        ));
    }

    #[test]
    fn test_large_amount_without_evidence_rejected() {
        let (_dir, ledger, now) = setup();
        let invoice = note(now).with_field("amount", "1500");
        let stem = Stem::new("EMAIL_invoice_20260101000000");
        let decision = gate().evaluate(&stem, &invoice, &ledger, now).unwrap();
        assert!(matches!(
            decision,
            PolicyDecision::Reject {
                event: "approval_missing",
                ..
            }
        ));
    }

    #[test]
    fn test_large_amount_with_ledger_evidence_allowed() {
        let (_dir, ledger, now) = setup();
        let stem = Stem::new("EMAIL_invoice_20260101000000");
        ledger
            .append(
                EventRecord::new("stage_transition", "moved")
                    .with_file(stem.as_str())
                    .with_detail(serde_json::json!({
                        "from": "Pending_Approval",
                        "to": "Approved",
                    })),
            )
            .unwrap();
        let invoice = note(now).with_field("amount", "1500");
        let decision = gate().evaluate(&stem, &invoice, &ledger, now).unwrap();
        assert_eq!(decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_approval_stem_is_evidence() {
        let (_dir, ledger, now) = setup();
        let stem = Stem::new("APPROVAL_ODOO_20260101000000");
        let invoice = note(now).with_field("amount", "9000");
        let decision = gate().evaluate(&stem, &invoice, &ledger, now).unwrap();
        assert_eq!(decision, PolicyDecision::Allow);
    }

    #[test]
    fn test_small_amount_allowed() {
        let (_dir, ledger, now) = setup();
        let stem = Stem::new("EMAIL_receipt_20260101000000");
        let small = note(now).with_field("amount", "42.50");
        let decision = gate().evaluate(&stem, &small, &ledger, now).unwrap();
        assert_eq!(decision, PolicyDecision::Allow);
    }
}
