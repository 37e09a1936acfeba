//! End-to-end orchestrator scenarios over a temp vault: the approval
//! gate, the amount-threshold policy, rate-limit deferral, expiry sweep,
//! and send-now idempotence.

use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::{Clock, FixedClock};
use adjutant_core::vault::{ActionNote, NoteStatus, Preamble, Stage, Stem, Vault};
use adjutant_daemon::adapters::AdapterSet;
use adjutant_daemon::router::Router;
use chrono::{TimeZone, Utc};

struct Harness {
    _dir: tempfile::TempDir,
    vault: Vault,
    ledger: EventLog,
    clock: Arc<FixedClock>,
    router: Arc<Router>,
}

fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let vault = Vault::open(dir.path()).unwrap();
    vault.ensure_layout().unwrap();
    let clock = Arc::new(FixedClock::new(start_time()));
    let dyn_clock: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&dyn_clock))
        .with_actor("orchestrator");
    let config = AdjutantConfig::default();
    let adapters = AdapterSet::from_config(&config);
    let router = Router::new(
        vault.clone(),
        ledger.clone(),
        adapters,
        config,
        dyn_clock,
    );
    Harness {
        _dir: dir,
        vault,
        ledger,
        clock,
        router,
    }
}

fn ledger_records(h: &Harness) -> Vec<EventRecord> {
    h.ledger
        .read_day(h.clock.now().date_naive())
        .unwrap()
}

fn email_note(amount: Option<&str>) -> ActionNote {
    let mut note = ActionNote::new(
        Preamble::new("invoice", "send_email", start_time()),
        "## Reply\n\nPlease find the invoice attached.\n",
    )
    .with_field("email", "client@example.com")
    .with_field("subject", "Invoice");
    if let Some(amount) = amount {
        note = note.with_field("amount", amount);
        note = note.with_field("currency", "USD");
    }
    note
}

/// Invoice approval gate: a draft that went through Pending_Approval/ and
/// was moved to Approved/ by the human is dispatched and archived.
#[tokio::test]
async fn approved_invoice_is_dispatched_and_archived() {
    let h = harness();
    let stem = Stem::new("APPROVAL_invoice_20260203115900");
    h.vault
        .emit(Stage::PendingApproval, &stem, &email_note(Some("1500")))
        .unwrap();

    // The human moves the file into Approved/.
    h.vault
        .move_note(&h.ledger, &stem, Stage::PendingApproval, Stage::Approved)
        .unwrap();

    let terminal = h.router.scan_approved().await.unwrap();
    assert_eq!(terminal, 1);
    assert!(h.vault.find(Stage::Done, &stem).unwrap().is_some());
    assert!(h.vault.find(Stage::Approved, &stem).unwrap().is_none());

    let records = ledger_records(&h);
    let dispatch = records
        .iter()
        .find(|r| r.event_type == "adapter_dispatch")
        .expect("dispatch record");
    assert_eq!(dispatch.action.as_deref(), Some("send_email"));
    assert_eq!(dispatch.result, "sent");
    assert_eq!(dispatch.file.as_deref(), Some(stem.as_str()));
}

/// Amount-threshold rejection: a large amount written straight into
/// Approved/ with no prior-approval evidence never reaches an adapter.
#[tokio::test]
async fn unapproved_large_amount_is_rejected() {
    let h = harness();
    let stem = Stem::new("EMAIL_invoice_20260203115900");
    h.vault
        .emit(Stage::Approved, &stem, &email_note(Some("1500")))
        .unwrap();

    h.router.scan_approved().await.unwrap();

    assert!(h.vault.find(Stage::Rejected, &stem).unwrap().is_some());
    assert!(h.vault.find(Stage::Done, &stem).unwrap().is_none());
    let sibling = h
        .vault
        .stage_path(Stage::Rejected)
        .join(format!("{stem}_error.md"));
    assert!(sibling.exists());

    let records = ledger_records(&h);
    assert!(records.iter().any(|r| r.event_type == "approval_missing"));
    assert!(!records.iter().any(|r| r.event_type == "adapter_dispatch"));
}

/// A small amount needs no prior approval record.
#[tokio::test]
async fn small_amount_passes_without_approval_record() {
    let h = harness();
    let stem = Stem::new("EMAIL_receipt_20260203115900");
    h.vault
        .emit(Stage::Approved, &stem, &email_note(Some("42.50")))
        .unwrap();

    h.router.scan_approved().await.unwrap();
    assert!(h.vault.find(Stage::Done, &stem).unwrap().is_some());
}

/// Rate-limit deferral: eleven approved emails in one hour - the first
/// ten reach Done/, the eleventh stays in Approved/ until the next hour
/// tick, then completes.
#[tokio::test]
async fn eleventh_email_defers_until_the_hour_refills() {
    let h = harness();
    for i in 0..11 {
        let stem = Stem::new(format!("EMAIL_batch{i:02}_202602031159{i:02}"));
        h.vault
            .emit(Stage::Approved, &stem, &email_note(None))
            .unwrap();
    }

    h.router.scan_approved().await.unwrap();
    assert_eq!(h.vault.list(Stage::Done).unwrap().len(), 10);
    assert_eq!(h.vault.list(Stage::Approved).unwrap().len(), 1);

    let records = ledger_records(&h);
    assert!(records
        .iter()
        .any(|r| r.event_type == "dispatch_deferred" && r.result == "deferred"));

    // Next hour: the bucket refills and the deferral cooldown has passed.
    h.clock.advance(Duration::from_secs(3601));
    h.router.scan_approved().await.unwrap();
    assert_eq!(h.vault.list(Stage::Done).unwrap().len(), 11);
    assert!(h.vault.list(Stage::Approved).unwrap().is_empty());
}

/// Expiry sweep: a pending approval whose deadline passed moves to
/// Rejected/ with an `approval_expired` record; no adapter is invoked.
#[tokio::test]
async fn expired_pending_approval_is_swept() {
    let h = harness();
    let stem = Stem::new("APPROVAL_post_20260203110000");
    let note = email_note(None).with_expires(start_time() - chrono::Duration::hours(1));
    h.vault.emit(Stage::PendingApproval, &stem, &note).unwrap();

    let swept = h.router.sweep_expired().unwrap();
    assert_eq!(swept, 1);
    assert!(h.vault.find(Stage::Rejected, &stem).unwrap().is_some());

    let records = ledger_records(&h);
    assert!(records.iter().any(|r| r.event_type == "approval_expired"));
}

/// An expired file sitting in Approved/ is also rejected before dispatch.
#[tokio::test]
async fn expired_approved_file_never_sends() {
    let h = harness();
    let stem = Stem::new("EMAIL_late_20260203110000");
    let note = email_note(None).with_expires(start_time() - chrono::Duration::minutes(1));
    h.vault.emit(Stage::Approved, &stem, &note).unwrap();

    h.router.scan_approved().await.unwrap();

    assert!(h.vault.find(Stage::Rejected, &stem).unwrap().is_some());
    let records = ledger_records(&h);
    assert!(!records
        .iter()
        .any(|r| r.event_type == "adapter_dispatch" && r.result == "sent"));
}

/// `--send-now` on a file already in Done/ is a no-op.
#[tokio::test]
async fn send_now_is_idempotent_for_done_files() {
    let h = harness();
    let stem = Stem::new("EMAIL_done_20260203110000");
    h.vault
        .emit(Stage::Done, &stem, &email_note(None))
        .unwrap();

    let before = ledger_records(&h).len();
    h.router
        .send_now(std::path::Path::new("EMAIL_done_20260203110000.md"))
        .await
        .unwrap();
    let after = ledger_records(&h).len();
    assert_eq!(before, after, "no new records for a done file");
    assert_eq!(h.vault.list(Stage::Done).unwrap().len(), 1);
}

/// An approved file with an unreadable preamble is quarantined, not lost.
#[tokio::test]
async fn unreadable_approved_file_is_quarantined() {
    let h = harness();
    let path = h
        .vault
        .stage_path(Stage::Approved)
        .join("EMAIL_garbled_20260203110000.md");
    std::fs::write(&path, "not a preamble at all").unwrap();

    h.router.scan_approved().await.unwrap();

    let stem = Stem::new("EMAIL_garbled_20260203110000");
    assert!(h.vault.find(Stage::Rejected, &stem).unwrap().is_some());
    let records = ledger_records(&h);
    assert!(records.iter().any(|r| r.event_type == "quarantined"));
}

/// Unknown actions fall through to the generic adapter: a manual-action
/// notice lands in Needs_Action/ and the approval is archived.
#[tokio::test]
async fn unknown_action_takes_generic_path() {
    let h = harness();
    let stem = Stem::new("MYSTERY_task_20260203110000");
    let note = ActionNote::new(
        Preamble::new("mystery", "do_the_thing", start_time()),
        "details",
    )
    .with_status(NoteStatus::Approved);
    h.vault.emit(Stage::Approved, &stem, &note).unwrap();

    h.router.scan_approved().await.unwrap();

    assert!(h.vault.find(Stage::Done, &stem).unwrap().is_some());
    let pending = h.vault.list(Stage::NeedsAction).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].stem.as_str().starts_with("NEEDS_MANUAL_ACTION_"));

    let records = ledger_records(&h);
    let dispatch = records
        .iter()
        .find(|r| r.event_type == "adapter_dispatch")
        .expect("dispatch record");
    assert_eq!(dispatch.result, "drafted");
}
