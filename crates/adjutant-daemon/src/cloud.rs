//! Cloud peer: claims pending work, drafts, and signals.
//!
//! Runs 24/7 on the always-on machine. It claims notes from
//! `Needs_Action/` by atomic move into `In_Progress/cloud/`, drafts email
//! replies and social posts as `CLOUD_DRAFT_*` files into
//! `Pending_Approval/`, and publishes status signals into `Signals/`.
//!
//! Work-zone restrictions, enforced:
//!
//! - never touches WhatsApp, payment, or banking work (released on sight)
//! - never writes `Dashboard.md` or `Done/` for external-action files
//! - never executes approved sends - the local peer does that
//! - drafts only; everything is HITL-gated through `Pending_Approval/`

use std::sync::Arc;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::Failure;
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::Clock;
use adjutant_core::vault::{
    ActionNote, NoteStatus, Peer, Preamble, Stage, Stem, Vault,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::claims::{claimed_anywhere, forbidden_for_cloud, sweep_stale_claims};
use crate::shutdown::ShutdownToken;

/// The cloud peer agent.
pub struct CloudAgent {
    vault: Vault,
    ledger: EventLog,
    clock: Arc<dyn Clock>,
    config: AdjutantConfig,
    tasks_total: usize,
}

impl CloudAgent {
    /// Build the agent.
    #[must_use]
    pub fn new(
        vault: Vault,
        ledger: EventLog,
        config: AdjutantConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            vault,
            ledger,
            clock,
            config,
            tasks_total: 0,
        }
    }

    /// One pass: sweep the local peer's stale claims, then claim and
    /// process every eligible pending note. Returns the number processed.
    ///
    /// # Errors
    ///
    /// Returns an error for vault-level failures; per-note draft errors
    /// release the note and continue.
    pub fn run_once(&mut self) -> Result<usize, Failure> {
        sweep_stale_claims(
            &self.vault,
            &self.ledger,
            Peer::Local,
            self.config.cloud.claim_ttl,
        )?;

        let entries = self
            .vault
            .list(Stage::NeedsAction)
            .map_err(|err| Failure::transient("failed to list Needs_Action").with_source(err))?;

        let mut processed = 0;
        for entry in entries {
            if claimed_anywhere(&self.vault, &entry.stem)? {
                continue;
            }
            if self.config.dry_run {
                info!(stem = %entry.stem, "dry-run: would claim");
                continue;
            }
            let Some(claimed_path) = self
                .vault
                .claim(&self.ledger, &entry.stem, Peer::Cloud)
                .map_err(|err| Failure::transient("claim failed").with_source(err))?
            else {
                continue; // the local peer won
            };
            self.route(&entry.stem, &claimed_path)?;
            processed += 1;
        }
        self.tasks_total += processed;
        Ok(processed)
    }

    /// Decide what to do with a claimed note.
    fn route(&self, stem: &Stem, path: &std::path::Path) -> Result<(), Failure> {
        let note = match std::fs::read_to_string(path)
            .map_err(|err| err.to_string())
            .and_then(|raw| ActionNote::parse(&raw).map_err(|err| err.to_string()))
        {
            Ok(note) => note,
            Err(reason) => {
                warn!(stem = %stem, %reason, "unreadable claimed note, quarantining");
                self.vault
                    .quarantine(&self.ledger, stem, Stage::InProgress(Peer::Cloud), &reason)
                    .map_err(|err| Failure::transient("quarantine failed").with_source(err))?;
                return Ok(());
            },
        };
        let action = note.preamble.action.as_str();

        if forbidden_for_cloud(stem, action) {
            info!(stem = %stem, action, "cloud-forbidden work zone, releasing");
            self.log_event(
                EventRecord::new("task_skipped_cloud_forbidden", "released")
                    .with_file(stem.as_str())
                    .with_action(action),
            )?;
            self.release(stem)?;
            return Ok(());
        }

        let stem_upper = stem.as_str().to_ascii_uppercase();
        let is_email = stem_upper.starts_with("EMAIL_")
            || matches!(
                note.preamble.note_type.as_str(),
                "email" | "email_action" | "inbound_email" | "gmail_message"
            )
            || matches!(action, "reply_email" | "triage_email" | "send_email");
        let is_social_post = ["LINKEDIN_", "TWITTER_", "FACEBOOK_", "INSTAGRAM_", "SOCIAL_"]
            .iter()
            .any(|prefix| stem_upper.starts_with(prefix))
            || matches!(
                note.preamble.note_type.as_str(),
                "social_post_request" | "post_request"
            )
            || action.starts_with("post_to_")
            || action == "social_post";

        if is_email {
            self.draft_email_reply(stem, &note)
        } else if is_social_post {
            self.draft_social_post(stem, &note)
        } else {
            debug!(stem = %stem, action, "no cloud handler, releasing for local");
            self.log_event(
                EventRecord::new("task_no_cloud_handler", "released")
                    .with_file(stem.as_str())
                    .with_action(action),
            )?;
            self.release(stem)
        }
    }

    /// Draft a reply for an inbound email and park it for approval.
    fn draft_email_reply(&self, stem: &Stem, source: &ActionNote) -> Result<(), Failure> {
        let now = self.clock.now();
        let sender = source.preamble.get("sender").unwrap_or("Unknown Sender");
        let email = source.preamble.get("email").unwrap_or("");
        let subject = source.preamble.get("subject").unwrap_or("Re: Your message");
        let summary = source.preamble.get("summary").unwrap_or("");
        let reply_subject = if subject.starts_with("Re:") {
            subject.to_string()
        } else {
            format!("Re: {subject}")
        };

        let first_name = sender.split_whitespace().next().unwrap_or("there");
        let mut reply = format!(
            "Hi {first_name},\n\n\
             Thank you for reaching out regarding: {subject}.\n\n\
             [CLOUD DRAFT - review and personalise before sending]\n\n\
             I've received your message and will review the details you've shared. \
             I'll get back to you with a full response as soon as possible.\n\n"
        );
        if !summary.is_empty() {
            reply.push_str(&format!(
                "Regarding your point about '{summary}': [ADD YOUR RESPONSE HERE]\n\n"
            ));
        }
        reply.push_str("Best regards,\n[Your Name]\n");

        let draft_stem = Stem::compose("CLOUD_DRAFT_EMAIL", stem.as_str(), now);
        let draft = ActionNote::new(
            Preamble::new("cloud_draft_email", "send_email", now),
            format!(
                "# Cloud Draft: Email Reply\n\n\
                 **From:** {sender} ({email})\n\
                 **Subject:** {reply_subject}\n\n\
                 ## Original Message Summary\n\n{}\n\n\
                 ## Drafted Reply\n\n{reply}\n\n\
                 ## Instructions\n\n\
                 1. Review and edit the drafted reply above\n\
                 2. Move this file to `Approved/` when satisfied\n\
                 3. The local orchestrator sends it\n",
                if summary.is_empty() { "(none)" } else { summary },
            ),
        )
        .with_status(NoteStatus::PendingApproval)
        .with_field("source_file", stem.as_str())
        .with_field("sender", sender)
        .with_field("email", email)
        .with_field("subject", reply_subject.as_str())
        .with_field("drafted_by", "cloud_agent");

        self.finish_draft(stem, &draft_stem, &draft, "email_draft_created")
    }

    /// Draft a social post and park it for approval.
    fn draft_social_post(&self, stem: &Stem, source: &ActionNote) -> Result<(), Failure> {
        let now = self.clock.now();
        let platform = source
            .preamble
            .get("platform")
            .map_or_else(|| platform_from_stem(stem), str::to_string);
        let topic = source.preamble.get("topic").unwrap_or("business update");
        let context = source
            .preamble
            .get_any(&["context", "content"])
            .unwrap_or("");

        let content = match platform.to_ascii_uppercase().as_str() {
            "LINKEDIN" => format!(
                "[CLOUD DRAFT - LinkedIn Post]\n\nExcited to share an update on {topic}.\n\n\
                 {context}\n\nWhat are your thoughts? I'd love to hear from my network.\n"
            ),
            "TWITTER" | "X" => {
                let trimmed: String = context.chars().take(200).collect();
                format!("[CLOUD DRAFT - Tweet]\n\nUpdate on {topic}: {trimmed}\n")
            },
            _ => format!("[CLOUD DRAFT - Social Post]\n\nTopic: {topic}\n\n{context}\n"),
        };

        let kind = format!("CLOUD_DRAFT_SOCIAL_{}", platform.to_ascii_uppercase());
        let draft_stem = Stem::compose(&kind, stem.as_str(), now);
        let draft = ActionNote::new(
            Preamble::new(
                "cloud_draft_social",
                format!("post_to_{}", platform.to_ascii_lowercase()),
                now,
            ),
            format!(
                "# Cloud Draft: {platform} Post\n\n\
                 ## Drafted Content\n\n{content}\n\n\
                 ## Instructions\n\n\
                 1. Review and edit the drafted post above\n\
                 2. Move this file to `Approved/` when satisfied\n\
                 3. The local orchestrator posts it\n"
            ),
        )
        .with_status(NoteStatus::PendingApproval)
        .with_field("source_file", stem.as_str())
        .with_field("platform", platform.as_str())
        .with_field("topic", topic)
        .with_field("drafted_by", "cloud_agent");

        self.finish_draft(stem, &draft_stem, &draft, "social_draft_created")
    }

    /// Emit the draft, archive the claimed source, log. Draft failures
    /// release the source back to `Needs_Action/`.
    fn finish_draft(
        &self,
        source_stem: &Stem,
        draft_stem: &Stem,
        draft: &ActionNote,
        event: &str,
    ) -> Result<(), Failure> {
        match self.vault.emit(Stage::PendingApproval, draft_stem, draft) {
            Ok(path) => {
                info!(draft = %path.display(), source = %source_stem, "cloud draft written");
                self.log_event(
                    EventRecord::new(event, "drafted")
                        .with_file(source_stem.as_str())
                        .with_detail(json!({ "draft": draft_stem.as_str() })),
                )?;
                self.vault
                    .move_note(
                        &self.ledger,
                        source_stem,
                        Stage::InProgress(Peer::Cloud),
                        Stage::Done,
                    )
                    .map_err(|err| {
                        Failure::transient("failed to archive drafted source").with_source(err)
                    })?;
                Ok(())
            },
            Err(err) => {
                warn!(source = %source_stem, error = %err, "draft failed, releasing");
                self.log_event(
                    EventRecord::new("draft_error", "released")
                        .with_file(source_stem.as_str())
                        .with_detail(json!({ "error": err.to_string() })),
                )?;
                self.release(source_stem)
            },
        }
    }

    fn release(&self, stem: &Stem) -> Result<(), Failure> {
        self.vault
            .release(&self.ledger, stem, Peer::Cloud)
            .map_err(|err| Failure::transient("release failed").with_source(err))?;
        Ok(())
    }

    fn log_event(&self, record: EventRecord) -> Result<(), Failure> {
        self.ledger
            .append(record)
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))
    }

    /// Write a `CLOUD_STATUS_*` signal for the local peer to merge.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be written.
    pub fn write_signal(&self, status: &str) -> Result<(), Failure> {
        if self.config.dry_run {
            info!(status, "dry-run: would write cloud signal");
            return Ok(());
        }
        let now = self.clock.now();
        let stem = Stem::compose("CLOUD_STATUS", "", now);
        let body = format!(
            "---\n\
             agent: cloud\n\
             status: {status}\n\
             timestamp: {}\n\
             ---\n\n\
             # Cloud Agent Signal: {status}\n\n\
             - **last_active**: {}\n\
             - **tasks_processed**: {}\n",
            now.to_rfc3339(),
            now.to_rfc3339(),
            self.tasks_total,
        );
        self.vault
            .emit_raw(Stage::Signals, &stem, "md", &body)
            .map_err(|err| Failure::transient("failed to write signal").with_source(err))?;
        Ok(())
    }

    /// Run the cloud loop until shutdown.
    ///
    /// # Errors
    ///
    /// Returns the failure that stopped the agent.
    pub async fn run(&mut self, mut token: ShutdownToken) -> Result<(), Failure> {
        info!(
            poll_secs = self.config.cloud.poll_interval.as_secs(),
            "cloud agent started"
        );
        self.log_event(EventRecord::new("cloud_agent_started", "ok"))?;

        let mut last_signal: DateTime<Utc> = self.clock.now();
        loop {
            if token.is_triggered() {
                break;
            }
            match self.run_once() {
                Ok(count) if count > 0 => {
                    info!(count, total = self.tasks_total, "cloud pass complete");
                },
                Ok(_) => {},
                Err(failure) if failure.is_retryable() => {
                    warn!(error = %failure, "transient cloud pass failure");
                },
                Err(failure) => return Err(failure),
            }

            let now = self.clock.now();
            let signal_due = now.signed_duration_since(last_signal)
                >= chrono::Duration::from_std(self.config.cloud.signal_interval)
                    .unwrap_or_default();
            if signal_due {
                self.write_signal("active")?;
                last_signal = now;
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.cloud.poll_interval) => {},
                () = token.triggered() => break,
            }
        }

        self.write_signal("stopped")?;
        self.log_event(EventRecord::new("cloud_agent_stopped", "ok"))?;
        info!("cloud agent stopped");
        Ok(())
    }
}

fn platform_from_stem(stem: &Stem) -> String {
    for platform in ["LINKEDIN", "TWITTER", "FACEBOOK", "INSTAGRAM"] {
        if stem.as_str().to_ascii_uppercase().contains(platform) {
            return platform.to_ascii_lowercase();
        }
    }
    "social".to_string()
}
