//! Watcher framework: the contract every external-source observer obeys.
//!
//! A watcher is an independent long-lived process observing one external
//! source. The framework supplies the common loop:
//!
//! 1. poll the source at its configured cadence;
//! 2. dedup by source-native id against a persisted seen-set sidecar -
//!    never emit twice for one id;
//! 3. emit one action note per new item into the target stage;
//! 4. wrap every source call in backoff + circuit breaker, and rate-limit
//!    outbound emits;
//! 5. distinguish transient from permanent failures - a permanent failure
//!    writes an `URGENT_` note and stops the watcher (exit code 3);
//! 6. `--setup` hooks interactive bootstrap; 7. `--dry-run` logs instead
//!    of writing.
//!
//! The inbox filesystem watcher ([`fs::InboxWatcher`]) is event-driven and
//! implements the same duties directly over native notifications.

pub mod fs;
mod seen;

pub use seen::SeenSet;

use std::sync::Arc;
use std::time::Duration;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::{Failure, FailureKind};
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::retry::{BackoffPolicy, CircuitBreaker, Clock, TokenBucket};
use adjutant_core::vault::{ActionNote, NoteStatus, Preamble, Priority, Stage, Stem, Vault};
use async_trait::async_trait;
use serde_json::json;
use tracing::{error, info, warn};

use crate::shutdown::ShutdownToken;

/// One new item observed at a source.
#[derive(Debug, Clone)]
pub struct SourceItem {
    /// Source-native dedup id (message id, post id, ...).
    pub id: String,
    /// Stem `<KIND>` for the emitted note.
    pub kind: String,
    /// Stem `<TOPIC>` for the emitted note.
    pub topic: String,
    /// Ledger `event_type` recorded for the emit.
    pub event_type: String,
    /// The action note to emit.
    pub note: ActionNote,
}

/// An external source the framework can poll.
#[async_trait]
pub trait Source: Send {
    /// Watcher name; names the seen-set sidecar, the breaker, and the
    /// ledger actor.
    fn name(&self) -> &'static str;

    /// Fetch new items.
    ///
    /// # Errors
    ///
    /// Transient failures (network, 5xx, timeout) are retried with backoff;
    /// permanent failures (auth, 4xx, parse) stop the watcher.
    async fn poll(&mut self) -> Result<Vec<SourceItem>, Failure>;

    /// Interactive bootstrap (session creation, credential exchange),
    /// invoked once out-of-band via `--setup`.
    ///
    /// # Errors
    ///
    /// Returns a failure when bootstrap cannot complete.
    async fn setup(&mut self) -> Result<(), Failure> {
        Ok(())
    }
}

/// Drives one [`Source`] through the common watcher loop.
pub struct WatchRunner {
    vault: Vault,
    ledger: EventLog,
    target: Stage,
    dry_run: bool,
    poll_interval: Duration,
    seen: SeenSet,
    backoff: BackoffPolicy,
    breaker: CircuitBreaker,
    emit_bucket: TokenBucket,
    clock: Arc<dyn Clock>,
}

impl WatchRunner {
    /// Build a runner for the named source.
    #[must_use]
    pub fn new(
        vault: Vault,
        ledger: EventLog,
        config: &AdjutantConfig,
        clock: &Arc<dyn Clock>,
        source_name: &str,
        target: Stage,
    ) -> Self {
        let seen_path = vault
            .sidecar_dir()
            .join(format!("{source_name}_seen.json"));
        Self {
            vault,
            ledger,
            target,
            dry_run: config.dry_run,
            poll_interval: config.watcher.poll_interval,
            seen: SeenSet::load(seen_path, config.watcher.seen_cap),
            backoff: BackoffPolicy::default(),
            breaker: CircuitBreaker::new(
                source_name.to_string(),
                5,
                Duration::from_secs(60),
                Arc::clone(clock),
            ),
            emit_bucket: TokenBucket::new(
                config.watcher.emit_cap,
                config.watcher.emit_cap,
                Duration::from_secs(3600),
                Arc::clone(clock),
            ),
            clock: Arc::clone(clock),
        }
    }

    /// One poll-and-emit pass. Returns the number of notes emitted.
    ///
    /// # Errors
    ///
    /// Propagates source failures; the caller chooses backoff (transient)
    /// or escalation (permanent).
    pub async fn run_once(&mut self, source: &mut dyn Source) -> Result<usize, Failure> {
        if !self.breaker.can_proceed() {
            return Ok(0);
        }
        let items = match source.poll().await {
            Ok(items) => {
                self.breaker.record_success();
                items
            },
            Err(failure) => {
                self.breaker.record_failure();
                return Err(failure);
            },
        };

        let mut emitted = 0;
        for item in items {
            if self.seen.contains(&item.id) {
                continue;
            }
            if !self.emit_bucket.try_acquire() {
                // Leave the rest unmarked; a later poll picks them up.
                warn!(source = source.name(), "emit rate limit reached, deferring items");
                break;
            }
            let created = item.note.preamble.created;
            let stem = Stem::compose(&item.kind, &item.topic, created);
            if self.dry_run {
                info!(source = source.name(), stem = %stem, "dry-run: would emit action note");
            } else {
                self.vault
                    .emit(self.target, &stem, &item.note)
                    .map_err(|err| {
                        Failure::transient("failed to emit action note").with_source(err)
                    })?;
                self.ledger
                    .append(
                        EventRecord::new(item.event_type.clone(), "action_note_emitted")
                            .with_file(stem.as_str())
                            .with_detail(json!({ "source_id": item.id.clone() })),
                    )
                    .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
            }
            self.seen.insert(item.id);
            emitted += 1;
        }
        if emitted > 0 {
            self.seen.save()?;
            info!(source = source.name(), emitted, "action notes emitted");
        }
        Ok(emitted)
    }

    /// Run the poll loop until shutdown or a permanent failure.
    ///
    /// # Errors
    ///
    /// Returns the failure that stopped the watcher; the binary maps its
    /// kind to an exit code.
    pub async fn run(
        &mut self,
        source: &mut dyn Source,
        mut token: ShutdownToken,
    ) -> Result<(), Failure> {
        info!(
            source = source.name(),
            interval_secs = self.poll_interval.as_secs(),
            "watcher started"
        );
        let mut attempt: u32 = 0;
        loop {
            if token.is_triggered() {
                break;
            }
            match self.run_once(source).await {
                Ok(_) => attempt = 0,
                Err(failure) if failure.kind == FailureKind::Transient => {
                    attempt += 1;
                    if self.backoff.allows(attempt) {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            source = source.name(),
                            attempt,
                            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                            error = %failure,
                            "transient source failure, backing off"
                        );
                        tokio::select! {
                            () = tokio::time::sleep(delay) => {},
                            () = token.triggered() => break,
                        }
                        continue;
                    }
                    warn!(
                        source = source.name(),
                        error = %failure,
                        "retries exhausted, resuming normal cadence"
                    );
                    attempt = 0;
                },
                Err(failure) => {
                    error!(source = source.name(), error = %failure, "permanent source failure");
                    self.escalate(source.name(), &failure)?;
                    return Err(failure);
                },
            }
            tokio::select! {
                () = tokio::time::sleep(self.poll_interval) => {},
                () = token.triggered() => break,
            }
        }
        info!(source = source.name(), "watcher stopped");
        Ok(())
    }

    /// Write an `URGENT_` note so the human learns the watcher stopped.
    fn escalate(&self, source_name: &str, failure: &Failure) -> Result<(), Failure> {
        let created = self.clock.now();
        let stem = Stem::compose("URGENT", &source_name.to_ascii_uppercase(), created);
        let note = ActionNote::new(
            Preamble::new("watcher_failure", "investigate_watcher", created),
            format!(
                "# Watcher stopped: {source_name}\n\n\
                 The watcher hit a permanent failure and shut itself down.\n\n\
                 ```\n{failure}\n```\n\n\
                 Fix the credentials or source configuration and restart it.\n"
            ),
        )
        .with_priority(Priority::P0)
        .with_status(NoteStatus::Pending)
        .with_field("watcher", source_name);
        if !self.dry_run {
            self.vault
                .emit(Stage::NeedsAction, &stem, &note)
                .map_err(|err| Failure::fatal("failed to write urgent note").with_source(err))?;
        }
        self.ledger
            .append(
                EventRecord::new("watcher_permanent_failure", "stopped")
                    .with_file(stem.as_str())
                    .with_detail(json!({
                        "watcher": source_name,
                        "error": failure.to_string(),
                    })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::retry::SystemClock;
    use chrono::Utc;

    /// Scripted source for framework tests.
    struct ScriptedSource {
        batches: Vec<Result<Vec<SourceItem>, Failure>>,
    }

    #[async_trait]
    impl Source for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn poll(&mut self) -> Result<Vec<SourceItem>, Failure> {
            if self.batches.is_empty() {
                Ok(Vec::new())
            } else {
                self.batches.remove(0)
            }
        }
    }

    fn item(id: &str) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            kind: "EMAIL".to_string(),
            topic: id.to_string(),
            event_type: "email_received".to_string(),
            note: ActionNote::new(
                Preamble::new("email", "reply_email", Utc::now()),
                "body",
            ),
        }
    }

    fn runner(dir: &tempfile::TempDir) -> WatchRunner {
        let vault = Vault::open(dir.path()).unwrap();
        vault.ensure_layout().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let ledger = EventLog::new(vault.stage_path(Stage::Logs), Arc::clone(&clock))
            .with_actor("scripted");
        WatchRunner::new(
            vault,
            ledger,
            &AdjutantConfig::default(),
            &clock,
            "scripted",
            Stage::NeedsAction,
        )
    }

    #[tokio::test]
    async fn test_same_id_twice_emits_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir);
        let mut source = ScriptedSource {
            batches: vec![Ok(vec![item("msg-1")]), Ok(vec![item("msg-1")])],
        };

        assert_eq!(runner.run_once(&mut source).await.unwrap(), 1);
        assert_eq!(runner.run_once(&mut source).await.unwrap(), 0);

        let vault = Vault::open(dir.path()).unwrap();
        assert_eq!(vault.list(Stage::NeedsAction).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_seen_set_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut runner = runner(&dir);
            let mut source = ScriptedSource {
                batches: vec![Ok(vec![item("msg-1")])],
            };
            runner.run_once(&mut source).await.unwrap();
        }
        // Fresh runner, same sidecar.
        let mut runner = runner(&dir);
        let mut source = ScriptedSource {
            batches: vec![Ok(vec![item("msg-1")])],
        };
        assert_eq!(runner.run_once(&mut source).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(&dir);
        let mut source = ScriptedSource {
            batches: vec![Err(Failure::transient("timeout"))],
        };
        let err = runner.run_once(&mut source).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_permanent_failure_escalates_with_urgent_note() {
        let dir = tempfile::tempdir().unwrap();
        let runner = runner(&dir);
        let failure = Failure::permanent("auth revoked");
        runner.escalate("scripted", &failure).unwrap();

        let vault = Vault::open(dir.path()).unwrap();
        let pending = vault.list(Stage::NeedsAction).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].stem.is_urgent());
    }
}
