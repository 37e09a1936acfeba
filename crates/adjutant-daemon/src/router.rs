//! Orchestrator router: `Approved/` to adapters, behind the policy gate.
//!
//! A single process watches `Approved/` via native filesystem
//! notifications (with a polling fallback), classifies each observed file
//! by its preamble, re-checks the handbook rules, and dispatches to the
//! matching adapter under the retry + breaker wrappers. Outcomes:
//!
//! - `sent`/`drafted`: the file moves to `Done/`
//! - policy violation or permanent failure: the file moves to `Rejected/`
//!   with a sibling `_error.md` record
//! - transient failure or missing rate token: the file stays in
//!   `Approved/` and is revisited after a per-stem cooldown
//!
//! Dispatch order is filename-ascending per adapter, with a small worker
//! pool (default 2 concurrent calls) per adapter. On shutdown the router
//! stops intake, gives in-flight dispatches a grace window, and leaves
//! everything else in `Approved/` for the next run.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::{Failure, FailureKind};
use adjutant_core::ledger::{EventLog, EventRecord};
use adjutant_core::policy::{PolicyDecision, PolicyGate};
use adjutant_core::retry::{BackoffPolicy, CircuitBreaker, Clock, LimiterSet};
use adjutant_core::vault::{ActionNote, Stage, Stem, Vault};
use chrono::{DateTime, Utc};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::adapters::{Adapter, AdapterSet, DispatchContext, Outcome, Route};
use crate::shutdown::ShutdownToken;

/// Mutable router state, process-local and rebuilt from empty on start.
struct RouterState {
    limiter: LimiterSet,
    breakers: HashMap<&'static str, CircuitBreaker>,
    defer_until: HashMap<Stem, DateTime<Utc>>,
    in_flight: HashSet<Stem>,
}

/// The orchestrator router.
pub struct Router {
    vault: Vault,
    ledger: EventLog,
    clock: Arc<dyn Clock>,
    adapters: AdapterSet,
    policy: PolicyGate,
    config: AdjutantConfig,
    backoff: BackoffPolicy,
    state: Mutex<RouterState>,
}

impl Router {
    /// Build the router.
    #[must_use]
    pub fn new(
        vault: Vault,
        ledger: EventLog,
        adapters: AdapterSet,
        config: AdjutantConfig,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let limiter = LimiterSet::from_limits(&config.channels, &clock);
        let breakers = adapters
            .names()
            .into_iter()
            .map(|name| {
                (
                    name,
                    CircuitBreaker::new(name, 5, Duration::from_secs(120), Arc::clone(&clock)),
                )
            })
            .collect();
        let policy = PolicyGate::from_config(&config.orchestrator);
        Arc::new(Self {
            vault,
            ledger,
            clock,
            adapters,
            policy,
            config,
            backoff: BackoffPolicy::default(),
            state: Mutex::new(RouterState {
                limiter,
                breakers,
                defer_until: HashMap::new(),
                in_flight: HashSet::new(),
            }),
        })
    }

    fn dispatch_context(&self) -> DispatchContext {
        DispatchContext {
            vault: self.vault.clone(),
            ledger: self.ledger.clone(),
            dry_run: self.config.dry_run,
        }
    }

    /// Sweep `Pending_Approval/` and `Approved/` for expired notes.
    ///
    /// # Errors
    ///
    /// Returns an error when a stage cannot be listed or a move fails.
    pub fn sweep_expired(&self) -> Result<usize, Failure> {
        let now = self.clock.now();
        let mut swept = 0;
        for stage in [Stage::PendingApproval, Stage::Approved] {
            let entries = self
                .vault
                .list(stage)
                .map_err(|err| Failure::transient("failed to list stage").with_source(err))?;
            for entry in entries {
                let Ok(raw) = std::fs::read_to_string(&entry.path) else {
                    continue;
                };
                let Ok(note) = ActionNote::parse(&raw) else {
                    continue; // handled by the integrity path at dispatch
                };
                if note.preamble.is_expired(now) {
                    self.reject(&entry.stem, stage, "approval_expired", &format!(
                        "expired at {}",
                        note.preamble
                            .expires
                            .map_or_else(String::new, |at| at.to_rfc3339())
                    ))?;
                    swept += 1;
                }
            }
        }
        Ok(swept)
    }

    /// One full pass over `Approved/`: expiry sweep, then grouped dispatch.
    /// Returns the number of files that reached a terminal stage.
    ///
    /// # Errors
    ///
    /// Returns an error only for vault-level failures; per-file problems
    /// are handled via the rejection and deferral paths.
    pub async fn scan_approved(self: &Arc<Self>) -> Result<usize, Failure> {
        self.sweep_expired()?;

        let entries = self
            .vault
            .list(Stage::Approved)
            .map_err(|err| Failure::transient("failed to list Approved").with_source(err))?;

        // Classify up front so each adapter gets its files in filename
        // order; unreadable files take the integrity path here.
        let mut groups: HashMap<&'static str, Vec<(Stem, ActionNote, Arc<dyn Adapter>)>> =
            HashMap::new();
        let now = self.clock.now();
        for entry in entries {
            {
                let state = self.state.lock().expect("router state poisoned");
                if state.in_flight.contains(&entry.stem) {
                    continue;
                }
                if let Some(until) = state.defer_until.get(&entry.stem) {
                    if *until > now {
                        continue;
                    }
                }
            }
            match self.read_note(&entry.path) {
                Ok(note) => {
                    let route = Route::new(&entry.stem, &note);
                    let adapter = self.adapters.select(&route);
                    groups
                        .entry(adapter.name())
                        .or_default()
                        .push((entry.stem, note, adapter));
                },
                Err(reason) => {
                    warn!(stem = %entry.stem, %reason, "unreadable approved file");
                    self.quarantine(&entry.stem, Stage::Approved, &reason)?;
                },
            }
        }

        let mut terminal = 0;
        let mut adapter_tasks = JoinSet::new();
        for (_name, files) in groups {
            let router = Arc::clone(self);
            adapter_tasks.spawn(async move {
                let mut done = 0;
                let mut workers = JoinSet::new();
                for (stem, note, adapter) in files {
                    while workers.len() >= router.config.orchestrator.adapter_concurrency {
                        if let Some(Ok(true)) = workers.join_next().await {
                            done += 1;
                        }
                    }
                    let router = Arc::clone(&router);
                    workers.spawn(async move { router.process(&stem, note, adapter).await });
                }
                while let Some(result) = workers.join_next().await {
                    if matches!(result, Ok(true)) {
                        done += 1;
                    }
                }
                done
            });
        }
        while let Some(result) = adapter_tasks.join_next().await {
            terminal += result.unwrap_or(0);
        }
        Ok(terminal)
    }

    /// Dispatch one file immediately (the `--send-now` path).
    ///
    /// Re-running on a file already in `Done/` is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error when the file is missing or unreadable.
    pub async fn send_now(self: &Arc<Self>, file: &Path) -> Result<(), Failure> {
        let stem = Stem::from_path(file)
            .ok_or_else(|| Failure::policy(format!("not a note path: {}", file.display())))?;
        if self
            .vault
            .find(Stage::Done, &stem)
            .map_err(|err| Failure::transient("failed to check Done").with_source(err))?
            .is_some()
        {
            info!(stem = %stem, "already in Done/, nothing to do");
            return Ok(());
        }
        if self
            .vault
            .find(Stage::Approved, &stem)
            .map_err(|err| Failure::transient("failed to check Approved").with_source(err))?
            .is_none()
        {
            return Err(Failure::policy(format!("{stem} is not in Approved/")));
        }
        let note = self
            .read_note(&self.vault.stage_path(Stage::Approved).join(
                file.file_name().unwrap_or_default(),
            ))
            .map_err(Failure::integrity)?;
        let route = Route::new(&stem, &note);
        let adapter = self.adapters.select(&route);
        self.process(&stem, note, adapter).await;
        Ok(())
    }

    fn read_note(&self, path: &Path) -> Result<ActionNote, String> {
        let raw = std::fs::read_to_string(path).map_err(|err| err.to_string())?;
        ActionNote::parse(&raw).map_err(|err| err.to_string())
    }

    /// Full pipeline for one approved file. Returns `true` when the file
    /// reached a terminal stage.
    async fn process(
        self: &Arc<Self>,
        stem: &Stem,
        note: ActionNote,
        adapter: Arc<dyn Adapter>,
    ) -> bool {
        // Claim the stem for this run; double side-effects are forbidden.
        {
            let mut state = self.state.lock().expect("router state poisoned");
            if !state.in_flight.insert(stem.clone()) {
                return false;
            }
        }
        let outcome = self.process_inner(stem, &note, adapter).await;
        let mut state = self.state.lock().expect("router state poisoned");
        state.in_flight.remove(stem);
        outcome
    }

    async fn process_inner(
        self: &Arc<Self>,
        stem: &Stem,
        note: &ActionNote,
        adapter: Arc<dyn Adapter>,
    ) -> bool {
        let now = self.clock.now();

        // Policy gate: approval is re-checked even for approved files.
        match self.policy.evaluate(stem, note, &self.ledger, now) {
            Ok(PolicyDecision::Allow) => {},
            Ok(PolicyDecision::Reject { event, reason }) => {
                if let Err(err) = self.reject(stem, Stage::Approved, event, &reason) {
                    error!(stem = %stem, error = %err, "failed to reject file");
                }
                return true;
            },
            Err(err) => {
                warn!(stem = %stem, error = %err, "policy evaluation failed, deferring");
                self.defer(stem, "policy_evaluation_failed");
                return false;
            },
        }

        // Breaker and rate limit, both keyed per adapter/channel.
        let (breaker_open, rate_limited) = {
            let mut state = self.state.lock().expect("router state poisoned");
            let breaker_open = state
                .breakers
                .get_mut(adapter.name())
                .is_some_and(|breaker| !breaker.can_proceed());
            let rate_limited = !breaker_open
                && adapter
                    .channel()
                    .is_some_and(|channel| !state.limiter.try_acquire(channel));
            (breaker_open, rate_limited)
        };
        if breaker_open {
            debug!(stem = %stem, adapter = adapter.name(), "breaker open, deferring");
            self.defer(stem, "breaker_open");
            return false;
        }
        if rate_limited {
            self.defer(stem, "rate_limited");
            return false;
        }

        // Dispatch under retry; the side-effect is the commit point.
        let ctx = self.dispatch_context();
        let deadline = self.config.orchestrator.dispatch_deadline;
        let mut attempt: u32 = 0;
        let outcome = loop {
            attempt += 1;
            let result =
                tokio::time::timeout(deadline, adapter.dispatch(&ctx, stem, note)).await;
            let failure = match result {
                Ok(Ok(outcome)) => break Some(outcome),
                Ok(Err(failure)) => failure,
                Err(_) => Failure::transient(format!(
                    "adapter {} timed out after {}s",
                    adapter.name(),
                    deadline.as_secs()
                )),
            };
            if failure.kind == FailureKind::Transient {
                self.record_breaker(adapter.name(), false);
                if self.backoff.allows(attempt) {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        stem = %stem,
                        adapter = adapter.name(),
                        attempt,
                        error = %failure,
                        "transient dispatch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
                warn!(stem = %stem, adapter = adapter.name(), error = %failure, "retries exhausted");
                self.defer(stem, "transient_failure");
                break None;
            }
            // Permanent failures reject the file.
            self.record_breaker(adapter.name(), false);
            if let Err(err) =
                self.reject(stem, Stage::Approved, "dispatch_failed", &failure.to_string())
            {
                error!(stem = %stem, error = %err, "failed to reject file");
            }
            return true;
        };

        let Some(outcome) = outcome else {
            return false;
        };
        self.record_breaker(adapter.name(), true);

        match &outcome {
            Outcome::Sent | Outcome::Drafted => {
                if let Err(err) =
                    self.vault
                        .move_note(&self.ledger, stem, Stage::Approved, Stage::Done)
                {
                    // The side-effect already happened; leave the record and
                    // let the next scan retry the move.
                    error!(stem = %stem, error = %err, "failed to archive to Done/");
                }
                let action = if note.preamble.action.is_empty() {
                    adapter.name().to_string()
                } else {
                    note.preamble.action.clone()
                };
                if let Err(err) = self.ledger.append(
                    EventRecord::new("adapter_dispatch", outcome.as_str())
                        .with_file(stem.as_str())
                        .with_action(action)
                        .with_detail(json!({ "adapter": adapter.name() })),
                ) {
                    error!(stem = %stem, error = %err, "ledger append failed");
                }
                let mut state = self.state.lock().expect("router state poisoned");
                state.defer_until.remove(stem);
                true
            },
            Outcome::Rejected { reason } => {
                if let Err(err) = self.reject(stem, Stage::Approved, "dispatch_rejected", reason)
                {
                    error!(stem = %stem, error = %err, "failed to reject file");
                }
                true
            },
        }
    }

    fn record_breaker(&self, adapter: &str, success: bool) {
        let mut state = self.state.lock().expect("router state poisoned");
        if let Some(breaker) = state.breakers.get_mut(adapter) {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    /// Defer a file in place with the configured cooldown.
    fn defer(&self, stem: &Stem, reason: &str) {
        let until = self.clock.now()
            + chrono::Duration::from_std(self.config.orchestrator.defer_cooldown)
                .unwrap_or_default();
        {
            let mut state = self.state.lock().expect("router state poisoned");
            state.defer_until.insert(stem.clone(), until);
        }
        if let Err(err) = self.ledger.append(
            EventRecord::new("dispatch_deferred", "deferred")
                .with_file(stem.as_str())
                .with_detail(json!({ "reason": reason })),
        ) {
            error!(stem = %stem, error = %err, "ledger append failed");
        }
    }

    /// Move a file to `Rejected/` with an error sibling and a ledger record.
    fn reject(
        &self,
        stem: &Stem,
        from: Stage,
        event: &str,
        reason: &str,
    ) -> Result<(), Failure> {
        self.vault
            .move_note(&self.ledger, stem, from, Stage::Rejected)
            .map_err(|err| Failure::transient("failed to move to Rejected").with_source(err))?;
        let sibling = Stem::new(format!("{stem}_error"));
        let body = format!("# Rejected: {stem}\n\n{reason}\n");
        self.vault
            .emit_raw(Stage::Rejected, &sibling, "md", &body)
            .map_err(|err| Failure::transient("failed to write error sibling").with_source(err))?;
        self.ledger
            .append(
                EventRecord::new(event, "rejected")
                    .with_file(stem.as_str())
                    .with_detail(json!({ "reason": reason })),
            )
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        info!(stem = %stem, event, reason, "file rejected");
        Ok(())
    }

    /// Quarantine an unreadable file (integrity path).
    fn quarantine(&self, stem: &Stem, from: Stage, reason: &str) -> Result<(), Failure> {
        self.vault
            .quarantine(&self.ledger, stem, from, reason)
            .map_err(|err| Failure::transient("quarantine failed").with_source(err))?;
        Ok(())
    }

    /// Run the router until shutdown: native watch on `Approved/` plus the
    /// polling fallback, with the shutdown grace window for in-flight work.
    ///
    /// # Errors
    ///
    /// Returns an error for unrecoverable vault failures.
    pub async fn run(self: Arc<Self>, mut token: ShutdownToken) -> Result<(), Failure> {
        let approved = self.vault.stage_path(Stage::Approved);
        info!(approved = %approved.display(), "orchestrator router started");
        self.ledger
            .append(EventRecord::new("orchestrator_started", "ok").with_detail(json!({
                "dry_run": self.config.dry_run,
                "mode": self.config.mode.to_string(),
            })))
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;

        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(64);
        let _watcher = match start_notify(&approved, tx) {
            Ok(watcher) => Some(watcher),
            Err(err) => {
                warn!(error = %err, "native watcher unavailable, polling only");
                None
            },
        };

        loop {
            if token.is_triggered() {
                break;
            }
            // Run one scan as a task so shutdown can bound it with the
            // grace window instead of abandoning work instantly.
            let router = Arc::clone(&self);
            let mut scan = tokio::spawn(async move {
                if let Err(err) = router.scan_approved().await {
                    error!(error = %err, "scan failed");
                }
            });
            tokio::select! {
                _ = &mut scan => {},
                () = token.triggered() => {
                    let grace = self.config.orchestrator.shutdown_grace;
                    if tokio::time::timeout(grace, &mut scan).await.is_err() {
                        warn!("grace window elapsed, abandoning in-flight dispatches");
                        scan.abort();
                    }
                    break;
                },
            }

            tokio::select! {
                event = rx.recv() => {
                    if event.is_some() {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        while rx.try_recv().is_ok() {}
                    }
                },
                () = tokio::time::sleep(self.config.orchestrator.poll_interval) => {},
                () = token.triggered() => break,
            }
        }

        self.ledger
            .append(EventRecord::new("orchestrator_stopped", "ok"))
            .map_err(|err| Failure::fatal("ledger unwriteable").with_source(err))?;
        info!("orchestrator router stopped");
        Ok(())
    }
}

/// Start the native watcher on `Approved/`; events squash to unit pings.
fn start_notify(
    approved: &Path,
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
    watcher.watch(approved, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}
