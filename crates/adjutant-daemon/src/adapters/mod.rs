//! Adapter contract and the adapter selection table.
//!
//! An adapter consumes one approved file and performs at most one external
//! side-effect. Uniform rules:
//!
//! - The preamble's `type`/`action` (with a filename-prefix fallback)
//!   decides applicability; the first matching adapter in registration
//!   order wins, and the generic adapter always matches last.
//! - The router acquires the adapter's rate-limit token *before* the call.
//! - The side-effect is the commit point: `Sent`/`Drafted` move the file to
//!   `Done/`, `Rejected` moves it to `Rejected/` with an error sibling, and
//!   a transient error leaves it in `Approved/` as deferred.
//! - Never two side-effects for one file: idempotency is keyed on the stem
//!   (the router's in-flight set within a run, the `Done/` check across
//!   runs).

mod accounting;
mod email;
mod generic;
mod social;
mod transport;

pub use accounting::AccountingAdapter;
pub use email::EmailAdapter;
pub use generic::GenericAdapter;
pub use social::SocialAdapter;
pub use transport::{CommandTransport, Delivery, LoggingTransport, Transport};

use std::sync::Arc;

use adjutant_core::config::AdjutantConfig;
use adjutant_core::error::Failure;
use adjutant_core::ledger::EventLog;
use adjutant_core::vault::{ActionNote, Stem, Vault};
use async_trait::async_trait;

/// Result of one adapter dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The side-effect was performed; the file moves to `Done/`.
    Sent,
    /// A draft or notice was produced instead of an external side-effect;
    /// the file still moves to `Done/`.
    Drafted,
    /// The file is unusable for this adapter; it moves to `Rejected/`.
    Rejected {
        /// Why, written to the error sibling.
        reason: String,
    },
}

impl Outcome {
    /// Ledger `result` label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Drafted => "drafted",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Classification input, derived once per file.
#[derive(Debug, Clone)]
pub struct Route {
    /// Uppercased stem for prefix matching.
    pub stem_upper: String,
    /// Preamble `type`.
    pub note_type: String,
    /// Preamble `action`.
    pub action: String,
}

impl Route {
    /// Build the route key for a file.
    #[must_use]
    pub fn new(stem: &Stem, note: &ActionNote) -> Self {
        Self {
            stem_upper: stem.as_str().to_ascii_uppercase(),
            note_type: note.preamble.note_type.clone(),
            action: note.preamble.action.clone(),
        }
    }

    /// Strip the `CLOUD_DRAFT_` prefix so cloud drafts route like the
    /// underlying action.
    #[must_use]
    pub fn inner_stem(&self) -> &str {
        self.stem_upper
            .strip_prefix("CLOUD_DRAFT_")
            .unwrap_or(&self.stem_upper)
    }
}

/// Shared context handed to adapters at dispatch time.
#[derive(Clone)]
pub struct DispatchContext {
    /// The vault, for adapters that emit notices.
    pub vault: Vault,
    /// The audit ledger.
    pub ledger: EventLog,
    /// Dry-run flag; adapters must not side-effect when set.
    pub dry_run: bool,
}

/// The adapter contract.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name, used for breakers and logging.
    fn name(&self) -> &'static str;

    /// Rate-limit channel consumed before dispatch, if any.
    fn channel(&self) -> Option<&'static str>;

    /// Whether this adapter handles the given route.
    fn matches(&self, route: &Route) -> bool;

    /// Consume one approved file.
    ///
    /// # Errors
    ///
    /// Transient failures are retried then deferred by the router;
    /// permanent failures reject the file.
    async fn dispatch(
        &self,
        ctx: &DispatchContext,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<Outcome, Failure>;
}

/// Ordered adapter table with the generic fallback.
pub struct AdapterSet {
    adapters: Vec<Arc<dyn Adapter>>,
    generic: Arc<dyn Adapter>,
}

impl AdapterSet {
    /// Build the standard table from configuration.
    ///
    /// Transports come from the configured helper commands; unset channels
    /// (and dry-run mode) get the logging transport.
    #[must_use]
    pub fn from_config(config: &AdjutantConfig) -> Self {
        let deadline = config.orchestrator.dispatch_deadline;
        let pick = |argv: &Option<Vec<String>>| -> Arc<dyn Transport> {
            match argv {
                Some(argv) if !config.dry_run && !argv.is_empty() => {
                    Arc::new(CommandTransport::new(argv.clone(), deadline))
                },
                _ => Arc::new(LoggingTransport),
            }
        };
        Self {
            adapters: vec![
                Arc::new(EmailAdapter::new(pick(&config.transports.email))),
                Arc::new(SocialAdapter::new(pick(&config.transports.social))),
                Arc::new(AccountingAdapter::new(pick(&config.transports.accounting))),
            ],
            generic: Arc::new(GenericAdapter),
        }
    }

    /// Build a custom table (tests, alternative wiring).
    #[must_use]
    pub fn new(adapters: Vec<Arc<dyn Adapter>>, generic: Arc<dyn Adapter>) -> Self {
        Self { adapters, generic }
    }

    /// Select the adapter for a route; the generic fallback always matches.
    #[must_use]
    pub fn select(&self, route: &Route) -> Arc<dyn Adapter> {
        self.adapters
            .iter()
            .find(|adapter| adapter.matches(route))
            .map_or_else(|| Arc::clone(&self.generic), Arc::clone)
    }

    /// All adapter names, generic included (for breaker setup).
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.adapters.iter().map(|a| a.name()).collect();
        names.push(self.generic.name());
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adjutant_core::vault::Preamble;
    use chrono::Utc;

    fn route(stem: &str, note_type: &str, action: &str) -> Route {
        let note = ActionNote::new(Preamble::new(note_type, action, Utc::now()), "");
        Route::new(&Stem::new(stem), &note)
    }

    fn set() -> AdapterSet {
        AdapterSet::from_config(&AdjutantConfig::default())
    }

    #[test]
    fn test_email_routes() {
        let set = set();
        assert_eq!(
            set.select(&route("EMAIL_reply_20260101000000", "email", "")).name(),
            "email"
        );
        assert_eq!(
            set.select(&route("CLOUD_DRAFT_EMAIL_20260101000000", "cloud_draft_email", ""))
                .name(),
            "email"
        );
        assert_eq!(
            set.select(&route("NOTE_x_20260101000000", "note", "send_email")).name(),
            "email"
        );
    }

    #[test]
    fn test_social_routes() {
        let set = set();
        assert_eq!(
            set.select(&route("LINKEDIN_POST_20260101000000", "", "")).name(),
            "social"
        );
        assert_eq!(
            set.select(&route("SOCIAL_TWITTER_20260101000000", "social_post_approval", ""))
                .name(),
            "social"
        );
        assert_eq!(
            set.select(&route("NOTE_x_20260101000000", "", "post_to_twitter")).name(),
            "social"
        );
    }

    #[test]
    fn test_accounting_routes() {
        let set = set();
        assert_eq!(
            set.select(&route("APPROVAL_ODOO_20260101000000", "odoo_action", ""))
                .name(),
            "accounting"
        );
        assert_eq!(
            set.select(&route("NOTE_x_20260101000000", "invoice", "create_invoice"))
                .name(),
            "accounting"
        );
    }

    #[test]
    fn test_unknown_falls_back_to_generic() {
        let set = set();
        assert_eq!(
            set.select(&route("MYSTERY_x_20260101000000", "mystery", "do_thing"))
                .name(),
            "generic"
        );
    }
}
