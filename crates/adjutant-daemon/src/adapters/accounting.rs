//! Accounting adapter: creates draft invoices or quotations in the ERP.

use std::collections::BTreeMap;
use std::sync::Arc;

use adjutant_core::error::Failure;
use adjutant_core::vault::{ActionNote, Stem};
use async_trait::async_trait;
use tracing::info;

use super::transport::{Delivery, Transport};
use super::{Adapter, DispatchContext, Outcome, Route};

const ACCOUNTING_ACTIONS: &[&str] = &[
    "create_invoice",
    "post_invoice",
    "create_client_and_invoice",
    "create_client_and_quotation",
    "odoo_action",
];
const ACCOUNTING_TYPES: &[&str] = &["odoo_action", "invoice", "quotation", "accounting_action"];

/// Creates draft invoices/quotations. Channel: `payment`.
pub struct AccountingAdapter {
    transport: Arc<dyn Transport>,
}

impl AccountingAdapter {
    /// Create the adapter over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Adapter for AccountingAdapter {
    fn name(&self) -> &'static str {
        "accounting"
    }

    fn channel(&self) -> Option<&'static str> {
        Some("payment")
    }

    fn matches(&self, route: &Route) -> bool {
        let stem = route.inner_stem();
        (stem.starts_with("APPROVAL_") && stem.contains("ODOO"))
            || stem.starts_with("INVOICE_")
            || ACCOUNTING_ACTIONS.contains(&route.action.as_str())
            || ACCOUNTING_TYPES.contains(&route.note_type.as_str())
    }

    async fn dispatch(
        &self,
        _ctx: &DispatchContext,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<Outcome, Failure> {
        let Some(partner) = note.preamble.get_any(&["partner_name", "client", "customer"])
        else {
            return Ok(Outcome::Rejected {
                reason: "no partner_name in accounting action".to_string(),
            });
        };
        let Some(amount) = note.preamble.amount() else {
            return Ok(Outcome::Rejected {
                reason: "missing or unparseable amount".to_string(),
            });
        };
        if amount <= 0.0 {
            return Ok(Outcome::Rejected {
                reason: format!("non-positive amount {amount}"),
            });
        }

        // "invoice" or "quotation"; anything else is a schema mismatch.
        let kind = note
            .preamble
            .get_any(&["odoo_action", "document"])
            .unwrap_or("invoice")
            .to_ascii_lowercase();
        if kind != "invoice" && kind != "quotation" {
            return Ok(Outcome::Rejected {
                reason: format!("unknown accounting document kind {kind:?}"),
            });
        }

        let mut fields = BTreeMap::new();
        fields.insert("partner_name".to_string(), partner.to_string());
        fields.insert("amount".to_string(), format!("{amount:.2}"));
        fields.insert("document".to_string(), kind.clone());
        if let Some(currency) = note.preamble.get("currency") {
            fields.insert("currency".to_string(), currency.to_string());
        }
        if let Some(description) = note.preamble.get("description") {
            fields.insert("description".to_string(), description.to_string());
        }

        let delivery = Delivery {
            channel: "payment",
            stem: stem.as_str().to_string(),
            action: format!("create_{kind}"),
            fields,
            body: note.body.clone(),
        };
        self.transport.deliver(&delivery).await?;
        info!(stem = %stem, partner, amount, kind, "accounting action dispatched");
        Ok(Outcome::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::LoggingTransport;
    use adjutant_core::ledger::EventLog;
    use adjutant_core::retry::SystemClock;
    use adjutant_core::vault::{Preamble, Vault};
    use chrono::Utc;

    fn ctx() -> (tempfile::TempDir, DispatchContext) {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::open(dir.path()).unwrap();
        vault.ensure_layout().unwrap();
        let ledger = EventLog::new(
            vault.stage_path(adjutant_core::vault::Stage::Logs),
            Arc::new(SystemClock),
        );
        (
            dir,
            DispatchContext {
                vault,
                ledger,
                dry_run: true,
            },
        )
    }

    #[tokio::test]
    async fn test_missing_partner_rejected() {
        let (_dir, ctx) = ctx();
        let adapter = AccountingAdapter::new(Arc::new(LoggingTransport));
        let note = ActionNote::new(Preamble::new("odoo_action", "create_invoice", Utc::now()), "")
            .with_field("amount", "1500");
        let outcome = adapter
            .dispatch(&ctx, &Stem::new("APPROVAL_ODOO_20260101000000"), &note)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_valid_invoice_sent() {
        let (_dir, ctx) = ctx();
        let adapter = AccountingAdapter::new(Arc::new(LoggingTransport));
        let note = ActionNote::new(Preamble::new("odoo_action", "create_invoice", Utc::now()), "")
            .with_field("partner_name", "Acme Pty")
            .with_field("amount", "1500")
            .with_field("currency", "USD");
        let outcome = adapter
            .dispatch(&ctx, &Stem::new("APPROVAL_ODOO_20260101000000"), &note)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Sent);
    }
}
