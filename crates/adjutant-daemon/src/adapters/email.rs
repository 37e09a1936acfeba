//! Email adapter: sends an approved email through the configured transport.

use std::collections::BTreeMap;
use std::sync::Arc;

use adjutant_core::error::Failure;
use adjutant_core::vault::{ActionNote, Stem};
use async_trait::async_trait;
use tracing::info;

use super::transport::{Delivery, Transport};
use super::{Adapter, DispatchContext, Outcome, Route};

const EMAIL_ACTIONS: &[&str] = &["send_email", "reply_email", "send_approved_email"];
const EMAIL_TYPES: &[&str] = &["email", "email_action", "inbound_email", "cloud_draft_email"];

/// Sends approved emails. Channel: `email`.
pub struct EmailAdapter {
    transport: Arc<dyn Transport>,
}

impl EmailAdapter {
    /// Create the adapter over a transport.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Adapter for EmailAdapter {
    fn name(&self) -> &'static str {
        "email"
    }

    fn channel(&self) -> Option<&'static str> {
        Some("email")
    }

    fn matches(&self, route: &Route) -> bool {
        route.inner_stem().starts_with("EMAIL_")
            || EMAIL_ACTIONS.contains(&route.action.as_str())
            || EMAIL_TYPES.contains(&route.note_type.as_str())
    }

    async fn dispatch(
        &self,
        _ctx: &DispatchContext,
        stem: &Stem,
        note: &ActionNote,
    ) -> Result<Outcome, Failure> {
        let Some(to) = note.preamble.get_any(&["email", "to", "recipient"]) else {
            return Ok(Outcome::Rejected {
                reason: "no recipient address in preamble".to_string(),
            });
        };
        let subject = note
            .preamble
            .get("subject")
            .unwrap_or("(no subject)")
            .to_string();

        let mut fields = BTreeMap::new();
        fields.insert("to".to_string(), to.to_string());
        fields.insert("subject".to_string(), subject);
        if let Some(sender) = note.preamble.get("sender") {
            fields.insert("sender".to_string(), sender.to_string());
        }

        let delivery = Delivery {
            channel: "email",
            stem: stem.as_str().to_string(),
            action: "send_email".to_string(),
            fields,
            body: reply_section(&note.body),
        };
        self.transport.deliver(&delivery).await?;
        info!(stem = %stem, to, "email dispatched");
        Ok(Outcome::Sent)
    }
}

/// The `## Reply` or `## Drafted Reply` section when present, otherwise the
/// whole body. Cloud drafts carry the outbound text in that section.
fn reply_section(body: &str) -> String {
    for heading in ["## Drafted Reply", "## Reply"] {
        if let Some(start) = body.find(heading) {
            let after = &body[start + heading.len()..];
            let end = after.find("\n## ").unwrap_or(after.len());
            return after[..end].trim().to_string();
        }
    }
    body.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_section_extraction() {
        let body = "# Draft\n\n## Original\n\nhi\n\n## Reply\n\nThanks, will do.\n\n## Notes\n\nx";
        assert_eq!(reply_section(body), "Thanks, will do.");
    }

    #[test]
    fn test_reply_section_whole_body_fallback() {
        assert_eq!(reply_section("Just text.\n"), "Just text.");
    }
}
