//! Ledger record type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One audit record: a single JSON object on a single line.
///
/// `timestamp` and `actor` are stamped by [`crate::ledger::EventLog::append`];
/// constructors leave them as placeholders. Additional keys beyond the
/// schema ride in `detail`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// When the event happened.
    pub timestamp: DateTime<Utc>,

    /// What happened (`stage_transition`, `file_drop`, `approval_expired`, ...).
    pub event_type: String,

    /// Which component did it.
    #[serde(default)]
    pub actor: String,

    /// Stem of the affected note, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Dispatch verb involved, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Outcome (`sent`, `moved`, `deferred`, `rejected`, ...).
    pub result: String,

    /// Free-form structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl EventRecord {
    /// Create a record; timestamp and actor are stamped at append time.
    #[must_use]
    pub fn new(event_type: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            event_type: event_type.into(),
            actor: String::new(),
            file: None,
            action: None,
            result: result.into(),
            detail: None,
        }
    }

    /// Attach the affected stem.
    #[must_use]
    pub fn with_file(mut self, stem: impl Into<String>) -> Self {
        self.file = Some(stem.into());
        self
    }

    /// Attach the dispatch verb.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Override the actor (normally stamped by the ledger handle).
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_omitted() {
        let record = EventRecord::new("sync", "pushed");
        let line = serde_json::to_string(&record).unwrap();
        assert!(!line.contains("\"file\""));
        assert!(!line.contains("\"action\""));
        assert!(!line.contains("\"detail\""));
    }

    #[test]
    fn test_round_trip() {
        let record = EventRecord::new("adapter_dispatch", "sent")
            .with_file("EMAIL_x_20260101000000")
            .with_action("send_email")
            .with_detail(serde_json::json!({ "adapter": "email" }));
        let line = serde_json::to_string(&record).unwrap();
        let back: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(back.event_type, "adapter_dispatch");
        assert_eq!(back.action.as_deref(), Some("send_email"));
        assert_eq!(back.result, "sent");
    }
}
