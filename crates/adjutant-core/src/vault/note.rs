//! Action notes: frontmatter preamble + free-form body.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Priority declared in the preamble.
///
/// `P0` immediate, `P1` within 2 h, `P2` within 24 h, `P3` within 72 h.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Immediate.
    P0,
    /// Within two hours.
    P1,
    /// Within a day.
    P2,
    /// Within three days.
    P3,
}

impl Priority {
    /// Parse a priority, tolerating the legacy word forms.
    ///
    /// Unknown values fall back to `P3` - a malformed priority should not
    /// quarantine an otherwise readable note.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "p0" | "urgent" | "asap" | "critical" => Self::P0,
            "p1" | "high" | "important" => Self::P1,
            "p2" | "medium" | "normal" => Self::P2,
            _ => Self::P3,
        }
    }

    /// Canonical label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status declared in the preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoteStatus {
    /// Waiting to be picked up.
    Pending,
    /// Drafted, waiting for the human approval gate.
    PendingApproval,
    /// Claimed by a peer.
    InProgress,
    /// Passed the approval gate.
    Approved,
    /// Terminal: completed.
    Done,
    /// Terminal: rejected or expired.
    Rejected,
}

impl NoteStatus {
    /// Parse a status, defaulting unknown values to `Pending`.
    #[must_use]
    pub fn parse_lenient(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending_approval" | "awaiting_approval" => Self::PendingApproval,
            "in_progress" | "claimed" => Self::InProgress,
            "approved" => Self::Approved,
            "done" | "completed" | "sent" => Self::Done,
            "rejected" | "expired" => Self::Rejected,
            _ => Self::Pending,
        }
    }

    /// Canonical lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PendingApproval => "pending_approval",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Done => "done",
            Self::Rejected => "rejected",
        }
    }

    /// Lifecycle rank, used by the sync bridge to resolve same-stem
    /// conflicts: the later status wins (`approved` beats `pending`).
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::PendingApproval => 1,
            Self::InProgress => 2,
            Self::Approved => 3,
            Self::Done | Self::Rejected => 4,
        }
    }
}

impl fmt::Display for NoteStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured key/value preamble of an action note.
///
/// Type-specific fields (sender, amount, platform, channel, ...) ride
/// alongside the required fields and are preserved in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Preamble {
    /// Discriminator: `email`, `file_drop`, `odoo_action`, ...
    pub note_type: String,
    /// Dispatch verb: `send_email`, `post_to_twitter`, ... Empty when the
    /// source did not declare one; routing then falls back to the stem.
    pub action: String,
    /// Declared priority.
    pub priority: Priority,
    /// Declared lifecycle status.
    pub status: NoteStatus,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Optional deadline after which an unapproved note is auto-rejected.
    pub expires: Option<DateTime<Utc>>,
    /// Remaining fields in original order.
    pub extra: Vec<(String, String)>,
}

impl Preamble {
    /// Create a preamble with the required fields.
    #[must_use]
    pub fn new(note_type: impl Into<String>, action: impl Into<String>, created: DateTime<Utc>) -> Self {
        Self {
            note_type: note_type.into(),
            action: action.into(),
            priority: Priority::P3,
            status: NoteStatus::Pending,
            created,
            expires: None,
            extra: Vec::new(),
        }
    }

    /// Look up a type-specific field.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// First present field among the given keys.
    #[must_use]
    pub fn get_any(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|key| self.get(key))
    }

    /// Parse the `amount` field, tolerating currency noise (`$1,500.00`).
    #[must_use]
    pub fn amount(&self) -> Option<f64> {
        let raw = self.get("amount")?;
        let cleaned: String = raw
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
            .collect();
        cleaned.parse().ok()
    }

    /// Whether the note's deadline has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|deadline| deadline < now)
    }
}

/// A single action note: preamble plus markdown body.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionNote {
    /// Structured head.
    pub preamble: Preamble,
    /// Free-form human-readable content.
    pub body: String,
}

impl ActionNote {
    /// Create a note.
    #[must_use]
    pub fn new(preamble: Preamble, body: impl Into<String>) -> Self {
        Self {
            preamble,
            body: body.into(),
        }
    }

    /// Builder-style priority override.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.preamble.priority = priority;
        self
    }

    /// Builder-style status override.
    #[must_use]
    pub fn with_status(mut self, status: NoteStatus) -> Self {
        self.preamble.status = status;
        self
    }

    /// Builder-style expiry deadline.
    #[must_use]
    pub fn with_expires(mut self, expires: DateTime<Utc>) -> Self {
        self.preamble.expires = Some(expires);
        self
    }

    /// Builder-style extra field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.preamble.extra.push((key.into(), value.into()));
        self
    }

    /// Parse a note from file content.
    ///
    /// Accepts the canonical `---` fenced frontmatter, or (for material
    /// produced by earlier tooling) bare leading `key: value` lines.
    ///
    /// # Errors
    ///
    /// Returns an error when the preamble is unreadable, `type` is missing,
    /// or a timestamp cannot be parsed. These are integrity failures; the
    /// caller quarantines the file.
    pub fn parse(text: &str) -> Result<Self, NoteError> {
        let (head, body) = split_frontmatter(text)?;

        let mut note_type = None;
        let mut action = String::new();
        let mut priority = Priority::P3;
        let mut status = NoteStatus::Pending;
        let mut created = None;
        let mut expires = None;
        let mut extra = Vec::new();

        for line in head.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                return Err(NoteError::MalformedLine {
                    line: line.to_string(),
                });
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "type" => note_type = Some(value.to_string()),
                "action" => action = value.to_string(),
                "priority" => priority = Priority::parse_lenient(value),
                "status" => status = NoteStatus::parse_lenient(value),
                "created" | "received" | "drafted_at" => {
                    created = Some(parse_timestamp(key, value)?);
                },
                "expires" => expires = Some(parse_timestamp(key, value)?),
                _ => extra.push((key.to_string(), value.to_string())),
            }
        }

        let note_type = note_type.ok_or(NoteError::MissingField { field: "type" })?;
        let created = created.ok_or(NoteError::MissingField { field: "created" })?;

        Ok(Self {
            preamble: Preamble {
                note_type,
                action,
                priority,
                status,
                created,
                expires,
                extra,
            },
            body: body.to_string(),
        })
    }

    /// Render the note to its on-disk form.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::from("---\n");
        let p = &self.preamble;
        out.push_str(&format!("type: {}\n", p.note_type));
        if !p.action.is_empty() {
            out.push_str(&format!("action: {}\n", p.action));
        }
        out.push_str(&format!("priority: {}\n", p.priority));
        out.push_str(&format!("status: {}\n", p.status));
        out.push_str(&format!("created: {}\n", p.created.to_rfc3339()));
        if let Some(expires) = p.expires {
            out.push_str(&format!("expires: {}\n", expires.to_rfc3339()));
        }
        for (key, value) in &p.extra {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out.push_str("---\n\n");
        out.push_str(&self.body);
        if !self.body.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// Split text into (preamble lines, body).
fn split_frontmatter(text: &str) -> Result<(&str, &str), NoteError> {
    if let Some(rest) = text.strip_prefix("---\n").or_else(|| text.strip_prefix("---\r\n")) {
        match rest.find("\n---") {
            Some(end) => {
                let head = &rest[..end];
                let after = &rest[end + 4..];
                let body = after.strip_prefix('\n').unwrap_or(after);
                let body = body.strip_prefix('\n').unwrap_or(body);
                Ok((head, body))
            },
            None => Err(NoteError::UnterminatedFrontmatter),
        }
    } else {
        // Bare key: value lines up to the first blank line.
        let head_end = text.find("\n\n").unwrap_or(text.len());
        let head = &text[..head_end];
        if head.lines().all(|line| {
            line.trim().is_empty() || line.contains(':')
        }) && head.contains(':')
        {
            let body = text[head_end..].trim_start_matches('\n');
            Ok((head, body))
        } else {
            Err(NoteError::NoPreamble)
        }
    }
}

fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>, NoteError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(parsed.and_utc());
        }
    }
    Err(NoteError::InvalidTimestamp {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Errors from parsing an action note. These are integrity failures.
#[derive(Debug, thiserror::Error)]
pub enum NoteError {
    /// The file has no recognisable preamble.
    #[error("no preamble found")]
    NoPreamble,

    /// The opening `---` fence has no closing fence.
    #[error("unterminated frontmatter fence")]
    UnterminatedFrontmatter,

    /// A preamble line was not `key: value`.
    #[error("malformed preamble line: {line:?}")]
    MalformedLine {
        /// The offending line.
        line: String,
    },

    /// A required field is absent.
    #[error("missing required preamble field: {field}")]
    MissingField {
        /// Field name.
        field: &'static str,
    },

    /// A timestamp field could not be parsed.
    #[error("invalid timestamp in {field}: {value:?}")]
    InvalidTimestamp {
        /// Field name.
        field: String,
        /// Offending value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> ActionNote {
        let created = Utc.with_ymd_and_hms(2026, 2, 3, 10, 30, 0).unwrap();
        ActionNote::new(
            Preamble::new("email", "send_email", created),
            "## Body\n\nHello.",
        )
        .with_priority(Priority::P1)
        .with_field("sender", "Ada Lovelace")
        .with_field("amount", "$1,500.00")
    }

    #[test]
    fn test_round_trip() {
        let note = sample();
        let parsed = ActionNote::parse(&note.render()).unwrap();
        assert_eq!(parsed.preamble.note_type, "email");
        assert_eq!(parsed.preamble.action, "send_email");
        assert_eq!(parsed.preamble.priority, Priority::P1);
        assert_eq!(parsed.preamble.get("sender"), Some("Ada Lovelace"));
        assert_eq!(parsed.preamble.amount(), Some(1500.0));
        assert!(parsed.body.contains("Hello."));
    }

    #[test]
    fn test_parse_bare_preamble() {
        let text = "type: file_drop\ncreated: 2026-02-03T10:30:00\npriority: P3\n\nBody here\n";
        let note = ActionNote::parse(text).unwrap();
        assert_eq!(note.preamble.note_type, "file_drop");
        assert_eq!(note.preamble.priority, Priority::P3);
        assert_eq!(note.body.trim(), "Body here");
    }

    #[test]
    fn test_missing_type_is_error() {
        let text = "---\ncreated: 2026-02-03T10:30:00\n---\n\nbody\n";
        assert!(matches!(
            ActionNote::parse(text),
            Err(NoteError::MissingField { field: "type" })
        ));
    }

    #[test]
    fn test_missing_created_is_error() {
        let text = "---\ntype: email\n---\n\nbody\n";
        assert!(matches!(
            ActionNote::parse(text),
            Err(NoteError::MissingField { field: "created" })
        ));
    }

    #[test]
    fn test_unterminated_fence() {
        let text = "---\ntype: email\ncreated: 2026-02-03T10:30:00\n";
        assert!(matches!(
            ActionNote::parse(text),
            Err(NoteError::UnterminatedFrontmatter)
        ));
    }

    #[test]
    fn test_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 2, 3, 12, 0, 0).unwrap();
        let note = sample().with_expires(now - chrono::Duration::minutes(1));
        assert!(note.preamble.is_expired(now));
        let note = sample().with_expires(now + chrono::Duration::minutes(1));
        assert!(!note.preamble.is_expired(now));
    }

    #[test]
    fn test_priority_lenient() {
        assert_eq!(Priority::parse_lenient("urgent"), Priority::P0);
        assert_eq!(Priority::parse_lenient("P1"), Priority::P1);
        assert_eq!(Priority::parse_lenient("whatever"), Priority::P3);
    }

    #[test]
    fn test_status_rank_ordering() {
        assert!(NoteStatus::Approved.rank() > NoteStatus::Pending.rank());
        assert!(NoteStatus::Approved.rank() > NoteStatus::PendingApproval.rank());
        assert!(NoteStatus::Done.rank() > NoteStatus::Approved.rank());
    }
}
