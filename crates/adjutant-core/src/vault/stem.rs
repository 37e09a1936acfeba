//! Stems: the stable identity of a note across stages.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filename without extension.
///
/// The canonical form is `<KIND>_<TOPIC>_<YYYYMMDDHHMMSS>`. The stem is
/// stable across stage transitions - moves must preserve it - which makes
/// it the natural identity key for deduplication and logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stem(String);

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

impl Stem {
    /// Wrap a raw stem string.
    #[must_use]
    pub fn new(stem: impl Into<String>) -> Self {
        Self(stem.into())
    }

    /// Compose a canonical stem from kind, topic, and creation time.
    ///
    /// The topic is sanitised to `[A-Za-z0-9_-]` and truncated so stems stay
    /// filesystem-friendly.
    #[must_use]
    pub fn compose(kind: &str, topic: &str, created: DateTime<Utc>) -> Self {
        let topic: String = topic
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .take(40)
            .collect();
        let timestamp = created.format(TIMESTAMP_FORMAT);
        if topic.is_empty() {
            Self(format!("{kind}_{timestamp}"))
        } else {
            Self(format!("{kind}_{topic}_{timestamp}"))
        }
    }

    /// Stem of a path (its file stem), if it has one.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map(|stem| Self(stem.to_string()))
    }

    /// The raw stem string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading `<KIND>` segment (up to the first underscore).
    #[must_use]
    pub fn kind(&self) -> &str {
        self.0.split('_').next().unwrap_or(&self.0)
    }

    /// Whether the stem starts with the given uppercase prefix.
    #[must_use]
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.to_ascii_uppercase().starts_with(prefix)
    }

    /// Whether this is an `URGENT_*` escalation note.
    #[must_use]
    pub fn is_urgent(&self) -> bool {
        self.has_prefix("URGENT_")
    }

    /// Whether this is an `APPROVAL_*` note.
    #[must_use]
    pub fn is_approval(&self) -> bool {
        self.has_prefix("APPROVAL_")
    }

    /// Whether this is a cloud-drafted note.
    #[must_use]
    pub fn is_cloud_draft(&self) -> bool {
        self.has_prefix("CLOUD_DRAFT_")
    }

    /// Trailing creation timestamp, when the stem carries one.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        let tail = self.0.rsplit('_').next()?;
        if tail.len() != 14 {
            return None;
        }
        NaiveDateTime::parse_from_str(tail, TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    /// Derive the collision-resolution stem for attempt `n` (`_2`, `_3`, ...).
    #[must_use]
    pub fn with_suffix(&self, n: u32) -> Self {
        Self(format!("{}_{n}", self.0))
    }
}

impl fmt::Display for Stem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Stem {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_compose_sanitises_topic() {
        let created = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let stem = Stem::compose("EMAIL", "Invoice #42 / March", created);
        assert_eq!(stem.as_str(), "EMAIL_Invoice__42___March_20260314092653");
        assert_eq!(stem.kind(), "EMAIL");
        assert_eq!(stem.timestamp(), Some(created));
    }

    #[test]
    fn test_compose_empty_topic() {
        let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let stem = Stem::compose("PLAN", "", created);
        assert_eq!(stem.as_str(), "PLAN_20260101000000");
    }

    #[test]
    fn test_prefix_predicates() {
        assert!(Stem::new("URGENT_GMAIL_20260101000000").is_urgent());
        assert!(Stem::new("APPROVAL_ODOO_20260101000000").is_approval());
        assert!(Stem::new("CLOUD_DRAFT_EMAIL_20260101000000").is_cloud_draft());
        assert!(!Stem::new("EMAIL_reply_20260101000000").is_approval());
    }

    #[test]
    fn test_from_path_strips_extension() {
        let stem = Stem::from_path(Path::new("/vault/Approved/EMAIL_x_20260101000000.md"));
        assert_eq!(stem.unwrap().as_str(), "EMAIL_x_20260101000000");
    }

    #[test]
    fn test_timestamp_absent_for_noncanonical() {
        assert!(Stem::new("SYNC_STATUS").timestamp().is_none());
        assert!(Stem::new("EMAIL_notadate99").timestamp().is_none());
    }

    #[test]
    fn test_suffix() {
        let stem = Stem::new("FILE_report_20260101000000");
        assert_eq!(stem.with_suffix(2).as_str(), "FILE_report_20260101000000_2");
    }
}
