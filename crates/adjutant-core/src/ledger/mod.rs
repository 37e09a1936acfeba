//! Append-only daily audit ledger.
//!
//! One file per local calendar date under `Logs/`, `YYYY-MM-DD.jsonl`: an
//! append-only JSON-lines stream, one record per line. Writers assemble the
//! whole record in memory and issue a single append followed by a flush and
//! fsync, so readers (dashboard, briefings, the approval gate) may read a
//! partial final line but never an interleaved one. Rotation is lazy: the
//! first write after midnight creates the next day's file.
//!
//! The ledger is also evidence: the policy gate proves that a stem passed
//! through `Pending_Approval/` by finding its `stage_transition` records
//! here.

mod record;

pub use record::EventRecord;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;

use crate::retry::Clock;
use crate::vault::Stem;

/// Handle to the daily audit ledger of one process.
///
/// Each process creates its own handle with its actor name; records carry
/// that actor so the shared ledger stays attributable across peers.
#[derive(Clone)]
pub struct EventLog {
    logs_dir: PathBuf,
    actor: String,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("logs_dir", &self.logs_dir)
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Create a ledger handle writing into the given `Logs/` directory.
    #[must_use]
    pub fn new(logs_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            actor: "adjutant".to_string(),
            clock,
        }
    }

    /// Set the actor name stamped on every appended record.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    /// Path of the ledger file for a given date.
    #[must_use]
    pub fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.logs_dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one record, stamping the timestamp and actor.
    ///
    /// The record is serialised to a single newline-terminated line and
    /// written with one `write_all` + fsync. An unwriteable ledger is a
    /// fatal condition for the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the file cannot
    /// be opened, or the write fails.
    pub fn append(&self, record: EventRecord) -> Result<(), LedgerError> {
        let now = self.clock.now();
        let mut record = record;
        record.timestamp = now;
        if record.actor.is_empty() {
            record.actor.clone_from(&self.actor);
        }

        std::fs::create_dir_all(&self.logs_dir).map_err(|source| LedgerError::Io {
            context: format!("creating {}", self.logs_dir.display()),
            source,
        })?;

        let path = self.file_for(self.clock.today());
        let mut line = serde_json::to_string(&record).map_err(LedgerError::Serialize)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Io {
                context: format!("opening {}", path.display()),
                source,
            })?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.flush())
            .and_then(|()| file.sync_data())
            .map_err(|source| LedgerError::Io {
                context: format!("appending to {}", path.display()),
                source,
            })?;
        Ok(())
    }

    /// Read every parseable record for one date.
    ///
    /// Partial or corrupt lines are skipped - a crashed writer must not
    /// poison readers.
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing file cannot be read.
    pub fn read_day(&self, date: NaiveDate) -> Result<Vec<EventRecord>, LedgerError> {
        let path = self.file_for(date);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(|source| LedgerError::Io {
            context: format!("reading {}", path.display()),
            source,
        })?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Records whose `file` field matches the stem, searching today
    /// backwards over at most `lookback_days` ledger files.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing ledger file cannot be read.
    pub fn records_for_stem(
        &self,
        stem: &Stem,
        lookback_days: u32,
    ) -> Result<Vec<EventRecord>, LedgerError> {
        let mut out = Vec::new();
        let today = self.clock.today();
        for offset in 0..=i64::from(lookback_days) {
            let Some(date) = today.checked_sub_days(chrono::Days::new(
                u64::try_from(offset).unwrap_or_default(),
            )) else {
                break;
            };
            for record in self.read_day(date)? {
                if record.file.as_deref() == Some(stem.as_str()) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }
}

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// Record serialisation failed.
    #[error("failed to serialise ledger record: {0}")]
    Serialize(#[source] serde_json::Error),

    /// An I/O error occurred.
    #[error("ledger I/O error while {context}: {source}")]
    Io {
        /// What the operation was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::FixedClock;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, EventLog, Arc<FixedClock>) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 2, 3, 23, 30, 0).unwrap(),
        ));
        let log = EventLog::new(dir.path(), Arc::clone(&clock) as Arc<dyn Clock>)
            .with_actor("test");
        (dir, log, clock)
    }

    #[test]
    fn test_append_and_read_back() {
        let (_dir, log, _clock) = setup();
        log.append(
            EventRecord::new("file_drop", "action_file_created")
                .with_file("FILE_note_20260203233000"),
        )
        .unwrap();

        let records = log.read_day(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "file_drop");
        assert_eq!(records[0].actor, "test");
        assert_eq!(records[0].file.as_deref(), Some("FILE_note_20260203233000"));
    }

    #[test]
    fn test_lazy_midnight_rotation() {
        let (_dir, log, clock) = setup();
        log.append(EventRecord::new("a", "ok")).unwrap();
        clock.advance(Duration::from_secs(3600)); // crosses midnight
        log.append(EventRecord::new("b", "ok")).unwrap();

        assert!(log.file_for(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap()).exists());
        assert!(log.file_for(NaiveDate::from_ymd_opt(2026, 2, 4).unwrap()).exists());
        let day_two = log.read_day(NaiveDate::from_ymd_opt(2026, 2, 4).unwrap()).unwrap();
        assert_eq!(day_two.len(), 1);
        assert_eq!(day_two[0].event_type, "b");
    }

    #[test]
    fn test_partial_line_is_skipped() {
        let (_dir, log, _clock) = setup();
        log.append(EventRecord::new("good", "ok")).unwrap();
        let path = log.file_for(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap());
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{\"timestamp\":\"2026-02-03T2"); // torn write
        std::fs::write(&path, raw).unwrap();

        let records = log.read_day(NaiveDate::from_ymd_opt(2026, 2, 3).unwrap()).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_records_for_stem_lookback() {
        let (_dir, log, clock) = setup();
        let stem = Stem::new("EMAIL_x_20260203120000");
        log.append(EventRecord::new("stage_transition", "moved").with_file(stem.as_str()))
            .unwrap();
        clock.advance(Duration::from_secs(86_400));
        log.append(EventRecord::new("other", "ok")).unwrap();

        let records = log.records_for_stem(&stem, 7).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "stage_transition");
    }
}
