//! Persisted seen-set for idempotent watcher dedup.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::path::PathBuf;

use adjutant_core::error::Failure;
use tracing::warn;

/// Bounded set of already-processed source ids, persisted as a small JSON
/// sidecar outside the synced vault directories.
///
/// Insertion order is kept so the set can be truncated to the newest
/// entries; writes go through a temp file + rename so a crash never leaves
/// a torn sidecar.
#[derive(Debug)]
pub struct SeenSet {
    path: PathBuf,
    ids: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenSet {
    /// Load (or initialise) the seen-set at the given sidecar path.
    #[must_use]
    pub fn load(path: PathBuf, cap: usize) -> Self {
        let mut order = VecDeque::new();
        if path.exists() {
            match std::fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<Vec<String>>(&raw).map_err(|err| err.to_string())
                }) {
                Ok(ids) => order.extend(ids),
                Err(err) => {
                    // A corrupt sidecar means re-emitting some notes; the
                    // stem collision suffix keeps that harmless.
                    warn!(path = %path.display(), %err, "seen-set unreadable, starting empty");
                },
            }
        }
        let ids = order.iter().cloned().collect();
        Self {
            path,
            ids,
            order,
            cap: cap.max(1),
        }
    }

    /// Whether the id has been processed before.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record an id. Returns `false` when it was already present.
    pub fn insert(&mut self, id: impl Into<String>) -> bool {
        let id = id.into();
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    /// Persist the set atomically (temp file + rename).
    ///
    /// # Errors
    ///
    /// Returns a transient failure if the sidecar cannot be written.
    pub fn save(&self) -> Result<(), Failure> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| {
                Failure::transient("failed to create sidecar directory").with_source(err)
            })?;
        }
        let ids: Vec<&String> = self.order.iter().collect();
        let raw = serde_json::to_string(&ids)
            .map_err(|err| Failure::transient("failed to serialise seen-set").with_source(err))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, raw)
            .map_err(|err| Failure::transient("failed to write seen-set").with_source(err))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|err| Failure::transient("failed to replace seen-set").with_source(err))?;
        Ok(())
    }

    /// Number of remembered ids.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_dedups() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = SeenSet::load(dir.path().join("x_seen.json"), 100);
        assert!(seen.insert("msg-1"));
        assert!(!seen.insert("msg-1"));
        assert!(seen.contains("msg-1"));
    }

    #[test]
    fn test_persist_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_seen.json");
        let mut seen = SeenSet::load(path.clone(), 100);
        seen.insert("a");
        seen.insert("b");
        seen.save().unwrap();

        let reloaded = SeenSet::load(path, 100);
        assert!(reloaded.contains("a"));
        assert!(reloaded.contains("b"));
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_cap_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = SeenSet::load(dir.path().join("x_seen.json"), 3);
        for id in ["a", "b", "c", "d"] {
            seen.insert(id);
        }
        assert_eq!(seen.len(), 3);
        assert!(!seen.contains("a"));
        assert!(seen.contains("d"));
    }

    #[test]
    fn test_corrupt_sidecar_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_seen.json");
        std::fs::write(&path, "{ not json").unwrap();
        let seen = SeenSet::load(path, 10);
        assert!(seen.is_empty());
    }
}
