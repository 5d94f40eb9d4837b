//! Append-only log of the user's fork selections.
//!
//! Newest-first on disk, capped at [`FORK_HISTORY_CAP`] entries; the oldest
//! fall off. Feeds the preference boost.

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const FORK_HISTORY_CAP: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    /// Normalized (trimmed, lowercased, whitespace-collapsed) query text.
    pub query: String,
    /// 0-based position in the ranking the user picked from.
    pub position: usize,
    #[serde(default)]
    pub outcome: Option<String>,
}

pub struct ForkHistory {
    path: PathBuf,
    entries: Mutex<Vec<ForkEvent>>,
}

impl ForkHistory {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            match serde_json::from_str::<Vec<ForkEvent>>(&raw) {
                Ok(entries) => entries,
                Err(err) => {
                    log::warn!(
                        "Corrupt fork history at {}, starting fresh: {err}",
                        path.display()
                    );
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    /// Record a selection. The entry lands at the front; anything past the
    /// cap is evicted.
    pub fn record(&self, mut event: ForkEvent) -> Result<()> {
        event.query = normalize_query(&event.query);
        let mut entries = self.lock()?;
        entries.insert(0, event);
        entries.truncate(FORK_HISTORY_CAP);
        self.save_locked(&entries)
    }

    /// Newest-first entries, at most `limit`.
    pub fn list(&self, limit: usize) -> Result<Vec<ForkEvent>> {
        let entries = self.lock()?;
        Ok(entries.iter().take(limit).cloned().collect())
    }

    /// Newest-first entries for one session.
    pub fn for_session(&self, session_id: &str) -> Result<Vec<ForkEvent>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    pub fn all(&self) -> Result<Vec<ForkEvent>> {
        self.list(FORK_HISTORY_CAP)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<ForkEvent>>> {
        self.entries
            .lock()
            .map_err(|_| RegistryError::Conflict("fork history lock poisoned".to_string()))
    }

    fn save_locked(&self, entries: &[ForkEvent]) -> Result<()> {
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

#[must_use]
pub(crate) fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn event(session: &str, minute: u32) -> ForkEvent {
        ForkEvent {
            session_id: session.to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 7, 1, 10, minute, 0).unwrap(),
            query: format!("Query For {session}"),
            position: 0,
            outcome: None,
        }
    }

    #[test]
    fn records_newest_first_with_normalized_query() {
        let tmp = TempDir::new().unwrap();
        let history = ForkHistory::open(&tmp.path().join("fork_history.json")).unwrap();

        history.record(event("first", 0)).unwrap();
        history
            .record(ForkEvent {
                query: "  OAuth   JWT  refresh ".to_string(),
                ..event("second", 1)
            })
            .unwrap();

        let entries = history.list(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].session_id, "second");
        assert_eq!(entries[0].query, "oauth jwt refresh");
    }

    #[test]
    fn caps_at_one_hundred_entries() {
        let tmp = TempDir::new().unwrap();
        let history = ForkHistory::open(&tmp.path().join("fork_history.json")).unwrap();
        for i in 0..(FORK_HISTORY_CAP + 20) {
            history.record(event(&format!("s{i}"), (i % 60) as u32)).unwrap();
        }
        assert_eq!(history.len(), FORK_HISTORY_CAP);
        // The newest entry survives, the very first is gone.
        let entries = history.all().unwrap();
        assert_eq!(entries[0].session_id, format!("s{}", FORK_HISTORY_CAP + 19));
        assert!(entries.iter().all(|e| e.session_id != "s0"));
    }

    #[test]
    fn persists_across_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fork_history.json");
        {
            let history = ForkHistory::open(&path).unwrap();
            history.record(event("kept", 5)).unwrap();
        }
        let history = ForkHistory::open(&path).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history.for_session("kept").unwrap().len(), 1);
    }

    #[test]
    fn corrupt_file_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fork_history.json");
        std::fs::write(&path, "[{bad").unwrap();
        let history = ForkHistory::open(&path).unwrap();
        assert!(history.is_empty());
    }
}
