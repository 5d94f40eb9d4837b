//! Session registry: one JSON document, one mutex.
//!
//! The mutex covers the in-memory map and the save that follows a mutation.
//! It is never held across embedding or vector-store calls; callers clone
//! rows out and coordinate cross-store consistency themselves.

use crate::error::{RegistryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: usize,
    #[serde(default)]
    pub chunk_count: usize,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
    /// Chunk count at the time the summary was generated; drives
    /// regeneration when the session grows or shrinks.
    #[serde(default)]
    pub summary_chunk_count: Option<usize>,
    #[serde(default)]
    pub archived: bool,
}

impl SessionMetadata {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: None,
            created_at: None,
            updated_at: None,
            last_synced: None,
            message_count: 0,
            chunk_count: 0,
            tags: Vec::new(),
            summary: None,
            summary_chunk_count: None,
            archived: false,
        }
    }
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub project: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub last_synced: Option<DateTime<Utc>>,
    pub message_count: Option<usize>,
    pub chunk_count: Option<usize>,
    pub tags: Option<Vec<String>>,
    pub summary: Option<Option<String>>,
    pub summary_chunk_count: Option<Option<usize>>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub project: Option<String>,
    pub tag: Option<String>,
    pub archived: Option<bool>,
}

impl SessionFilter {
    fn matches(&self, session: &SessionMetadata) -> bool {
        if let Some(project) = &self.project {
            if session.project.as_deref() != Some(project.as_str()) {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !session.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if session.archived != archived {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_sessions: usize,
    pub total_chunks: usize,
    pub total_messages: usize,
    pub archived_sessions: usize,
    pub projects: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct PersistedRegistry {
    version: u32,
    #[serde(default)]
    last_synced: Option<DateTime<Utc>>,
    sessions: BTreeMap<String, SessionMetadata>,
}

pub struct SessionRegistry {
    path: PathBuf,
    state: Mutex<State>,
}

struct State {
    sessions: HashMap<String, SessionMetadata>,
    last_synced: Option<DateTime<Utc>>,
}

impl SessionRegistry {
    /// Open the registry at `path`. A corrupt file logs a warning and starts
    /// empty; the next index pass repopulates it.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            match serde_json::from_str::<PersistedRegistry>(&raw) {
                Ok(persisted) => State {
                    sessions: persisted.sessions.into_iter().collect(),
                    last_synced: persisted.last_synced,
                },
                Err(err) => {
                    log::warn!(
                        "Corrupt session registry at {}, starting fresh: {err}",
                        path.display()
                    );
                    State {
                        sessions: HashMap::new(),
                        last_synced: None,
                    }
                }
            }
        } else {
            State {
                sessions: HashMap::new(),
                last_synced: None,
            }
        };
        log::info!(
            "Session registry at {} ({} sessions)",
            path.display(),
            state.sessions.len()
        );
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn add(&self, metadata: SessionMetadata) -> Result<SessionMetadata> {
        let mut state = self.lock()?;
        state
            .sessions
            .insert(metadata.session_id.clone(), metadata.clone());
        self.save_locked(&state)?;
        Ok(metadata)
    }

    pub fn get(&self, session_id: &str) -> Result<Option<SessionMetadata>> {
        let state = self.lock()?;
        Ok(state.sessions.get(session_id).cloned())
    }

    pub fn update(&self, session_id: &str, update: SessionUpdate) -> Result<SessionMetadata> {
        let mut state = self.lock()?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;

        if let Some(project) = update.project {
            session.project = Some(project);
        }
        if let Some(created_at) = update.created_at {
            session.created_at = Some(created_at);
        }
        if let Some(updated_at) = update.updated_at {
            session.updated_at = Some(updated_at);
        }
        if let Some(last_synced) = update.last_synced {
            session.last_synced = Some(last_synced);
        }
        if let Some(message_count) = update.message_count {
            session.message_count = message_count;
        }
        if let Some(chunk_count) = update.chunk_count {
            session.chunk_count = chunk_count;
        }
        if let Some(tags) = update.tags {
            session.tags = tags;
        }
        if let Some(summary) = update.summary {
            session.summary = summary;
        }
        if let Some(summary_chunk_count) = update.summary_chunk_count {
            session.summary_chunk_count = summary_chunk_count;
        }
        if let Some(archived) = update.archived {
            session.archived = archived;
        }
        let updated = session.clone();
        self.save_locked(&state)?;
        Ok(updated)
    }

    pub fn delete(&self, session_id: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let removed = state.sessions.remove(session_id).is_some();
        if removed {
            self.save_locked(&state)?;
        }
        Ok(removed)
    }

    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<SessionMetadata>> {
        let state = self.lock()?;
        let mut sessions: Vec<SessionMetadata> = state
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        Ok(sessions)
    }

    pub fn set_last_synced(
        &self,
        session_id: &str,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let timestamp = timestamp.unwrap_or_else(Utc::now);
        let mut state = self.lock()?;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        session.last_synced = Some(timestamp);
        state.last_synced = Some(timestamp);
        self.save_locked(&state)
    }

    pub fn stats(&self) -> Result<RegistryStats> {
        let state = self.lock()?;
        let mut projects = BTreeSet::new();
        let mut total_chunks = 0usize;
        let mut total_messages = 0usize;
        let mut archived = 0usize;
        for session in state.sessions.values() {
            total_chunks += session.chunk_count;
            total_messages += session.message_count;
            if session.archived {
                archived += 1;
            }
            if let Some(project) = &session.project {
                projects.insert(project.clone());
            }
        }
        Ok(RegistryStats {
            total_sessions: state.sessions.len(),
            total_chunks,
            total_messages,
            archived_sessions: archived,
            projects: projects.into_iter().collect(),
        })
    }

    pub fn clear(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.sessions.clear();
        self.save_locked(&state)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| RegistryError::Conflict("registry lock poisoned".to_string()))
    }

    fn save_locked(&self, state: &State) -> Result<()> {
        let persisted = PersistedRegistry {
            version: REGISTRY_VERSION,
            last_synced: state.last_synced,
            sessions: state
                .sessions
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        };
        let data = serde_json::to_vec_pretty(&persisted)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}
