//! Session archiving.
//!
//! Sessions untouched for longer than the threshold move to the archive
//! partition; `restore` brings them back. The store flips partition
//! membership atomically, so a concurrent search sees a session entirely
//! pre- or post-move.

use crate::error::{Result, SearchError};
use chrono::{Duration, Utc};
use refork_registry::{SessionFilter, SessionRegistry, SessionUpdate};
use refork_vector_store::{Partition, VectorStore};
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_THRESHOLD_DAYS: i64 = 365;

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveOutcome {
    pub archived_sessions: Vec<String>,
    pub chunks_moved: usize,
    pub dry_run: bool,
}

pub struct ArchiveService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    threshold_days: i64,
}

impl ArchiveService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            registry,
            threshold_days: DEFAULT_THRESHOLD_DAYS,
        }
    }

    #[must_use]
    pub fn with_threshold_days(mut self, days: i64) -> Self {
        self.threshold_days = days;
        self
    }

    /// Move every session older than the threshold into the archive.
    pub fn archive_old_sessions(&self, dry_run: bool) -> Result<ArchiveOutcome> {
        let cutoff = Utc::now() - Duration::days(self.threshold_days);
        let candidates: Vec<String> = self
            .registry
            .list(&SessionFilter {
                archived: Some(false),
                ..Default::default()
            })?
            .into_iter()
            .filter(|session| {
                session
                    .updated_at
                    .or(session.created_at)
                    .is_some_and(|ts| ts < cutoff)
            })
            .map(|session| session.session_id)
            .collect();

        if dry_run {
            return Ok(ArchiveOutcome {
                archived_sessions: candidates,
                chunks_moved: 0,
                dry_run: true,
            });
        }

        let mut archived = Vec::new();
        let mut chunks_moved = 0usize;
        for session_id in candidates {
            match self.archive(&session_id) {
                Ok(moved) => {
                    chunks_moved += moved;
                    archived.push(session_id);
                }
                Err(err) => {
                    log::warn!("Failed to archive {session_id}: {err}");
                }
            }
        }
        Ok(ArchiveOutcome {
            archived_sessions: archived,
            chunks_moved,
            dry_run: false,
        })
    }

    /// Archive one session regardless of age.
    pub fn archive(&self, session_id: &str) -> Result<usize> {
        if self.registry.get(session_id)?.is_none() {
            return Err(SearchError::NotFound(session_id.to_string()));
        }
        let moved = self.store.move_to_partition(session_id, Partition::Archive)?;
        self.registry.update(
            session_id,
            SessionUpdate {
                archived: Some(true),
                ..Default::default()
            },
        )?;
        log::info!("Archived session {session_id} ({moved} chunks)");
        Ok(moved)
    }

    /// Bring an archived session back into the active partition.
    pub fn restore(&self, session_id: &str) -> Result<usize> {
        if self.registry.get(session_id)?.is_none() {
            return Err(SearchError::NotFound(session_id.to_string()));
        }
        let moved = self.store.move_to_partition(session_id, Partition::Active)?;
        self.registry.update(
            session_id,
            SessionUpdate {
                archived: Some(false),
                ..Default::default()
            },
        )?;
        log::info!("Restored session {session_id} ({moved} chunks)");
        Ok(moved)
    }
}
