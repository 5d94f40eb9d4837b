//! The session indexing pipeline shared by the watcher and bulk setup.

use crate::error::{IndexerError, Result};
use crate::locks::SessionLocks;
use chrono::Utc;
use refork_config::Config;
use refork_registry::{SessionMetadata, SessionRegistry, SessionUpdate};
use refork_transcript::{Chunk, Chunker, ChunkerConfig, Message, TranscriptReader};
use refork_vector_store::{ChunkRecord, EmbeddingGateway, VectorStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed { chunks: usize, messages: usize },
    /// The file yielded no usable messages; nothing was written.
    Empty,
}

/// Lifecycle of one session as it moves through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum SessionState {
    Parsing,
    Embedding,
    Writing,
    Indexed,
    Failed(String),
}

pub struct SessionIndexer {
    reader: TranscriptReader,
    chunker: Chunker,
    gateway: Arc<EmbeddingGateway>,
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    locks: SessionLocks,
    checkpoints: CheckpointLog,
    checkpoint_interval: usize,
}

impl SessionIndexer {
    pub fn new(
        config: &Config,
        storage_dir: &Path,
        gateway: Arc<EmbeddingGateway>,
        store: Arc<VectorStore>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        let chunker = Chunker::new(ChunkerConfig {
            target_tokens: config.chunking.target_tokens,
            overlap_tokens: config.chunking.overlap_tokens,
            max_tokens: config.chunking.max_tokens,
            extract_memory: true,
        })?;
        Ok(Self {
            reader: TranscriptReader::new(),
            chunker,
            gateway,
            store,
            registry,
            locks: SessionLocks::new(),
            checkpoints: CheckpointLog::new(storage_dir),
            checkpoint_interval: config.indexing.checkpoint_interval.max(1),
        })
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<EmbeddingGateway> {
        &self.gateway
    }

    #[must_use]
    pub fn locks(&self) -> &SessionLocks {
        &self.locks
    }

    /// Index one transcript file end to end. Chunk swap and registry write
    /// happen under the session lock; a caller observing either sees both.
    pub async fn index_file(&self, path: &Path) -> Result<IndexOutcome> {
        self.index_file_observed(path, |_| {}).await
    }

    /// [`Self::index_file`], reporting each state transition to `observe`.
    pub async fn index_file_observed<F>(&self, path: &Path, observe: F) -> Result<IndexOutcome>
    where
        F: Fn(&SessionState) + Send,
    {
        let session_id = session_id_for_path(path);
        let lock = self.locks.for_session(&session_id);
        let _guard = lock.lock().await;

        log::debug!("Indexing {} as session {session_id}", path.display());
        observe(&SessionState::Parsing);

        // Parsing (blocking file IO) off the async workers.
        let reader = self.reader;
        let owned_path = path.to_path_buf();
        let (messages, stats) =
            tokio::task::spawn_blocking(move || reader.read_file(&owned_path))
                .await
                .map_err(|e| IndexerError::Other(format!("parse task failed: {e}")))??;
        if stats.lines_skipped > 0 {
            log::info!(
                "{}: skipped {} of {} lines",
                path.display(),
                stats.lines_skipped,
                stats.lines_read
            );
        }
        if messages.is_empty() {
            log::info!("{} has no usable messages", path.display());
            return Ok(IndexOutcome::Empty);
        }
        self.checkpoint(&session_id, messages.len());

        let chunks = self.chunker.chunk_messages(&messages);
        if chunks.is_empty() {
            return Ok(IndexOutcome::Empty);
        }

        observe(&SessionState::Embedding);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.gateway.embed_texts(&texts).await?;

        // Tags and archived state survive a re-index.
        let existing = self.registry.get(&session_id)?;
        let tags = existing.as_ref().map(|m| m.tags.clone()).unwrap_or_default();
        let archived = existing.as_ref().map(|m| m.archived).unwrap_or(false);

        let project = project_for_path(path);
        let records: Vec<(ChunkRecord, Vec<f32>)> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| {
                (
                    chunk_record(chunk, &session_id, &project, &messages, &tags, archived),
                    vector,
                )
            })
            .collect();
        let chunk_count = records.len();

        observe(&SessionState::Writing);
        self.store.replace_session_chunks(&session_id, records)?;

        let now = Utc::now();
        let created_at = messages.iter().find_map(|m| m.timestamp);
        let updated_at = messages.iter().rev().find_map(|m| m.timestamp).or(Some(now));
        let update = SessionUpdate {
            project: Some(project.clone()),
            created_at,
            updated_at,
            last_synced: Some(now),
            message_count: Some(messages.len()),
            chunk_count: Some(chunk_count),
            ..Default::default()
        };
        match existing {
            Some(_) => {
                self.registry.update(&session_id, update)?;
            }
            None => {
                let mut metadata = SessionMetadata::new(&session_id);
                metadata.project = Some(project);
                metadata.created_at = created_at;
                metadata.updated_at = updated_at;
                metadata.last_synced = Some(now);
                metadata.message_count = messages.len();
                metadata.chunk_count = chunk_count;
                self.registry.add(metadata)?;
            }
        }
        self.checkpoints.clear(&session_id);

        if let Err(err) = self.gateway.flush_cache() {
            log::warn!("Failed to flush embedding cache: {err}");
        }

        log::info!(
            "Indexed {session_id}: {chunk_count} chunks from {} messages",
            messages.len()
        );
        observe(&SessionState::Indexed);
        Ok(IndexOutcome::Indexed {
            chunks: chunk_count,
            messages: messages.len(),
        })
    }

    /// [`Self::index_file`] under a cooperative deadline. Expiry abandons
    /// the in-flight work before anything was written (the chunk swap and
    /// registry write are a single non-cancellable tail).
    pub async fn index_file_with_deadline(
        &self,
        path: &Path,
        deadline: Duration,
    ) -> Result<IndexOutcome> {
        match tokio::time::timeout(deadline, self.index_file(path)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(IndexerError::Timeout {
                path: path.to_path_buf(),
                seconds: deadline.as_secs_f64(),
            }),
        }
    }

    /// Reconcile registry chunk counts against the store. Run on boot to
    /// repair a crash that landed between a chunk swap and the registry
    /// write.
    pub fn reconcile(&self) -> Result<usize> {
        let mut repaired = 0usize;
        for session in self.registry.list(&Default::default())? {
            let actual = self.store.count_by_session(&session.session_id);
            if actual != session.chunk_count && actual > 0 {
                log::warn!(
                    "Repairing chunk count for {}: registry {} vs store {actual}",
                    session.session_id,
                    session.chunk_count
                );
                self.registry.update(
                    &session.session_id,
                    SessionUpdate {
                        chunk_count: Some(actual),
                        ..Default::default()
                    },
                )?;
                repaired += 1;
            }
        }
        Ok(repaired)
    }

    /// Record parse progress every `checkpoint_interval` messages; a crash
    /// loses at most one interval's worth of work.
    fn checkpoint(&self, session_id: &str, messages: usize) {
        if messages % self.checkpoint_interval == 0 || messages >= self.checkpoint_interval {
            if let Err(err) = self.checkpoints.set(session_id, messages) {
                log::warn!("Failed to write checkpoint for {session_id}: {err}");
            }
        }
    }
}

fn chunk_record(
    chunk: &Chunk,
    session_id: &str,
    project: &str,
    messages: &[Message],
    tags: &[String],
    archived: bool,
) -> ChunkRecord {
    // The chunk's timestamp is the first timestamped message in its range.
    let timestamp = messages
        .get(chunk.first_message..=chunk.last_message.min(messages.len() - 1))
        .into_iter()
        .flatten()
        .find_map(|m| m.timestamp);
    ChunkRecord {
        session_id: session_id.to_string(),
        chunk_index: chunk.chunk_index,
        text: chunk.text.clone(),
        token_count: chunk.token_count,
        project: project.to_string(),
        timestamp,
        first_message: chunk.first_message,
        last_message: chunk.last_message,
        memory_types: chunk.memory_types.clone(),
        tags: tags.to_vec(),
        archived,
    }
}

/// Session id is the file stem; unique across the producer's tree.
#[must_use]
pub fn session_id_for_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

/// Project label from the directory layout: `projects/<name>/...` when
/// present, otherwise the parent directory name.
fn project_for_path(path: &Path) -> String {
    let components: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if let Some(idx) = components.iter().position(|c| c == "projects") {
        if idx + 1 < components.len().saturating_sub(1) {
            return components[idx + 1].clone();
        }
    }
    match path.parent().and_then(|p| p.file_name()) {
        Some(name) => {
            let name = name.to_string_lossy();
            if name == ".claude" {
                "default".to_string()
            } else {
                name.into_owned()
            }
        }
        None => "default".to_string(),
    }
}

/// Per-session parse progress, one small JSON map rewritten atomically.
struct CheckpointLog {
    path: PathBuf,
    state: Mutex<BTreeMap<String, usize>>,
}

#[derive(Serialize, Deserialize, Default)]
struct PersistedCheckpoints(BTreeMap<String, usize>);

impl CheckpointLog {
    fn new(storage_dir: &Path) -> Self {
        let path = storage_dir.join("checkpoints.json");
        let state = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PersistedCheckpoints>(&raw).ok())
            .map(|p| p.0)
            .unwrap_or_default();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    fn set(&self, session_id: &str, messages: usize) -> Result<()> {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.insert(session_id.to_string(), messages);
            state.clone()
        };
        self.persist(&snapshot)
    }

    fn clear(&self, session_id: &str) {
        let snapshot = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.remove(session_id);
            state.clone()
        };
        if let Err(err) = self.persist(&snapshot) {
            log::warn!("Failed to clear checkpoint for {session_id}: {err}");
        }
    }

    fn persist(&self, snapshot: &BTreeMap<String, usize>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec(&PersistedCheckpoints(snapshot.clone()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}
