//! Partitioned chunk store.
//!
//! Two partitions (`active`, `archive`) share one schema. Readers take a
//! read lock and always observe a session entirely pre- or post-mutation;
//! re-indexing swaps a session's chunks inside a single write-lock section,
//! so a live searcher never sees the session half-gone.
//!
//! The persisted form keeps chunk metadata as flat string scalars: list
//! fields encode to JSON strings and timestamps to RFC 3339, decoded
//! losslessly on load. This store is the only component that knows about
//! that constraint.

use crate::error::{Result, VectorStoreError};
use crate::knn::CosineIndex;
use chrono::{DateTime, Utc};
use refork_transcript::MemoryKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

const STORE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Active,
    Archive,
}

impl Partition {
    const fn dir_name(self) -> &'static str {
        match self {
            Self::Active => "vector_db",
            Self::Archive => "archive",
        }
    }
}

/// One chunk as the indexer hands it over (embedding attached separately).
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRecord {
    pub session_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub project: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub first_message: usize,
    pub last_message: usize,
    pub memory_types: Vec<MemoryKind>,
    pub tags: Vec<String>,
    pub archived: bool,
}

impl ChunkRecord {
    #[must_use]
    pub fn chunk_id(&self) -> String {
        format!("{}:{}", self.session_id, self.chunk_index)
    }
}

/// A chunk hit returned from search, with its similarity.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk: ChunkRecord,
    pub similarity: f32,
    pub partition: Partition,
}

/// Equality and range filters evaluated inside the k-NN scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilter {
    pub project: Option<String>,
    pub archived: Option<bool>,
    /// Any-of membership.
    pub tags: Option<Vec<String>>,
    /// Any-of membership.
    pub memory_types: Option<Vec<MemoryKind>>,
    pub time_from: Option<DateTime<Utc>>,
    pub time_to: Option<DateTime<Utc>>,
}

impl SearchFilter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Stable key for cache lookups: sorted fields, normalized casing.
    #[must_use]
    pub fn canonical_key(&self) -> String {
        let mut tags = self.tags.clone().unwrap_or_default();
        tags.iter_mut().for_each(|t| *t = t.to_lowercase());
        tags.sort();
        let mut kinds: Vec<&str> = self
            .memory_types
            .iter()
            .flatten()
            .map(|k| k.as_str())
            .collect();
        kinds.sort_unstable();
        format!(
            "project={};archived={};tags={};memory={};from={};to={}",
            self.project.as_deref().unwrap_or(""),
            self.archived.map(|b| b.to_string()).unwrap_or_default(),
            tags.join(","),
            kinds.join(","),
            self.time_from.map(|t| t.to_rfc3339()).unwrap_or_default(),
            self.time_to.map(|t| t.to_rfc3339()).unwrap_or_default(),
        )
    }

    fn matches(&self, chunk: &ChunkRecord) -> bool {
        if let Some(project) = &self.project {
            if &chunk.project != project {
                return false;
            }
        }
        if let Some(archived) = self.archived {
            if chunk.archived != archived {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            if !tags.iter().any(|t| chunk.tags.iter().any(|c| c == t)) {
                return false;
            }
        }
        if let Some(kinds) = &self.memory_types {
            if !kinds.iter().any(|k| chunk.memory_types.contains(k)) {
                return false;
            }
        }
        if self.time_from.is_some() || self.time_to.is_some() {
            let Some(ts) = chunk.timestamp else {
                return false;
            };
            if let Some(from) = self.time_from {
                if ts < from {
                    return false;
                }
            }
            if let Some(to) = self.time_to {
                if ts > to {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreStats {
    pub active_chunks: usize,
    pub archive_chunks: usize,
    pub active_sessions: usize,
    pub archive_sessions: usize,
}

struct PartitionState {
    chunks: HashMap<String, (ChunkRecord, Vec<f32>)>,
    index: CosineIndex,
}

impl PartitionState {
    fn new(dimension: usize) -> Self {
        Self {
            chunks: HashMap::new(),
            index: CosineIndex::new(dimension),
        }
    }

    fn insert(&mut self, record: ChunkRecord, vector: Vec<f32>) -> Result<()> {
        let id = record.chunk_id();
        self.index.add(id.clone(), vector.clone())?;
        self.chunks.insert(id, (record, vector));
        Ok(())
    }

    fn remove_session(&mut self, session_id: &str) -> usize {
        let ids: Vec<String> = self
            .chunks
            .iter()
            .filter(|(_, (record, _))| record.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.chunks.remove(id);
            self.index.remove(id);
        }
        ids.len()
    }

    fn session_count(&self) -> usize {
        self.chunks
            .values()
            .map(|(record, _)| record.session_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

struct Inner {
    active: PartitionState,
    archive: PartitionState,
}

impl Inner {
    fn partition(&self, partition: Partition) -> &PartitionState {
        match partition {
            Partition::Active => &self.active,
            Partition::Archive => &self.archive,
        }
    }

    fn partition_mut(&mut self, partition: Partition) -> &mut PartitionState {
        match partition {
            Partition::Active => &mut self.active,
            Partition::Archive => &mut self.archive,
        }
    }
}

pub struct VectorStore {
    base_dir: PathBuf,
    dimension: usize,
    inner: RwLock<Inner>,
    generation: AtomicU64,
}

impl VectorStore {
    /// Open the store under `base_dir`, loading both partitions if their
    /// index files exist.
    pub fn open(base_dir: &Path, dimension: usize) -> Result<Self> {
        let mut inner = Inner {
            active: PartitionState::new(dimension),
            archive: PartitionState::new(dimension),
        };
        for partition in [Partition::Active, Partition::Archive] {
            let path = index_path(base_dir, partition);
            if path.exists() {
                load_partition(&path, dimension, inner.partition_mut(partition))?;
            }
        }
        log::info!(
            "Vector store opened ({} active / {} archived chunks)",
            inner.active.chunks.len(),
            inner.archive.chunks.len()
        );
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            dimension,
            inner: RwLock::new(inner),
            generation: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.dimension
    }

    /// Monotone counter bumped on every mutation. Result caches stamp
    /// entries with this and discard them when it moves.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Insert (or overwrite) embedded chunks in the active partition.
    pub fn upsert_chunks(&self, chunks: Vec<(ChunkRecord, Vec<f32>)>) -> Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut inner = self.write()?;
        for (record, vector) in chunks {
            inner.active.insert(record, vector)?;
        }
        drop(inner);
        self.bump_generation();
        Ok(())
    }

    /// Atomically replace every chunk of `session_id` in the active
    /// partition. A concurrent searcher sees the old set or the new set,
    /// never a window with neither.
    pub fn replace_session_chunks(
        &self,
        session_id: &str,
        chunks: Vec<(ChunkRecord, Vec<f32>)>,
    ) -> Result<usize> {
        let mut inner = self.write()?;
        inner.active.remove_session(session_id);
        inner.archive.remove_session(session_id);
        let inserted = chunks.len();
        for (record, vector) in chunks {
            inner.active.insert(record, vector)?;
        }
        drop(inner);
        self.bump_generation();
        Ok(inserted)
    }

    /// Remove every chunk of `session_id` from both partitions.
    pub fn delete_by_session(&self, session_id: &str) -> Result<usize> {
        let mut inner = self.write()?;
        let removed =
            inner.active.remove_session(session_id) + inner.archive.remove_session(session_id);
        drop(inner);
        if removed > 0 {
            self.bump_generation();
        }
        Ok(removed)
    }

    /// Filtered top-`k` over the requested partitions, merged by similarity.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &SearchFilter,
        partitions: &[Partition],
    ) -> Result<Vec<ChunkHit>> {
        let inner = self.read()?;
        let mut merged: Vec<ChunkHit> = Vec::new();
        for &partition in partitions {
            let state = inner.partition(partition);
            let hits = state.index.search(query, k, |id| {
                state
                    .chunks
                    .get(id)
                    .is_some_and(|(record, _)| filter.matches(record))
            })?;
            for (id, similarity) in hits {
                if let Some((record, _)) = state.chunks.get(&id) {
                    merged.push(ChunkHit {
                        chunk: record.clone(),
                        similarity,
                        partition,
                    });
                }
            }
        }
        merged.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id().cmp(&b.chunk.chunk_id()))
        });
        merged.truncate(k);
        Ok(merged)
    }

    #[must_use]
    pub fn count_by_session(&self, session_id: &str) -> usize {
        let Ok(inner) = self.read() else {
            return 0;
        };
        [&inner.active, &inner.archive]
            .iter()
            .map(|p| {
                p.chunks
                    .values()
                    .filter(|(record, _)| record.session_id == session_id)
                    .count()
            })
            .sum()
    }

    /// All chunks of a session (both partitions), with vectors, ordered by
    /// chunk index.
    pub fn chunks_by_session(&self, session_id: &str) -> Result<Vec<(ChunkRecord, Vec<f32>)>> {
        let inner = self.read()?;
        let mut chunks: Vec<(ChunkRecord, Vec<f32>)> = [&inner.active, &inner.archive]
            .iter()
            .flat_map(|p| p.chunks.values())
            .filter(|(record, _)| record.session_id == session_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|(record, _)| record.chunk_index);
        Ok(chunks)
    }

    /// Session ids present in a partition.
    pub fn session_ids(&self, partition: Partition) -> Result<Vec<String>> {
        let inner = self.read()?;
        let mut ids: Vec<String> = inner
            .partition(partition)
            .chunks
            .values()
            .map(|(record, _)| record.session_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Move a session between partitions: chunks are copied into the target
    /// (with the archived flag rewritten) and membership flips inside one
    /// write-lock section.
    pub fn move_to_partition(&self, session_id: &str, target: Partition) -> Result<usize> {
        let mut inner = self.write()?;
        let source = match target {
            Partition::Active => Partition::Archive,
            Partition::Archive => Partition::Active,
        };
        let moved: Vec<(ChunkRecord, Vec<f32>)> = inner
            .partition(source)
            .chunks
            .values()
            .filter(|(record, _)| record.session_id == session_id)
            .cloned()
            .collect();
        if moved.is_empty() {
            return Err(VectorStoreError::NotFound(format!(
                "session {session_id} has no chunks in the source partition"
            )));
        }
        let count = moved.len();
        for (mut record, vector) in moved {
            record.archived = target == Partition::Archive;
            inner.partition_mut(target).insert(record, vector)?;
        }
        inner.partition_mut(source).remove_session(session_id);
        drop(inner);
        self.bump_generation();
        Ok(count)
    }

    /// Rewrite the stored tag metadata of every chunk of a session, keeping
    /// tag-filtered search correct after tagging changes.
    pub fn set_session_tags(&self, session_id: &str, tags: &[String]) -> Result<usize> {
        let mut inner = self.write()?;
        let mut updated = 0usize;
        for partition in [Partition::Active, Partition::Archive] {
            let state = inner.partition_mut(partition);
            for (record, _) in state.chunks.values_mut() {
                if record.session_id == session_id {
                    record.tags = tags.to_vec();
                    updated += 1;
                }
            }
        }
        drop(inner);
        if updated > 0 {
            self.bump_generation();
        }
        Ok(updated)
    }

    #[must_use]
    pub fn stats(&self) -> StoreStats {
        let Ok(inner) = self.read() else {
            return StoreStats::default();
        };
        StoreStats {
            active_chunks: inner.active.chunks.len(),
            archive_chunks: inner.archive.chunks.len(),
            active_sessions: inner.active.session_count(),
            archive_sessions: inner.archive.session_count(),
        }
    }

    /// Persist both partitions (temp + atomic rename each).
    pub fn save(&self) -> Result<()> {
        let snapshots = {
            let inner = self.read()?;
            [Partition::Active, Partition::Archive].map(|partition| {
                (partition, persist_partition(inner.partition(partition), self.dimension))
            })
        };
        for (partition, persisted) in snapshots {
            let path = index_path(&self.base_dir, partition);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let data = serde_json::to_vec(&persisted)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, data)?;
            if let Err(err) = std::fs::rename(&tmp, &path) {
                let _ = std::fs::remove_file(&tmp);
                return Err(err.into());
            }
        }
        log::debug!("Vector store saved to {}", self.base_dir.display());
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| VectorStoreError::StoreUnavailable("store lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| VectorStoreError::StoreUnavailable("store lock poisoned".into()))
    }
}

fn index_path(base_dir: &Path, partition: Partition) -> PathBuf {
    base_dir.join(partition.dir_name()).join("index.json")
}

// ---------------------------------------------------------------------------
// Persistence: scalar-safe metadata round-trip

#[derive(Serialize, Deserialize)]
struct PersistedStore {
    schema_version: u32,
    dimension: usize,
    chunks: BTreeMap<String, PersistedChunk>,
}

#[derive(Serialize, Deserialize)]
struct PersistedChunk {
    text: String,
    vector: Vec<f32>,
    /// Flat scalar map; lists are JSON-encoded strings, timestamps RFC 3339.
    meta: BTreeMap<String, String>,
}

fn encode_meta(record: &ChunkRecord) -> Result<BTreeMap<String, String>> {
    let mut meta = BTreeMap::new();
    meta.insert("session_id".into(), record.session_id.clone());
    meta.insert("chunk_index".into(), record.chunk_index.to_string());
    meta.insert("token_count".into(), record.token_count.to_string());
    meta.insert("project".into(), record.project.clone());
    if let Some(ts) = record.timestamp {
        meta.insert("timestamp".into(), ts.to_rfc3339());
    }
    meta.insert(
        "message_indices".into(),
        serde_json::to_string(&[record.first_message, record.last_message])?,
    );
    let kinds: Vec<&str> = record.memory_types.iter().map(|k| k.as_str()).collect();
    meta.insert("memory_types".into(), serde_json::to_string(&kinds)?);
    meta.insert("tags".into(), serde_json::to_string(&record.tags)?);
    meta.insert("archived".into(), record.archived.to_string());
    Ok(meta)
}

fn decode_meta(text: String, meta: &BTreeMap<String, String>) -> Result<ChunkRecord> {
    let field = |key: &str| -> Result<&String> {
        meta.get(key)
            .ok_or_else(|| VectorStoreError::Other(format!("missing chunk metadata field {key}")))
    };
    let session_id = field("session_id")?.clone();
    let chunk_index: usize = field("chunk_index")?
        .parse()
        .map_err(|e| VectorStoreError::Other(format!("bad chunk_index: {e}")))?;
    let token_count: usize = field("token_count")?
        .parse()
        .map_err(|e| VectorStoreError::Other(format!("bad token_count: {e}")))?;
    let timestamp = match meta.get("timestamp") {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map_err(|e| VectorStoreError::Other(format!("bad timestamp: {e}")))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    let indices: [usize; 2] = serde_json::from_str(field("message_indices")?)?;
    let kind_names: Vec<String> = serde_json::from_str(field("memory_types")?)?;
    let memory_types = kind_names
        .iter()
        .filter_map(|name| MemoryKind::parse(name))
        .collect();
    let tags: Vec<String> = serde_json::from_str(field("tags")?)?;
    let archived = field("archived")? == "true";

    Ok(ChunkRecord {
        session_id,
        chunk_index,
        text,
        token_count,
        project: field("project")?.clone(),
        timestamp,
        first_message: indices[0],
        last_message: indices[1],
        memory_types,
        tags,
        archived,
    })
}

fn persist_partition(state: &PartitionState, dimension: usize) -> PersistedStore {
    let mut chunks = BTreeMap::new();
    for (id, (record, vector)) in &state.chunks {
        match encode_meta(record) {
            Ok(meta) => {
                chunks.insert(
                    id.clone(),
                    PersistedChunk {
                        text: record.text.clone(),
                        vector: vector.clone(),
                        meta,
                    },
                );
            }
            Err(err) => log::warn!("Skipping unserializable chunk {id}: {err}"),
        }
    }
    PersistedStore {
        schema_version: STORE_SCHEMA_VERSION,
        dimension,
        chunks,
    }
}

fn load_partition(path: &Path, dimension: usize, state: &mut PartitionState) -> Result<()> {
    let raw = std::fs::read_to_string(path)?;
    let persisted: PersistedStore = serde_json::from_str(&raw)?;
    if persisted.schema_version != STORE_SCHEMA_VERSION {
        return Err(VectorStoreError::StoreUnavailable(format!(
            "unsupported store schema_version {} at {}",
            persisted.schema_version,
            path.display()
        )));
    }
    if persisted.dimension != dimension {
        log::warn!(
            "Store at {} has dimension {} but {} expected; dropping persisted vectors",
            path.display(),
            persisted.dimension,
            dimension
        );
        return Ok(());
    }
    let mut dropped = 0usize;
    for (id, chunk) in persisted.chunks {
        match decode_meta(chunk.text, &chunk.meta) {
            Ok(record) => state.insert(record, chunk.vector)?,
            Err(err) => {
                dropped += 1;
                log::warn!("Dropping undecodable chunk {id}: {err}");
            }
        }
    }
    if dropped > 0 {
        log::warn!("Dropped {dropped} chunks while loading {}", path.display());
    }
    Ok(())
}
