//! Near-duplicate session detection.
//!
//! A session-level embedding is the L2-normalized mean of its chunk
//! vectors. Pairs above the similarity threshold where both sides have at
//! least three chunks are reported.

use crate::error::Result;
use refork_vector_store::{cosine_similarity, Partition, VectorStore};
use serde::Serialize;
use std::sync::Arc;

const DEFAULT_THRESHOLD: f32 = 0.85;
const MIN_CHUNKS: usize = 3;

#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    pub session_a: String,
    pub session_b: String,
    pub similarity: f32,
}

pub struct DuplicateService {
    store: Arc<VectorStore>,
    threshold: f32,
}

impl DuplicateService {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self {
            store,
            threshold: DEFAULT_THRESHOLD,
        }
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// All duplicate pairs among active sessions, strongest first.
    pub fn find_duplicates(&self) -> Result<Vec<DuplicatePair>> {
        let profiles = session_profiles(&self.store, MIN_CHUNKS)?;

        let mut pairs = Vec::new();
        for (i, (id_a, vec_a)) in profiles.iter().enumerate() {
            for (id_b, vec_b) in profiles.iter().skip(i + 1) {
                let similarity = cosine_similarity(vec_a, vec_b);
                if similarity >= self.threshold {
                    pairs.push(DuplicatePair {
                        session_a: id_a.clone(),
                        session_b: id_b.clone(),
                        similarity,
                    });
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(pairs)
    }

    /// Sessions similar to one reference session, strongest first.
    pub fn similar_to(&self, session_id: &str, limit: usize) -> Result<Vec<DuplicatePair>> {
        let chunks = self.store.chunks_by_session(session_id)?;
        if chunks.is_empty() {
            return Err(crate::SearchError::NotFound(session_id.to_string()));
        }
        let reference =
            mean_vector(chunks.iter().map(|(_, v)| v.as_slice())).unwrap_or_default();

        let profiles = session_profiles(&self.store, 1)?;
        let mut pairs: Vec<DuplicatePair> = profiles
            .into_iter()
            .filter(|(id, _)| id != session_id)
            .map(|(id, vector)| DuplicatePair {
                session_a: session_id.to_string(),
                similarity: cosine_similarity(&reference, &vector),
                session_b: id,
            })
            .collect();
        pairs.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        pairs.truncate(limit);
        Ok(pairs)
    }
}

/// Session-level embeddings for every active session with at least
/// `min_chunks` chunks.
pub(crate) fn session_profiles(
    store: &VectorStore,
    min_chunks: usize,
) -> Result<Vec<(String, Vec<f32>)>> {
    let mut profiles = Vec::new();
    for session_id in store.session_ids(Partition::Active)? {
        let chunks = store.chunks_by_session(&session_id)?;
        if chunks.len() < min_chunks {
            continue;
        }
        if let Some(mean) = mean_vector(chunks.iter().map(|(_, v)| v.as_slice())) {
            profiles.push((session_id, mean));
        }
    }
    Ok(profiles)
}

pub(crate) fn mean_vector<'a, I>(vectors: I) -> Option<Vec<f32>>
where
    I: IntoIterator<Item = &'a [f32]>,
{
    let mut iter = vectors.into_iter();
    let first = iter.next()?;
    let mut sum: Vec<f32> = first.to_vec();
    let mut count = 1usize;
    for vector in iter {
        for (s, v) in sum.iter_mut().zip(vector) {
            *s += v;
        }
        count += 1;
    }
    for s in &mut sum {
        *s /= count as f32;
    }
    let norm: f32 = sum.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for s in &mut sum {
            *s /= norm;
        }
    }
    Some(sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use refork_vector_store::ChunkRecord;
    use tempfile::TempDir;

    fn record(session: &str, index: usize) -> ChunkRecord {
        ChunkRecord {
            session_id: session.to_string(),
            chunk_index: index,
            text: format!("{session} {index}"),
            token_count: 2,
            project: "demo".to_string(),
            timestamp: None,
            first_message: index,
            last_message: index,
            memory_types: Vec::new(),
            tags: Vec::new(),
            archived: false,
        }
    }

    fn seed(store: &VectorStore, session: &str, base: [f32; 4], count: usize) {
        let chunks = (0..count)
            .map(|i| (record(session, i), base.to_vec()))
            .collect();
        store.upsert_chunks(chunks).unwrap();
    }

    #[test]
    fn detects_near_identical_sessions() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        seed(&store, "twin-1", [1.0, 0.0, 0.0, 0.0], 3);
        seed(&store, "twin-2", [1.0, 0.05, 0.0, 0.0], 3);
        seed(&store, "loner", [0.0, 0.0, 1.0, 0.0], 3);

        let pairs = DuplicateService::new(store).find_duplicates().unwrap();
        assert_eq!(pairs.len(), 1);
        let pair = &pairs[0];
        assert!(pair.session_a.starts_with("twin"));
        assert!(pair.session_b.starts_with("twin"));
        assert!(pair.similarity > 0.95);
    }

    #[test]
    fn sessions_below_min_chunks_are_ignored() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        seed(&store, "small-1", [1.0, 0.0, 0.0, 0.0], 2);
        seed(&store, "small-2", [1.0, 0.0, 0.0, 0.0], 2);

        let pairs = DuplicateService::new(store).find_duplicates().unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn similar_to_ranks_by_similarity() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        seed(&store, "ref", [1.0, 0.0, 0.0, 0.0], 3);
        seed(&store, "close", [0.9, 0.1, 0.0, 0.0], 3);
        seed(&store, "far", [0.0, 1.0, 0.0, 0.0], 3);

        let pairs = DuplicateService::new(store).similar_to("ref", 5).unwrap();
        assert_eq!(pairs[0].session_b, "close");
        assert!(pairs[0].similarity > pairs[1].similarity);
    }
}
