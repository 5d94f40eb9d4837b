//! Semantic comparison of two sessions.
//!
//! Greedy cosine pairing of chunks above a threshold, plus topic-set
//! overlap. `overall = 0.7·content + 0.3·topic_overlap`.

use crate::error::{Result, SearchError};
use refork_registry::SessionRegistry;
use refork_vector_store::{cosine_similarity, VectorStore};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_PAIR_THRESHOLD: f32 = 0.75;
const TOPIC_LIMIT: usize = 12;

#[derive(Debug, Clone, Serialize)]
pub struct ChunkMatch {
    pub index_a: usize,
    pub index_b: usize,
    pub similarity: f32,
    pub excerpt_a: String,
    pub excerpt_b: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiff {
    pub session_a: String,
    pub session_b: String,
    pub overall: f32,
    pub content_score: f32,
    pub topic_overlap: f32,
    pub common: Vec<ChunkMatch>,
    pub unique_to_a: Vec<usize>,
    pub unique_to_b: Vec<usize>,
    pub topics_a: Vec<String>,
    pub topics_b: Vec<String>,
    pub common_topics: Vec<String>,
}

pub struct DiffService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    pair_threshold: f32,
}

impl DiffService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            registry,
            pair_threshold: DEFAULT_PAIR_THRESHOLD,
        }
    }

    pub fn compare(&self, session_a: &str, session_b: &str) -> Result<SessionDiff> {
        for id in [session_a, session_b] {
            if self.registry.get(id)?.is_none() {
                return Err(SearchError::NotFound(id.to_string()));
            }
        }
        let chunks_a = self.store.chunks_by_session(session_a)?;
        let chunks_b = self.store.chunks_by_session(session_b)?;
        if chunks_a.is_empty() || chunks_b.is_empty() {
            return Err(SearchError::InvalidArgument(
                "both sessions must have indexed chunks".to_string(),
            ));
        }

        // Greedy best-pair matching above the threshold; each chunk is used
        // at most once.
        let mut candidates: Vec<(usize, usize, f32)> = Vec::new();
        for (i, (_, vec_a)) in chunks_a.iter().enumerate() {
            for (j, (_, vec_b)) in chunks_b.iter().enumerate() {
                let similarity = cosine_similarity(vec_a, vec_b);
                if similarity >= self.pair_threshold {
                    candidates.push((i, j, similarity));
                }
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_a = HashSet::new();
        let mut used_b = HashSet::new();
        let mut common = Vec::new();
        for (i, j, similarity) in candidates {
            if used_a.contains(&i) || used_b.contains(&j) {
                continue;
            }
            used_a.insert(i);
            used_b.insert(j);
            common.push(ChunkMatch {
                index_a: i,
                index_b: j,
                similarity,
                excerpt_a: excerpt(&chunks_a[i].0.text),
                excerpt_b: excerpt(&chunks_b[j].0.text),
            });
        }

        let unique_to_a: Vec<usize> = (0..chunks_a.len())
            .filter(|i| !used_a.contains(i))
            .collect();
        let unique_to_b: Vec<usize> = (0..chunks_b.len())
            .filter(|j| !used_b.contains(j))
            .collect();

        // Matched mass over total mass, weighted by pair similarity.
        let matched_mass: f32 = common.iter().map(|m| m.similarity * 2.0).sum();
        let content_score =
            (matched_mass / (chunks_a.len() + chunks_b.len()) as f32).clamp(0.0, 1.0);

        let topics_a = top_topics(&chunks_a);
        let topics_b = top_topics(&chunks_b);
        let set_a: HashSet<&String> = topics_a.iter().collect();
        let set_b: HashSet<&String> = topics_b.iter().collect();
        let intersection = set_a.intersection(&set_b).count();
        let union = set_a.union(&set_b).count();
        let topic_overlap = if union == 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        };
        let mut common_topics: Vec<String> = set_a
            .intersection(&set_b)
            .map(|t| (*t).clone())
            .collect();
        common_topics.sort();

        Ok(SessionDiff {
            session_a: session_a.to_string(),
            session_b: session_b.to_string(),
            overall: 0.7 * content_score + 0.3 * topic_overlap,
            content_score,
            topic_overlap,
            common,
            unique_to_a,
            unique_to_b,
            topics_a,
            topics_b,
            common_topics,
        })
    }
}

fn excerpt(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= 100 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(100).collect();
        format!("{cut}...")
    }
}

/// Most frequent informative tokens across a session's chunks.
fn top_topics(chunks: &[(refork_vector_store::ChunkRecord, Vec<f32>)]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for (record, _) in chunks {
        for token in record
            .text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() >= 4)
        {
            let lowered = token.to_lowercase();
            if COMMON_WORDS.contains(&lowered.as_str()) {
                continue;
            }
            *counts.entry(lowered).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(TOPIC_LIMIT)
        .map(|(topic, _)| topic)
        .collect()
}

const COMMON_WORDS: &[&str] = &[
    "this", "that", "with", "from", "have", "what", "when", "where", "which", "will", "would",
    "could", "should", "there", "here", "then", "than", "them", "they", "your", "just", "like",
    "into", "about", "some", "been", "were", "does", "need", "want", "make", "using", "used",
];
