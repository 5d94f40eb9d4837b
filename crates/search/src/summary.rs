//! Extractive session summaries.
//!
//! Top-k sentences by TF-IDF over the session's chunk text, with fenced
//! code stripped first. The summary is cached on the registry row together
//! with the chunk count it was built from; a drift of 10 % or more triggers
//! regeneration.

use crate::error::{Result, SearchError};
use refork_registry::{SessionRegistry, SessionUpdate};
use refork_vector_store::VectorStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DEFAULT_SENTENCES: usize = 3;
const REGENERATE_DRIFT: f64 = 0.10;

pub struct SummaryService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    sentences: usize,
}

impl SummaryService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<SessionRegistry>) -> Self {
        Self {
            store,
            registry,
            sentences: DEFAULT_SENTENCES,
        }
    }

    /// Return the cached summary when still fresh, regenerating otherwise.
    pub fn get_or_generate(&self, session_id: &str) -> Result<String> {
        let metadata = self
            .registry
            .get(session_id)?
            .ok_or_else(|| SearchError::NotFound(session_id.to_string()))?;

        if let (Some(summary), Some(basis)) = (&metadata.summary, metadata.summary_chunk_count) {
            let drift = if basis == 0 {
                1.0
            } else {
                (metadata.chunk_count as f64 - basis as f64).abs() / basis as f64
            };
            if drift < REGENERATE_DRIFT {
                return Ok(summary.clone());
            }
        }

        let chunks = self.store.chunks_by_session(session_id)?;
        if chunks.is_empty() {
            return Err(SearchError::NotFound(format!(
                "session {session_id} has no indexed chunks"
            )));
        }
        let text: String = chunks
            .iter()
            .map(|(record, _)| record.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        let summary = extractive_summary(&text, self.sentences);

        self.registry.update(
            session_id,
            SessionUpdate {
                summary: Some(Some(summary.clone())),
                summary_chunk_count: Some(Some(metadata.chunk_count)),
                ..Default::default()
            },
        )?;
        Ok(summary)
    }
}

/// Pick the `k` highest-scoring sentences (by mean TF-IDF of their terms)
/// and emit them in original order.
fn extractive_summary(text: &str, k: usize) -> String {
    let stripped = strip_code_blocks(text);
    let sentences = split_sentences(&stripped);
    if sentences.is_empty() {
        return String::new();
    }
    if sentences.len() <= k {
        return sentences.join(" ");
    }

    // Document frequency over sentences.
    let tokenized: Vec<Vec<String>> = sentences.iter().map(|s| tokenize(s)).collect();
    let mut df: HashMap<&str, usize> = HashMap::new();
    for tokens in &tokenized {
        let unique: HashSet<&str> = tokens.iter().map(String::as_str).collect();
        for token in unique {
            *df.entry(token).or_insert(0) += 1;
        }
    }
    let n = sentences.len() as f64;

    let mut scored: Vec<(usize, f64)> = tokenized
        .iter()
        .enumerate()
        .map(|(idx, tokens)| {
            if tokens.is_empty() {
                return (idx, 0.0);
            }
            let mut tf: HashMap<&str, f64> = HashMap::new();
            for token in tokens {
                *tf.entry(token).or_insert(0.0) += 1.0;
            }
            let score: f64 = tf
                .iter()
                .map(|(token, count)| {
                    let idf = (n / (1.0 + df[token] as f64)).ln().max(0.0);
                    (count / tokens.len() as f64) * idf
                })
                .sum();
            (idx, score)
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut picked: Vec<usize> = scored.iter().take(k).map(|(idx, _)| *idx).collect();
    picked.sort_unstable();
    picked
        .into_iter()
        .map(|idx| sentences[idx].clone())
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_code_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_fence = false;
    for line in text.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if !in_fence {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .flat_map(|part| part.split('\n'))
        .map(str::trim)
        .filter(|s| s.split_whitespace().count() >= 3)
        .map(String::from)
        .collect()
}

const STOPWORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
    "in", "on", "for", "with", "at", "by", "from", "it", "this", "that", "i", "you", "we", "they",
];

fn tokenize(sentence: &str) -> Vec<String> {
    sentence
        .split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(&t.as_str()))
        .collect()
}
