//! Composite session scoring.
//!
//! Base score is a weighted sum of five factors, each in [0, 1]:
//!
//! ```text
//! 0.40·best + 0.20·avg + 0.05·ratio + 0.25·recency + 0.10·chain
//! ```
//!
//! Memory, preference, and temporal boosts are added afterwards, so totals
//! can exceed 1 (bounded by 1 + 0.15 + 0.10 + 0.10).

use crate::temporal::TemporalQuery;
use chrono::{DateTime, Utc};
use refork_registry::PreferenceRecord;
use refork_transcript::{MemoryExtractor, MemoryKind};
use serde::Serialize;

const CHAIN_QUALITY_PLACEHOLDER: f32 = 0.5;
const RECENCY_DECAY_DAYS: f64 = 30.0;

#[derive(Debug, Clone, Copy)]
pub struct ScoringWeights {
    pub best: f32,
    pub avg: f32,
    pub ratio: f32,
    pub recency: f32,
    pub chain: f32,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            best: 0.40,
            avg: 0.20,
            ratio: 0.05,
            recency: 0.25,
            chain: 0.10,
        }
    }
}

/// Full score breakdown for one session, kept on every search result.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreBreakdown {
    pub session_id: String,
    pub total: f32,
    pub best_similarity: f32,
    pub avg_similarity: f32,
    pub chunk_ratio: f32,
    pub recency: f32,
    pub chain_quality: f32,
    pub memory_boost: f32,
    pub preference_boost: f32,
    pub temporal_boost: f32,
    pub matched_chunks: usize,
    #[serde(skip)]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct ScoringService {
    weights: ScoringWeights,
    similarity_threshold: f32,
}

impl ScoringService {
    #[must_use]
    pub fn new(similarity_threshold: f32, recency_weight: f32) -> Self {
        let weights = ScoringWeights {
            recency: recency_weight,
            ..Default::default()
        };
        Self {
            weights,
            similarity_threshold,
        }
    }

    #[must_use]
    pub const fn with_weights(weights: ScoringWeights, similarity_threshold: f32) -> Self {
        Self {
            weights,
            similarity_threshold,
        }
    }

    /// Score one session from its hit chunks and metadata.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn score_session(
        &self,
        session_id: &str,
        similarities: &[f32],
        total_chunks: usize,
        updated_at: Option<DateTime<Utc>>,
        memory_types: &[MemoryKind],
        preference: Option<&PreferenceRecord>,
        temporal: Option<&TemporalQuery>,
        now: DateTime<Utc>,
    ) -> ScoreBreakdown {
        if similarities.is_empty() {
            return ScoreBreakdown {
                session_id: session_id.to_string(),
                total: 0.0,
                best_similarity: 0.0,
                avg_similarity: 0.0,
                chunk_ratio: 0.0,
                recency: 0.0,
                chain_quality: CHAIN_QUALITY_PLACEHOLDER,
                memory_boost: 0.0,
                preference_boost: 0.0,
                temporal_boost: 0.0,
                matched_chunks: 0,
                updated_at,
            };
        }

        let best = similarities.iter().copied().fold(f32::MIN, f32::max);
        let avg = similarities.iter().sum::<f32>() / similarities.len() as f32;
        let ratio = if total_chunks > 0 {
            (similarities.len() as f32 / total_chunks as f32).min(1.0)
        } else {
            0.0
        };
        let recency = recency_score(updated_at, now);
        let chain = CHAIN_QUALITY_PLACEHOLDER;

        let base = best * self.weights.best
            + avg * self.weights.avg
            + ratio * self.weights.ratio
            + recency * self.weights.recency
            + chain * self.weights.chain;

        let memory_boost = MemoryExtractor::boost_for(memory_types);
        let preference_boost = preference.map(|p| p.boost(now)).unwrap_or(0.0);
        let temporal_boost = temporal.map(|t| t.boost(updated_at, now)).unwrap_or(0.0);

        let total = (base + memory_boost + preference_boost + temporal_boost).max(0.0);

        ScoreBreakdown {
            session_id: session_id.to_string(),
            total,
            best_similarity: best,
            avg_similarity: avg,
            chunk_ratio: ratio,
            recency,
            chain_quality: chain,
            memory_boost,
            preference_boost,
            temporal_boost,
            matched_chunks: similarities.len(),
            updated_at,
        }
    }

    /// Drop sessions below the similarity threshold and sort: total score
    /// descending, then newer `updated_at`, then higher best similarity.
    #[must_use]
    pub fn rank(&self, mut scores: Vec<ScoreBreakdown>) -> Vec<ScoreBreakdown> {
        scores.retain(|s| s.best_similarity >= self.similarity_threshold);
        scores.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
                .then_with(|| {
                    b.best_similarity
                        .partial_cmp(&a.best_similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.session_id.cmp(&b.session_id))
        });
        scores
    }
}

fn recency_score(updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f32 {
    let Some(updated_at) = updated_at else {
        return 0.0;
    };
    let age_secs = (now - updated_at).num_seconds().max(0) as f64;
    let age_days = age_secs / 86_400.0;
    (-age_days / RECENCY_DECAY_DAYS).exp() as f32
}
