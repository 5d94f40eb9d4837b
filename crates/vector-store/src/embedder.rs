//! Embedding model access.
//!
//! Model loading, tokenization, and device selection are delegated to
//! `fastembed`. The backend sits behind a mutex (inference is not
//! re-entrant) and runs on the blocking pool. `stub` mode replaces the model
//! with deterministic hash-seeded unit vectors so the full pipeline runs in
//! tests without any model assets.

use crate::error::{Result, VectorStoreError};
use sha2::{Digest, Sha256};
use std::env;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum EmbeddingMode {
    Fast,
    Stub,
}

impl EmbeddingMode {
    fn from_env() -> Result<Self> {
        let raw = env::var("REFORK_EMBEDDING_MODE")
            .unwrap_or_else(|_| "fast".to_string())
            .to_ascii_lowercase();
        match raw.as_str() {
            "fast" => Ok(Self::Fast),
            "stub" => Ok(Self::Stub),
            other => Err(VectorStoreError::EmbeddingUnavailable(format!(
                "Unsupported REFORK_EMBEDDING_MODE '{other}' (expected 'fast' or 'stub')"
            ))),
        }
    }
}

/// Identifier of the active embedding mode, for diagnostics.
pub fn current_embedding_mode() -> Result<&'static str> {
    match EmbeddingMode::from_env()? {
        EmbeddingMode::Fast => Ok("fast"),
        EmbeddingMode::Stub => Ok("stub"),
    }
}

enum Backend {
    Fast {
        model: Mutex<fastembed::TextEmbedding>,
        dimension: usize,
    },
    Stub {
        dimension: usize,
        batch_calls: AtomicUsize,
    },
}

/// Handle to the embedding model. Cheap to clone; all clones share one
/// backend instance.
#[derive(Clone)]
pub struct EmbeddingModel {
    backend: Arc<Backend>,
}

impl EmbeddingModel {
    /// Initialise the backend for the configured mode. `dimension` is the
    /// vector size the rest of the system expects; in `fast` mode a mismatch
    /// with the model's actual output surfaces as `EmbeddingUnavailable` on
    /// first use.
    pub fn new(dimension: usize) -> Result<Self> {
        let backend = match EmbeddingMode::from_env()? {
            EmbeddingMode::Stub => Backend::Stub {
                dimension,
                batch_calls: AtomicUsize::new(0),
            },
            EmbeddingMode::Fast => {
                log::info!("Loading embedding model (dimension {dimension})");
                let model = fastembed::TextEmbedding::try_new(Default::default()).map_err(
                    |err| {
                        VectorStoreError::EmbeddingUnavailable(format!(
                            "failed to initialise embedding model: {err}"
                        ))
                    },
                )?;
                Backend::Fast {
                    model: Mutex::new(model),
                    dimension,
                }
            }
        };
        Ok(Self {
            backend: Arc::new(backend),
        })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        match self.backend.as_ref() {
            Backend::Fast { dimension, .. } | Backend::Stub { dimension, .. } => *dimension,
        }
    }

    /// Embed one batch, preserving input order. Vectors are L2-normalized.
    pub async fn embed_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let backend = self.backend.clone();
        tokio::task::spawn_blocking(move || backend.embed_blocking(&texts))
            .await
            .map_err(|err| VectorStoreError::Other(format!("embedding task failed: {err}")))?
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(vec![text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| VectorStoreError::EmbeddingUnavailable("empty batch result".into()))
    }

    /// Number of batch calls issued to the stub backend. `None` in fast mode.
    #[must_use]
    pub fn stub_batch_calls(&self) -> Option<usize> {
        match self.backend.as_ref() {
            Backend::Stub { batch_calls, .. } => Some(batch_calls.load(Ordering::Relaxed)),
            Backend::Fast { .. } => None,
        }
    }
}

impl Backend {
    fn embed_blocking(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match self {
            Self::Stub {
                dimension,
                batch_calls,
            } => {
                batch_calls.fetch_add(1, Ordering::Relaxed);
                Ok(texts
                    .iter()
                    .map(|text| stub_embed(text, *dimension))
                    .collect())
            }
            Self::Fast { model, dimension } => {
                let mut guard = model
                    .lock()
                    .map_err(|_| VectorStoreError::Other("embedding model lock poisoned".into()))?;
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                let mut vectors = guard.embed(refs, None).map_err(|err| {
                    VectorStoreError::EmbeddingUnavailable(format!("inference failed: {err}"))
                })?;
                for vector in &mut vectors {
                    if vector.len() != *dimension {
                        return Err(VectorStoreError::InvalidDimension {
                            expected: *dimension,
                            actual: vector.len(),
                        });
                    }
                    normalize_in_place(vector);
                }
                Ok(vectors)
            }
        }
    }
}

/// Deterministic pseudo-embedding: the normalized sum of hash-seeded unit
/// vectors, one per token. Equal texts embed identically, and texts sharing
/// vocabulary land close in cosine space, so ranking behaves sensibly in
/// tests without a real model.
fn stub_embed(text: &str, dimension: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dimension];
    let mut tokens = 0usize;
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        add_token_vector(&mut vector, &token.to_lowercase());
        tokens += 1;
    }
    if tokens == 0 {
        add_token_vector(&mut vector, text);
    }
    normalize_in_place(&mut vector);
    vector
}

fn add_token_vector(vector: &mut [f32], token: &str) {
    let digest = Sha256::digest(token.as_bytes());
    let mut state = u64::from_le_bytes(digest[..8].try_into().expect("digest is 32 bytes"));
    for slot in vector.iter_mut() {
        // xorshift64* keeps the stream deterministic and well spread.
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let sample = state.wrapping_mul(0x2545_F491_4F6C_DD1D);
        *slot += ((sample >> 32) as f32 / u32::MAX as f32) * 2.0 - 1.0;
    }
}

pub(crate) fn normalize_in_place(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity of two equal-length vectors.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_model(dimension: usize) -> EmbeddingModel {
        std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
        EmbeddingModel::new(dimension).unwrap()
    }

    #[tokio::test]
    async fn stub_embeddings_are_deterministic_and_normalized() {
        let model = stub_model(64);
        let a = model.embed("same text").await.unwrap();
        let b = model.embed("same text").await.unwrap();
        let c = model.embed("different text").await.unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
        let norm: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn stub_similarity_tracks_shared_vocabulary() {
        let model = stub_model(64);
        let query = model.embed("oauth token refresh").await.unwrap();
        let related = model
            .embed("implementing oauth token refresh with a grace window")
            .await
            .unwrap();
        let unrelated = model.embed("css grid layout tricks").await.unwrap();

        let related_sim = cosine_similarity(&query, &related);
        let unrelated_sim = cosine_similarity(&query, &unrelated);
        assert!(related_sim > 0.5, "related {related_sim}");
        assert!(related_sim > unrelated_sim + 0.2);
    }

    #[tokio::test]
    async fn batch_preserves_order() {
        let model = stub_model(32);
        let texts: Vec<String> = (0..10).map(|i| format!("text {i}")).collect();
        let batch = model.embed_batch(texts.clone()).await.unwrap();
        for (i, text) in texts.iter().enumerate() {
            let single = model.embed(text).await.unwrap();
            assert_eq!(batch[i], single);
        }
    }

    #[tokio::test]
    async fn stub_counts_batch_calls() {
        let model = stub_model(16);
        assert_eq!(model.stub_batch_calls(), Some(0));
        model.embed_batch(vec!["a".into(), "b".into()]).await.unwrap();
        assert_eq!(model.stub_batch_calls(), Some(1));
    }

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.3, 0.4, 0.5];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }
}
