//! Embedding gateway: cache-through batch embedding.
//!
//! `embed_texts` preserves input order, fills cache misses in adaptive
//! batches sized from available memory, and drops intermediate buffers
//! between batches. Model failures surface as `EmbeddingUnavailable`; the
//! gateway never substitutes zero vectors.

use crate::embedder::EmbeddingModel;
use crate::embedding_cache::{CacheStats, EmbeddingCache};
use crate::error::{Result, VectorStoreError};
use std::path::Path;
use std::sync::Arc;
use sysinfo::System;

/// Batch-size bounds and the memory threshold steering adaptive sizing.
#[derive(Debug, Clone, Copy)]
pub struct GatewayLimits {
    pub min_batch: usize,
    pub max_batch: usize,
    /// Below this much available memory the gateway pins to `min_batch`;
    /// above twice this it pins to `max_batch`.
    pub memory_threshold_mb: u64,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            min_batch: 8,
            max_batch: 128,
            memory_threshold_mb: 500,
        }
    }
}

pub struct EmbeddingGateway {
    model: EmbeddingModel,
    cache: Arc<EmbeddingCache>,
    limits: GatewayLimits,
}

impl EmbeddingGateway {
    pub fn new(model: EmbeddingModel, cache_dir: &Path, limits: GatewayLimits) -> Result<Self> {
        Ok(Self {
            model,
            cache: Arc::new(EmbeddingCache::open(cache_dir)?),
            limits,
        })
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.model.dimension()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[must_use]
    pub fn model(&self) -> &EmbeddingModel {
        &self.model
    }

    /// Embed `texts`, returning vectors in input order. Cached texts never
    /// reach the model.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut miss_indices = Vec::new();
        let mut miss_hashes = Vec::new();

        for (idx, text) in texts.iter().enumerate() {
            let hash = EmbeddingCache::content_hash(text);
            match self.cache.get_by_hash(&hash) {
                Some(vector) => vectors[idx] = Some(vector),
                None => {
                    miss_indices.push(idx);
                    miss_hashes.push(hash);
                }
            }
        }

        if !miss_indices.is_empty() {
            let mut cursor = 0usize;
            while cursor < miss_indices.len() {
                let batch_size = self.adaptive_batch_size();
                let end = (cursor + batch_size).min(miss_indices.len());
                let batch: Vec<String> = miss_indices[cursor..end]
                    .iter()
                    .map(|&idx| texts[idx].clone())
                    .collect();

                log::debug!(
                    "Embedding batch of {} ({} of {} misses done)",
                    batch.len(),
                    cursor,
                    miss_indices.len()
                );
                let embedded = self.model.embed_batch(batch).await?;
                if embedded.len() != end - cursor {
                    return Err(VectorStoreError::EmbeddingUnavailable(format!(
                        "model returned {} vectors for a batch of {}",
                        embedded.len(),
                        end - cursor
                    )));
                }

                for (offset, vector) in embedded.into_iter().enumerate() {
                    let idx = miss_indices[cursor + offset];
                    self.cache
                        .put_by_hash(miss_hashes[cursor + offset].clone(), vector.clone());
                    vectors[idx] = Some(vector);
                }
                cursor = end;
                // Memory-reclaim hint between batches: the batch buffer was
                // consumed above; yield lets the runtime run destructors
                // before the next allocation burst.
                tokio::task::yield_now().await;
            }
        }

        let mut out = Vec::with_capacity(vectors.len());
        for vector in vectors {
            out.push(vector.ok_or_else(|| {
                VectorStoreError::EmbeddingUnavailable(
                    "missing vector after cache fill".to_string(),
                )
            })?);
        }
        Ok(out)
    }

    /// Embed one query string (cache-through).
    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        let owned = [text.to_string()];
        let mut vectors = self.embed_texts(&owned).await?;
        vectors
            .pop()
            .ok_or_else(|| VectorStoreError::EmbeddingUnavailable("empty result".into()))
    }

    /// Persist the cache to disk.
    pub fn flush_cache(&self) -> Result<()> {
        self.cache.flush()
    }

    /// Recompute the batch size from currently available memory, clamped to
    /// the configured bounds.
    fn adaptive_batch_size(&self) -> usize {
        let GatewayLimits {
            min_batch,
            max_batch,
            memory_threshold_mb,
        } = self.limits;
        if min_batch >= max_batch {
            return min_batch.max(1);
        }

        let available_mb = available_memory_mb();
        let threshold = memory_threshold_mb.max(1);
        let size = if available_mb >= 2 * threshold {
            max_batch
        } else if available_mb < threshold {
            min_batch
        } else {
            let ratio = (available_mb - threshold) as f64 / threshold as f64;
            min_batch + (ratio * (max_batch - min_batch) as f64) as usize
        };
        size.clamp(min_batch.max(1), max_batch)
    }
}

fn available_memory_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.available_memory() / (1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gateway(dimension: usize) -> (EmbeddingGateway, TempDir) {
        std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
        let tmp = TempDir::new().unwrap();
        let model = EmbeddingModel::new(dimension).unwrap();
        let gw = EmbeddingGateway::new(model, tmp.path(), GatewayLimits::default()).unwrap();
        (gw, tmp)
    }

    #[tokio::test]
    async fn embeds_in_input_order() {
        let (gw, _tmp) = gateway(32);
        let texts: Vec<String> = (0..5).map(|i| format!("doc {i}")).collect();
        let vectors = gw.embed_texts(&texts).await.unwrap();
        assert_eq!(vectors.len(), 5);
        for (i, text) in texts.iter().enumerate() {
            assert_eq!(vectors[i], gw.embed_query(text).await.unwrap());
        }
    }

    #[tokio::test]
    async fn second_call_is_served_from_cache() {
        let (gw, _tmp) = gateway(32);
        let texts: Vec<String> = (0..3).map(|i| format!("cached {i}")).collect();

        let first = gw.embed_texts(&texts).await.unwrap();
        let calls_after_first = gw.model().stub_batch_calls().unwrap();
        assert!(calls_after_first >= 1);

        let second = gw.embed_texts(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            gw.model().stub_batch_calls().unwrap(),
            calls_after_first,
            "cache hit must not invoke the model"
        );
    }

    #[tokio::test]
    async fn mixed_hit_miss_only_embeds_misses() {
        let (gw, _tmp) = gateway(16);
        gw.embed_texts(&["known".to_string()]).await.unwrap();
        let before = gw.model().stub_batch_calls().unwrap();

        let vectors = gw
            .embed_texts(&["known".to_string(), "novel".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(gw.model().stub_batch_calls().unwrap(), before + 1);

        let stats = gw.cache_stats();
        assert!(stats.hits >= 1);
        assert_eq!(stats.entries, 2);
    }

    #[tokio::test]
    async fn cache_survives_flush_and_reopen() {
        std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
        let tmp = TempDir::new().unwrap();
        let text = vec!["durable".to_string()];

        let first = {
            let model = EmbeddingModel::new(16).unwrap();
            let gw = EmbeddingGateway::new(model, tmp.path(), GatewayLimits::default()).unwrap();
            let v = gw.embed_texts(&text).await.unwrap();
            gw.flush_cache().unwrap();
            v
        };

        let model = EmbeddingModel::new(16).unwrap();
        let gw = EmbeddingGateway::new(model, tmp.path(), GatewayLimits::default()).unwrap();
        let second = gw.embed_texts(&text).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(gw.model().stub_batch_calls(), Some(0));
    }
}
