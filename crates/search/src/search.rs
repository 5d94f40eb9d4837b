//! Search orchestration: cache probe, embed, k-NN, group, rank, preview.

use crate::cache::{normalize_query, LruTtlCache};
use crate::error::Result;
use crate::scoring::{ScoreBreakdown, ScoringService};
use crate::temporal::TemporalQuery;
use chrono::Utc;
use refork_config::Config;
use refork_registry::{ForkHistory, PreferenceService, SessionRegistry};
use refork_transcript::MemoryKind;
use refork_vector_store::{ChunkHit, EmbeddingGateway, Partition, SearchFilter, VectorStore};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub project: Option<String>,
    pub tags: Vec<String>,
    pub time_range: Option<TemporalQuery>,
    pub include_archive: bool,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub session_id: String,
    pub score: ScoreBreakdown,
    pub metadata: refork_registry::SessionMetadata,
    pub preview: String,
    pub matched_chunks: usize,
}

#[derive(Clone)]
struct CachedResults {
    generation: u64,
    results: Vec<SearchResult>,
}

pub struct SearchService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    gateway: Arc<EmbeddingGateway>,
    fork_history: Arc<ForkHistory>,
    scoring: ScoringService,
    k_chunks: usize,
    top_n_sessions: usize,
    preview_length: usize,
    embedding_cache: LruTtlCache<Vec<f32>>,
    result_cache: LruTtlCache<CachedResults>,
}

impl SearchService {
    pub fn new(
        config: &Config,
        store: Arc<VectorStore>,
        registry: Arc<SessionRegistry>,
        gateway: Arc<EmbeddingGateway>,
        fork_history: Arc<ForkHistory>,
    ) -> Self {
        let ttl = Duration::from_secs(config.cache.ttl_seconds);
        Self {
            store,
            registry,
            gateway,
            fork_history,
            scoring: ScoringService::new(
                config.search.similarity_threshold,
                config.search.recency_weight,
            ),
            k_chunks: config.search.k_chunks,
            top_n_sessions: config.search.top_n_sessions,
            preview_length: config.search.preview_length,
            embedding_cache: LruTtlCache::new(config.cache.query_cache_size, ttl),
            result_cache: LruTtlCache::new(config.cache.result_cache_size, ttl),
        }
    }

    /// Run a ranked session search.
    pub async fn search(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        let normalized = normalize_query(&request.query);
        let filter = self.build_filter(request);
        let limit = request.limit.unwrap_or(self.top_n_sessions).max(1);
        let cache_key = format!(
            "{normalized}|{}|archive={}|limit={limit}",
            filter.canonical_key(),
            request.include_archive,
        );

        // A cached list is only valid while the store is unchanged.
        let generation = self.store.generation();
        if let Some(cached) = self.result_cache.get(&cache_key) {
            if cached.generation == generation {
                log::debug!("Result cache hit for '{normalized}'");
                return Ok(cached.results);
            }
        }

        let query_vector = match self.embedding_cache.get(&normalized) {
            Some(vector) => vector,
            None => {
                let vector = self.gateway.embed_query(&normalized).await?;
                self.embedding_cache.put(normalized.clone(), vector.clone());
                vector
            }
        };

        let partitions: &[Partition] = if request.include_archive {
            &[Partition::Active, Partition::Archive]
        } else {
            &[Partition::Active]
        };
        let hits = self
            .store
            .search(&query_vector, self.k_chunks, &filter, partitions)?;
        if hits.is_empty() {
            log::info!("No chunks matched '{normalized}'");
            return Ok(Vec::new());
        }

        let grouped = group_by_session(hits);
        let preferences = PreferenceService::from_history(&self.fork_history)?;
        let now = Utc::now();

        let mut scores = Vec::with_capacity(grouped.len());
        let mut sessions = HashMap::new();
        for (session_id, chunks) in &grouped {
            // Sessions missing from the registry (e.g. deleted between index
            // passes) are skipped rather than surfaced half-known.
            let Some(metadata) = self.registry.get(session_id)? else {
                log::warn!("Chunks for unregistered session {session_id} skipped");
                continue;
            };

            let similarities: Vec<f32> = chunks.iter().map(|c| c.similarity).collect();
            let mut memory_types: Vec<MemoryKind> = Vec::new();
            for chunk in chunks {
                for kind in &chunk.chunk.memory_types {
                    if !memory_types.contains(kind) {
                        memory_types.push(*kind);
                    }
                }
            }
            let total_chunks = if metadata.chunk_count > 0 {
                metadata.chunk_count
            } else {
                chunks.len()
            };
            let updated_at = metadata.updated_at.or(metadata.created_at);

            scores.push(self.scoring.score_session(
                session_id,
                &similarities,
                total_chunks,
                updated_at,
                &memory_types,
                preferences.get(session_id),
                request.time_range.as_ref(),
                now,
            ));
            sessions.insert(session_id.clone(), metadata);
        }

        let ranked = self.scoring.rank(scores);
        let results: Vec<SearchResult> = ranked
            .into_iter()
            .take(limit)
            .map(|score| {
                let metadata = sessions
                    .remove(&score.session_id)
                    .expect("scored sessions have metadata");
                let chunks = &grouped[&score.session_id];
                SearchResult {
                    session_id: score.session_id.clone(),
                    preview: build_preview(chunks, self.preview_length),
                    matched_chunks: score.matched_chunks,
                    score,
                    metadata,
                }
            })
            .collect();

        self.result_cache.put(
            cache_key,
            CachedResults {
                generation,
                results: results.clone(),
            },
        );
        log::info!(
            "Search '{normalized}' returned {} sessions (top score {:.3})",
            results.len(),
            results.first().map(|r| r.score.total).unwrap_or(0.0)
        );
        Ok(results)
    }

    /// (embedding hits/misses, result hits/misses) — for diagnostics.
    #[must_use]
    pub fn cache_counters(&self) -> ((u64, u64), (u64, u64)) {
        (
            self.embedding_cache.counters(),
            self.result_cache.counters(),
        )
    }

    fn build_filter(&self, request: &SearchRequest) -> SearchFilter {
        SearchFilter {
            project: request.project.clone(),
            archived: None,
            tags: (!request.tags.is_empty()).then(|| {
                request
                    .tags
                    .iter()
                    .map(|t| t.trim().to_lowercase())
                    .collect()
            }),
            memory_types: None,
            time_from: request.time_range.map(|t| t.from),
            time_to: request.time_range.map(|t| t.to),
        }
    }
}

fn group_by_session(hits: Vec<ChunkHit>) -> HashMap<String, Vec<ChunkHit>> {
    let mut grouped: HashMap<String, Vec<ChunkHit>> = HashMap::new();
    for hit in hits {
        grouped
            .entry(hit.chunk.session_id.clone())
            .or_default()
            .push(hit);
    }
    for chunks in grouped.values_mut() {
        chunks.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_index.cmp(&b.chunk.chunk_index))
        });
    }
    grouped
}

/// Concatenate the top three chunks and trim to `preview_length` on a word
/// boundary, appending an ellipsis when truncated.
fn build_preview(chunks: &[ChunkHit], preview_length: usize) -> String {
    let joined = chunks
        .iter()
        .take(3)
        .map(|c| c.chunk.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");
    if joined.chars().count() <= preview_length {
        return joined;
    }
    let cut: String = joined.chars().take(preview_length).collect();
    let trimmed = match cut.rfind(char::is_whitespace) {
        Some(pos) if pos > 0 => cut[..pos].trim_end(),
        _ => cut.as_str(),
    };
    format!("{trimmed}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use refork_registry::SessionMetadata;
    use refork_vector_store::{ChunkRecord, EmbeddingModel, GatewayLimits};
    use tempfile::TempDir;

    struct Fixture {
        service: SearchService,
        store: Arc<VectorStore>,
        gateway: Arc<EmbeddingGateway>,
        registry: Arc<SessionRegistry>,
        _tmp: TempDir,
    }

    const DIM: usize = 32;

    async fn fixture() -> Fixture {
        std::env::set_var("REFORK_EMBEDDING_MODE", "stub");
        let tmp = TempDir::new().unwrap();
        let config = Config::default();
        let store = Arc::new(VectorStore::open(tmp.path(), DIM).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        let gateway = Arc::new(
            EmbeddingGateway::new(
                EmbeddingModel::new(DIM).unwrap(),
                &tmp.path().join("embedding_cache"),
                GatewayLimits::default(),
            )
            .unwrap(),
        );
        let fork_history =
            Arc::new(ForkHistory::open(&tmp.path().join("fork_history.json")).unwrap());
        let service = SearchService::new(
            &config,
            store.clone(),
            registry.clone(),
            gateway.clone(),
            fork_history,
        );
        Fixture {
            service,
            store,
            gateway,
            registry,
            _tmp: tmp,
        }
    }

    async fn index_session(fx: &Fixture, session_id: &str, texts: &[&str], days_old: i64) {
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 0, 0, 0).unwrap();
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let vectors = fx.gateway.embed_texts(&owned).await.unwrap();
        let chunks = owned
            .iter()
            .zip(vectors)
            .enumerate()
            .map(|(i, (text, vector))| {
                (
                    ChunkRecord {
                        session_id: session_id.to_string(),
                        chunk_index: i,
                        text: text.clone(),
                        token_count: refork_transcript::estimate_tokens(text),
                        project: "demo".to_string(),
                        timestamp: Some(now - ChronoDuration::days(days_old)),
                        first_message: i,
                        last_message: i,
                        memory_types: Vec::new(),
                        tags: Vec::new(),
                        archived: false,
                    },
                    vector,
                )
            })
            .collect();
        fx.store.upsert_chunks(chunks).unwrap();

        let mut meta = SessionMetadata::new(session_id);
        meta.project = Some("demo".to_string());
        meta.chunk_count = texts.len();
        meta.message_count = texts.len();
        meta.updated_at = Some(Utc::now() - ChronoDuration::days(days_old));
        fx.registry.add(meta).unwrap();
    }

    #[tokio::test]
    async fn exact_text_match_ranks_first() {
        let fx = fixture().await;
        index_session(&fx, "target", &["oauth jwt refresh flow"], 1).await;
        index_session(&fx, "other", &["css grid layout tricks"], 1).await;

        let results = fx
            .service
            .search(&SearchRequest {
                query: "oauth jwt refresh flow".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        // The stub embedder gives similarity 1.0 only for identical text.
        assert_eq!(results[0].session_id, "target");
        assert!(results[0].score.best_similarity > 0.99);
        assert!(!results[0].preview.is_empty());
    }

    #[tokio::test]
    async fn repeated_search_hits_caches_until_store_mutates() {
        let fx = fixture().await;
        index_session(&fx, "s", &["react hooks deep dive"], 1).await;

        let request = SearchRequest {
            query: "react hooks".to_string(),
            ..Default::default()
        };
        fx.service.search(&request).await.unwrap();
        let model_calls_after_first = fx.gateway.model().stub_batch_calls().unwrap();

        // Second identical search: no embedding work, result cache serves it.
        fx.service.search(&request).await.unwrap();
        assert_eq!(
            fx.gateway.model().stub_batch_calls().unwrap(),
            model_calls_after_first
        );
        let (_, (result_hits, _)) = fx.service.cache_counters();
        assert_eq!(result_hits, 1);

        // A store mutation invalidates the result list but not embeddings.
        index_session(&fx, "s2", &["react hooks part two"], 1).await;
        let results = fx.service.search(&request).await.unwrap();
        assert_eq!(results.len(), 2);
        // Query embedding still came from the LRU, not the model.
        let ((embed_hits, _), _) = fx.service.cache_counters();
        assert!(embed_hits >= 1);
    }

    #[tokio::test]
    async fn project_filter_restricts_hits() {
        let fx = fixture().await;
        index_session(&fx, "in-project", &["shared query text"], 1).await;

        let results = fx
            .service
            .search(&SearchRequest {
                query: "shared query text".to_string(),
                project: Some("demo".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);

        let none = fx
            .service
            .search(&SearchRequest {
                query: "shared query text".to_string(),
                project: Some("elsewhere".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn archive_partition_needs_opt_in() {
        let fx = fixture().await;
        index_session(&fx, "archived", &["ancient wisdom about makefiles"], 1).await;
        fx.store
            .move_to_partition("archived", Partition::Archive)
            .unwrap();

        let request = SearchRequest {
            query: "ancient wisdom about makefiles".to_string(),
            ..Default::default()
        };
        assert!(fx.service.search(&request).await.unwrap().is_empty());

        let with_archive = fx
            .service
            .search(&SearchRequest {
                include_archive: true,
                ..request
            })
            .await
            .unwrap();
        assert_eq!(with_archive.len(), 1);
    }

    #[tokio::test]
    async fn unregistered_sessions_are_skipped() {
        let fx = fixture().await;
        index_session(&fx, "known", &["alpha beta gamma"], 1).await;
        // Chunks without a registry row.
        let vectors = fx
            .gateway
            .embed_texts(&["alpha beta gamma".to_string()])
            .await
            .unwrap();
        fx.store
            .upsert_chunks(vec![(
                ChunkRecord {
                    session_id: "ghost".to_string(),
                    chunk_index: 0,
                    text: "alpha beta gamma".to_string(),
                    token_count: 4,
                    project: "demo".to_string(),
                    timestamp: None,
                    first_message: 0,
                    last_message: 0,
                    memory_types: Vec::new(),
                    tags: Vec::new(),
                    archived: false,
                },
                vectors[0].clone(),
            )])
            .unwrap();

        let results = fx
            .service
            .search(&SearchRequest {
                query: "alpha beta gamma".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].session_id, "known");
    }

    #[test]
    fn preview_trims_on_word_boundary() {
        let chunk = |text: &str, sim: f32| ChunkHit {
            chunk: ChunkRecord {
                session_id: "p".to_string(),
                chunk_index: 0,
                text: text.to_string(),
                token_count: 1,
                project: String::new(),
                timestamp: None,
                first_message: 0,
                last_message: 0,
                memory_types: Vec::new(),
                tags: Vec::new(),
                archived: false,
            },
            similarity: sim,
            partition: Partition::Active,
        };
        let chunks = vec![chunk("the quick brown fox jumps over the lazy dog", 0.9)];
        let preview = build_preview(&chunks, 20);
        assert!(preview.ends_with("..."));
        assert!(preview.len() <= 24);
        assert!(!preview.contains("jumps"));

        let short = build_preview(&chunks, 500);
        assert_eq!(short, "the quick brown fox jumps over the lazy dog");
    }
}
