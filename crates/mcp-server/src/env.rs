//! The root object wiring every collaborator together.
//!
//! No ambient singletons: the registry, store, caches, and services are
//! built once here and handed to the dispatcher and indexer explicitly.

use anyhow::{Context, Result};
use refork_config::Config;
use refork_indexer::{BackgroundIndexer, SessionIndexer, WatcherConfig};
use refork_registry::{ForkHistory, SessionRegistry};
use refork_search::{
    ArchiveService, ClusterService, DiffService, DuplicateService, SearchService, SummaryService,
    TagService,
};
use refork_vector_store::{EmbeddingGateway, EmbeddingModel, GatewayLimits, VectorStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub struct Environment {
    pub config: Config,
    pub storage_dir: PathBuf,
    pub producer_dir: PathBuf,
    pub store: Arc<VectorStore>,
    pub registry: Arc<SessionRegistry>,
    pub gateway: Arc<EmbeddingGateway>,
    pub fork_history: Arc<ForkHistory>,
    pub indexer: Arc<SessionIndexer>,
    pub search: SearchService,
    pub summary: SummaryService,
    pub diff: DiffService,
    pub duplicates: DuplicateService,
    pub clusters: ClusterService,
    pub archive: ArchiveService,
    pub tags: TagService,
}

impl Environment {
    /// Assemble all services under the configured storage directory and
    /// reconcile registry counts against the store.
    pub fn init(config: Config) -> Result<Self> {
        let storage_dir = config.storage_dir();
        let producer_dir = config.producer_dir();
        std::fs::create_dir_all(&storage_dir)
            .with_context(|| format!("creating storage dir {}", storage_dir.display()))?;

        let store = Arc::new(
            VectorStore::open(&storage_dir, config.embedding.dimension)
                .context("opening vector store")?,
        );
        let registry = Arc::new(
            SessionRegistry::open(&storage_dir.join("session-registry.json"))
                .context("opening session registry")?,
        );
        let gateway = Arc::new(
            EmbeddingGateway::new(
                EmbeddingModel::new(config.embedding.dimension)
                    .context("initialising embedding model")?,
                &storage_dir.join("embedding_cache"),
                GatewayLimits {
                    min_batch: config.embedding.min_batch_size,
                    max_batch: config.embedding.max_batch_size,
                    memory_threshold_mb: config.memory.max_memory_mb / 4,
                },
            )
            .context("opening embedding cache")?,
        );
        let fork_history = Arc::new(
            ForkHistory::open(&storage_dir.join("fork_history.json"))
                .context("opening fork history")?,
        );

        let indexer = Arc::new(SessionIndexer::new(
            &config,
            &storage_dir,
            gateway.clone(),
            store.clone(),
            registry.clone(),
        )?);
        if let Ok(repaired) = indexer.reconcile() {
            if repaired > 0 {
                log::info!("Reconciled {repaired} registry rows against the store");
            }
        }

        let search = SearchService::new(
            &config,
            store.clone(),
            registry.clone(),
            gateway.clone(),
            fork_history.clone(),
        );
        let summary = SummaryService::new(store.clone(), registry.clone());
        let diff = DiffService::new(store.clone(), registry.clone());
        let duplicates = DuplicateService::new(store.clone());
        let clusters = ClusterService::new(store.clone(), registry.clone(), &storage_dir);
        let archive = ArchiveService::new(store.clone(), registry.clone());
        let tags = TagService::new(store.clone(), registry.clone());

        Ok(Self {
            config,
            storage_dir,
            producer_dir,
            store,
            registry,
            gateway,
            fork_history,
            indexer,
            search,
            summary,
            diff,
            duplicates,
            clusters,
            archive,
            tags,
        })
    }

    /// Start the background indexer over the producer tree, when enabled.
    pub fn start_background_indexer(self: &Arc<Self>) -> Option<BackgroundIndexer> {
        if !self.config.indexing.enabled {
            log::info!("Background indexing disabled by configuration");
            return None;
        }
        match BackgroundIndexer::start(
            self.indexer.clone(),
            &self.producer_dir,
            WatcherConfig {
                debounce: Duration::from_secs_f64(self.config.indexing.debounce_delay_secs),
                workers: 1,
                queue_capacity: 256,
            },
        ) {
            Ok(indexer) => Some(indexer),
            Err(err) => {
                log::warn!("Background indexer unavailable: {err}");
                None
            }
        }
    }

    /// Resume-command strings for a session, rendered from the configured
    /// opaque templates.
    #[must_use]
    pub fn fork_commands(&self, session_id: &str, project: Option<&str>) -> (String, String) {
        let path = self.session_path_guess(session_id, project);
        let terminal = self
            .config
            .fork
            .terminal_template
            .replace("{session_id}", session_id)
            .replace("{path}", &path);
        let in_session = self
            .config
            .fork
            .in_session_template
            .replace("{session_id}", session_id)
            .replace("{path}", &path);
        (terminal, in_session)
    }

    fn session_path_guess(&self, session_id: &str, project: Option<&str>) -> String {
        let mut candidates = Vec::new();
        if let Some(project) = project {
            candidates.push(
                self.producer_dir
                    .join("projects")
                    .join(project)
                    .join(format!("{session_id}.jsonl")),
            );
        }
        candidates.push(self.producer_dir.join(format!("{session_id}.jsonl")));
        for candidate in &candidates {
            if candidate.exists() {
                return candidate.to_string_lossy().into_owned();
            }
        }
        candidates
            .first()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
