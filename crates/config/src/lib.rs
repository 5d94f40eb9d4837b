//! Typed configuration for the refork services.
//!
//! One JSON document (`config.json` under the storage directory) backs a
//! process-wide [`Config`]. Missing keys take defaults, unknown values are
//! rejected by [`Config::validate`], and every save goes through a temp file
//! followed by an atomic rename.

mod error;

pub use error::{ConfigError, Result};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Embedding model parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model_name: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub max_batch_size: usize,
    pub min_batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_name: "BAAI/bge-small-en-v1.5".to_string(),
            dimension: 384,
            batch_size: 32,
            max_batch_size: 128,
            min_batch_size: 8,
        }
    }
}

/// Search and ranking parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub k_chunks: usize,
    pub top_n_sessions: usize,
    pub preview_length: usize,
    pub similarity_threshold: f32,
    pub recency_weight: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k_chunks: 200,
            top_n_sessions: 5,
            preview_length: 200,
            similarity_threshold: 0.3,
            recency_weight: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            target_tokens: 750,
            overlap_tokens: 150,
            max_tokens: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingConfig {
    /// Seconds to wait after the last file event before re-indexing a path.
    pub debounce_delay_secs: f64,
    /// Parsed-message interval between checkpoint flags.
    pub checkpoint_interval: usize,
    pub enabled: bool,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            debounce_delay_secs: 5.0,
            checkpoint_interval: 15,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SetupConfig {
    pub timeout_per_session_secs: f64,
    pub batch_size: usize,
    pub workers: usize,
    pub use_cpu: bool,
}

impl Default for SetupConfig {
    fn default() -> Self {
        Self {
            timeout_per_session_secs: 30.0,
            batch_size: 5,
            workers: 1,
            use_cpu: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_memory_mb: u64,
    pub gc_between_batches: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: 2000,
            gc_between_batches: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub query_cache_size: usize,
    pub result_cache_size: usize,
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            query_cache_size: 100,
            result_cache_size: 50,
            ttl_seconds: 300,
        }
    }
}

/// Resume-command templates. The producer's CLI syntax is consumer-specific,
/// so both commands are opaque templates with `{session_id}` and `{path}`
/// placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkConfig {
    pub terminal_template: String,
    pub in_session_template: String,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            terminal_template: "claude --resume {session_id} --fork-session".to_string(),
            in_session_template: "/fork {session_id} {path}".to_string(),
        }
    }
}

/// Process-wide configuration record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub chunking: ChunkingConfig,
    pub indexing: IndexingConfig,
    pub setup: SetupConfig,
    pub memory: MemoryConfig,
    pub cache: CacheConfig,
    pub fork: ForkConfig,
    /// Base directory for all persistent state. `None` means the user-scoped
    /// default (`~/.refork`).
    pub storage_dir: Option<PathBuf>,
    /// Root of the producer's transcript tree. `None` means `~/.claude`.
    pub producer_dir: Option<PathBuf>,
}

impl Config {
    /// Load from `path`, falling back to defaults when the file is absent.
    /// A file that exists but fails to parse or validate is an error: silently
    /// ignoring a broken config hides misconfiguration from the user.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Invalid(format!("{}: {e}", path.display())))?;
        config.validate()?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Atomically rewrite `path` with this configuration.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> ConfigError {
            ConfigError::Invalid(msg.into())
        }

        if self.embedding.dimension == 0 {
            return Err(invalid("embedding.dimension must be > 0"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be > 0"));
        }
        if self.embedding.min_batch_size > self.embedding.max_batch_size {
            return Err(invalid(
                "embedding.min_batch_size cannot exceed embedding.max_batch_size",
            ));
        }
        if self.search.k_chunks == 0 {
            return Err(invalid("search.k_chunks must be > 0"));
        }
        if self.search.top_n_sessions == 0 {
            return Err(invalid("search.top_n_sessions must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.search.similarity_threshold) {
            return Err(invalid("search.similarity_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.search.recency_weight) {
            return Err(invalid("search.recency_weight must be within [0, 1]"));
        }
        if self.chunking.max_tokens == 0 {
            return Err(invalid("chunking.max_tokens must be > 0"));
        }
        if self.chunking.target_tokens == 0 {
            return Err(invalid("chunking.target_tokens must be > 0"));
        }
        if self.chunking.target_tokens > self.chunking.max_tokens {
            return Err(invalid(
                "chunking.target_tokens cannot exceed chunking.max_tokens",
            ));
        }
        if self.indexing.debounce_delay_secs < 0.0 {
            return Err(invalid("indexing.debounce_delay_secs must be >= 0"));
        }
        if self.indexing.checkpoint_interval == 0 {
            return Err(invalid("indexing.checkpoint_interval must be > 0"));
        }
        if self.setup.timeout_per_session_secs <= 0.0 {
            return Err(invalid("setup.timeout_per_session_secs must be > 0"));
        }
        if self.setup.batch_size == 0 {
            return Err(invalid("setup.batch_size must be > 0"));
        }
        if self.setup.workers == 0 {
            return Err(invalid("setup.workers must be > 0"));
        }
        if self.memory.max_memory_mb == 0 {
            return Err(invalid("memory.max_memory_mb must be > 0"));
        }
        if self.cache.query_cache_size == 0 || self.cache.result_cache_size == 0 {
            return Err(invalid("cache sizes must be > 0"));
        }
        if !self.fork.terminal_template.contains("{session_id}") {
            return Err(invalid(
                "fork.terminal_template must contain a {session_id} placeholder",
            ));
        }
        Ok(())
    }

    /// Resolved storage directory: `STORAGE_DIR` env, then the configured
    /// path, then `~/.refork`.
    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("STORAGE_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
        self.storage_dir
            .clone()
            .unwrap_or_else(|| default_storage_dir())
    }

    /// Resolved producer directory: `PRODUCER_DIR` env, then the configured
    /// path, then `~/.claude`.
    #[must_use]
    pub fn producer_dir(&self) -> PathBuf {
        if let Ok(dir) = std::env::var("PRODUCER_DIR") {
            let trimmed = dir.trim();
            if !trimmed.is_empty() {
                return PathBuf::from(trimmed);
            }
        }
        self.producer_dir
            .clone()
            .unwrap_or_else(|| default_producer_dir())
    }

    #[must_use]
    pub fn config_path(storage_dir: &Path) -> PathBuf {
        storage_dir.join("config.json")
    }
}

#[must_use]
pub fn default_storage_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".refork")
}

#[must_use]
pub fn default_producer_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load(&tmp.path().join("config.json")).unwrap();
        assert_eq!(config.search.k_chunks, 200);
        assert_eq!(config.chunking.target_tokens, 750);
    }

    #[test]
    fn save_and_reload_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");

        let mut config = Config::default();
        config.search.top_n_sessions = 9;
        config.chunking.target_tokens = 500;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.search.top_n_sessions, 9);
        assert_eq!(loaded.chunking.target_tokens, 500);
    }

    #[test]
    fn partial_file_takes_defaults_for_missing_keys() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{"search": {"top_n_sessions": 3}}"#).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.search.top_n_sessions, 3);
        assert_eq!(config.search.k_chunks, 200);
        assert_eq!(config.indexing.checkpoint_interval, 15);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut config = Config::default();
        config.chunking.target_tokens = 2000;
        config.chunking.max_tokens = 1000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));

        let mut config = Config::default();
        config.search.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.min_batch_size = 256;
        assert!(config.validate().is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
