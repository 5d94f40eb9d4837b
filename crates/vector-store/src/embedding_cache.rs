//! Content-addressed embedding cache.
//!
//! Keys are SHA-256 hex digests of the UTF-8 text bytes; values are the
//! embedding vectors. The on-disk form is a single
//! `embedding_cache/cache.json` document written temp-then-rename. The
//! in-memory view is multi-reader / single-writer.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub struct EmbeddingCache {
    path: PathBuf,
    entries: RwLock<HashMap<String, Vec<f32>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl EmbeddingCache {
    /// Open (or start) the cache under `dir`. A corrupt cache file is
    /// discarded with a warning; the cache rebuilds as misses are filled.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("cache.json");
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(err) => {
                    log::warn!(
                        "Discarding corrupt embedding cache at {}: {err}",
                        path.display()
                    );
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        log::info!(
            "Embedding cache at {} ({} entries)",
            path.display(),
            entries.len()
        );
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub fn content_hash(text: &str) -> String {
        let digest = Sha256::digest(text.as_bytes());
        let mut hex = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    #[must_use]
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        self.get_by_hash(&Self::content_hash(text))
    }

    #[must_use]
    pub fn get_by_hash(&self, hash: &str) -> Option<Vec<f32>> {
        let guard = self.entries.read().ok()?;
        match guard.get(hash) {
            Some(vector) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(vector.clone())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn put(&self, text: &str, vector: Vec<f32>) {
        self.put_by_hash(Self::content_hash(text), vector);
    }

    pub fn put_by_hash(&self, hash: String, vector: Vec<f32>) {
        if let Ok(mut guard) = self.entries.write() {
            guard.entry(hash).or_insert(vector);
        }
    }

    /// Persist the in-memory view. Crash-safe: a partial write never
    /// replaces the previous cache file.
    pub fn flush(&self) -> Result<()> {
        let snapshot = {
            let guard = self
                .entries
                .read()
                .map_err(|_| crate::VectorStoreError::Other("cache lock poisoned".into()))?;
            serde_json::to_vec(&*guard)?
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot)?;
        if let Err(err) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    pub fn clear(&self) -> Result<()> {
        if let Ok(mut guard) = self.entries.write() {
            guard.clear();
        }
        self.flush()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().map(|g| g.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}
