//! # Refork Vector Store
//!
//! Embedding and chunk storage for session retrieval.
//!
//! ## Pipeline
//!
//! ```text
//! chunk text
//!     │
//!     ├──> EmbeddingGateway (content-hash cache, adaptive batches)
//!     │      └─> Vec<f32> per chunk
//!     │
//!     └──> VectorStore (active + archive partitions)
//!            ├─> filtered cosine k-NN
//!            └─> scalar-safe metadata round-trip
//! ```
//!
//! The embedding model itself is an external collaborator: `fast` mode
//! delegates to `fastembed`, `stub` mode produces deterministic hash-seeded
//! vectors for offline tests. Select with `REFORK_EMBEDDING_MODE`.

mod embedder;
mod embedding_cache;
mod error;
mod gateway;
mod knn;
mod store;

pub use embedder::{cosine_similarity, current_embedding_mode, EmbeddingModel};
pub use embedding_cache::{CacheStats, EmbeddingCache};
pub use error::{Result, VectorStoreError};
pub use gateway::{EmbeddingGateway, GatewayLimits};
pub use knn::CosineIndex;
pub use store::{ChunkHit, ChunkRecord, Partition, SearchFilter, StoreStats, VectorStore};
