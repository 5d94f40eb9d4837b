//! # Refork Indexer
//!
//! Keeps the vector store and registry in sync with the producer's
//! transcript tree.
//!
//! ## Pipeline
//!
//! ```text
//! ~/.claude/**/*.jsonl
//!     │
//!     ├──> BackgroundIndexer (notify + per-path debounce + worker pool)
//!     │      └─> SessionIndexer
//!     │
//!     └──> SetupOrchestrator (bulk first run, resumable, deadline per session)
//!            └─> SessionIndexer
//!
//! SessionIndexer: parse → chunk → embed (cache) → swap chunks → registry
//! upsert, all under a per-session lock.
//! ```

mod error;
mod locks;
mod pipeline;
mod setup;
mod watcher;

pub use error::{IndexerError, Result};
pub use locks::SessionLocks;
pub use pipeline::{session_id_for_path, IndexOutcome, SessionIndexer, SessionState};
pub use setup::{
    BatchOutcome, SetupEvent, SetupOptions, SetupOrchestrator, SetupOutcome, SetupState,
    SetupStats,
};
pub use watcher::{BackgroundIndexer, IndexerHealth, WatcherConfig};
