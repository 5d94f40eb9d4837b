//! # Refork Transcript
//!
//! Parsing and chunking for producer transcript files.
//!
//! ## Pipeline
//!
//! ```text
//! session.jsonl
//!     │
//!     ├──> TranscriptReader (line-wise, corruption-tolerant)
//!     │      └─> Vec<Message> + ReadStats
//!     │
//!     ├──> Chunker (code-fence safe, overlapping)
//!     │      └─> Vec<Chunk>
//!     │
//!     └──> MemoryExtractor (PATTERN / WORKING_SOLUTION / WAITING)
//!            └─> per-chunk markers
//! ```

mod chunker;
mod error;
mod memory;
mod reader;

pub use chunker::{Chunk, Chunker, ChunkerConfig};
pub use error::{Result, TranscriptError};
pub use memory::{MemoryExtractor, MemoryKind, MemoryMarker};
pub use reader::{count_lines, Message, MessageLine, ReadStats, TranscriptReader};

/// Rough token estimate used across chunking and previews: 4 chars ≈ 1 token,
/// never less than 1 for non-empty text.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        0
    } else {
        (text.len() / 4).max(1)
    }
}
