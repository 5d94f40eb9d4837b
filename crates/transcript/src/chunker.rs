//! Semantic chunking of message sequences.
//!
//! Chunks target `target_tokens`, never exceed `max_tokens`, overlap by
//! roughly `overlap_tokens`, and never cut a fenced code block at a soft
//! boundary. Message indices of adjacent chunks always overlap: the next
//! chunk starts with either carried-over tail text or a continuation piece
//! of the same message.

use crate::error::{Result, TranscriptError};
use crate::estimate_tokens;
use crate::memory::{MemoryExtractor, MemoryKind};
use crate::reader::Message;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChunkerConfig {
    pub target_tokens: usize,
    pub overlap_tokens: usize,
    pub max_tokens: usize,
    pub extract_memory: bool,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            target_tokens: 750,
            overlap_tokens: 150,
            max_tokens: 1000,
            extract_memory: true,
        }
    }
}

impl ChunkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(TranscriptError::InvalidConfig(
                "max_tokens must be > 0".to_string(),
            ));
        }
        if self.target_tokens == 0 {
            return Err(TranscriptError::InvalidConfig(
                "target_tokens must be > 0".to_string(),
            ));
        }
        if self.target_tokens > self.max_tokens {
            return Err(TranscriptError::InvalidConfig(format!(
                "target_tokens ({}) cannot exceed max_tokens ({})",
                self.target_tokens, self.max_tokens
            )));
        }
        if self.overlap_tokens >= self.max_tokens {
            return Err(TranscriptError::InvalidConfig(format!(
                "overlap_tokens ({}) must be smaller than max_tokens ({})",
                self.overlap_tokens, self.max_tokens
            )));
        }
        Ok(())
    }
}

/// One chunk of conversation text, ready for embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub chunk_index: usize,
    /// Inclusive range of source message indices.
    pub first_message: usize,
    pub last_message: usize,
    pub token_count: usize,
    pub memory_types: Vec<MemoryKind>,
}

/// A slice of one message, bounded so that carried overlap plus any piece
/// always fits under `max_tokens`.
struct Piece {
    msg_index: usize,
    role_is_assistant: bool,
    text: String,
}

pub struct Chunker {
    config: ChunkerConfig,
    extractor: MemoryExtractor,
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            extractor: MemoryExtractor::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    pub fn chunk_messages(&self, messages: &[Message]) -> Vec<Chunk> {
        let pieces = self.split_into_pieces(messages);
        if pieces.is_empty() {
            return Vec::new();
        }

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut state = Accumulator::new();

        let total = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            let remaining = total - i - 1;

            if !state.is_empty() && state.would_exceed(&piece.text, self.config.max_tokens) {
                self.flush(&mut state, &mut chunks, true);
            }

            state.push(&piece);

            let at_target = state.tokens() >= self.config.target_tokens;
            if at_target && remaining > 0 && !state.inside_open_fence() && piece.role_is_assistant {
                self.flush(&mut state, &mut chunks, true);
            }
        }

        if state.has_fresh_content() {
            self.flush(&mut state, &mut chunks, false);
        }

        chunks
    }

    /// Split oversized messages so every piece fits alongside a full overlap
    /// carry. Regular messages become a single piece.
    fn split_into_pieces(&self, messages: &[Message]) -> Vec<Piece> {
        let budget = (self.config.max_tokens - self.config.overlap_tokens)
            .saturating_sub(1)
            .max(1);
        let mut pieces = Vec::new();
        for (msg_index, message) in messages.iter().enumerate() {
            let content = message.content.trim();
            if content.is_empty() {
                continue;
            }
            let role_is_assistant = message.role == "assistant";
            if estimate_tokens(content) <= budget {
                pieces.push(Piece {
                    msg_index,
                    role_is_assistant,
                    text: content.to_string(),
                });
                continue;
            }
            for part in split_text(content, budget) {
                pieces.push(Piece {
                    msg_index,
                    role_is_assistant,
                    text: part,
                });
            }
        }
        pieces
    }

    fn flush(&self, state: &mut Accumulator, chunks: &mut Vec<Chunk>, carry_overlap: bool) {
        debug_assert!(state.has_fresh_content());
        let Some((text, first, last)) = state.take() else {
            return;
        };
        let memory_types = if self.config.extract_memory {
            self.extractor.extract_kinds(&text)
        } else {
            Vec::new()
        };
        let token_count = estimate_tokens(&text);
        chunks.push(Chunk {
            text: text.clone(),
            chunk_index: chunks.len(),
            first_message: first,
            last_message: last,
            token_count,
            memory_types,
        });

        if carry_overlap {
            // Even when no fence-balanced tail exists the next chunk still
            // anchors to this chunk's last message, keeping adjacent message
            // ranges overlapping.
            let overlap = overlap_tail(&text, self.config.overlap_tokens);
            state.seed_overlap(overlap.unwrap_or_default(), last);
        }
    }
}

struct Accumulator {
    text: String,
    first_message: Option<usize>,
    last_message: usize,
    /// True once a non-overlap piece landed after the last flush.
    fresh: bool,
}

impl Accumulator {
    const fn new() -> Self {
        Self {
            text: String::new(),
            first_message: None,
            last_message: 0,
            fresh: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    fn tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }

    fn would_exceed(&self, addition: &str, max_tokens: usize) -> bool {
        let prospective = self.text.len() + 2 + addition.len();
        (prospective / 4).max(1) > max_tokens
    }

    fn push(&mut self, piece: &Piece) {
        if !self.text.is_empty() {
            self.text.push_str("\n\n");
        }
        self.text.push_str(&piece.text);
        if self.first_message.is_none() {
            self.first_message = Some(piece.msg_index);
        }
        self.last_message = piece.msg_index;
        self.fresh = true;
    }

    fn has_fresh_content(&self) -> bool {
        self.fresh
    }

    fn inside_open_fence(&self) -> bool {
        fence_count(&self.text) % 2 == 1
    }

    fn take(&mut self) -> Option<(String, usize, usize)> {
        let first = self.first_message.take()?;
        let text = std::mem::take(&mut self.text);
        self.fresh = false;
        Some((text, first, self.last_message))
    }

    fn seed_overlap(&mut self, overlap: String, msg_index: usize) {
        self.text = overlap;
        self.first_message = Some(msg_index);
        self.last_message = msg_index;
        self.fresh = false;
    }
}

/// Number of fence markers (lines starting with ```) in `text`.
fn fence_count(text: &str) -> usize {
    text.lines()
        .filter(|line| line.trim_start().starts_with("```"))
        .count()
}

/// Trailing slice of roughly `overlap_tokens` worth of text, aligned to a
/// paragraph (falling back to line) boundary and never starting inside a
/// fenced block. Returns `None` when no fence-balanced tail exists.
fn overlap_tail(text: &str, overlap_tokens: usize) -> Option<String> {
    if overlap_tokens == 0 || text.is_empty() {
        return None;
    }
    let budget_chars = overlap_tokens * 4;
    if text.len() <= budget_chars {
        // The whole chunk fits the overlap budget; carrying all of it would
        // make the next chunk a superset without advancing, so skip.
        return None;
    }

    let mut start = floor_char_boundary(text, text.len() - budget_chars);

    // Prefer a paragraph break, then a line break, inside the candidate tail.
    if let Some(pos) = text[start..].find("\n\n") {
        start += pos + 2;
    } else if let Some(pos) = text[start..].find('\n') {
        start += pos + 1;
    }

    // A tail starting inside an open fence would carry an unbalanced block;
    // skip past the closing fence line instead.
    if fence_count(&text[..start]) % 2 == 1 {
        let close = text[start..]
            .lines()
            .scan(0usize, |offset, line| {
                let line_start = *offset;
                *offset += line.len() + 1;
                Some((line_start, line))
            })
            .find(|(_, line)| line.trim_start().starts_with("```"))
            .map(|(line_start, line)| start + line_start + line.len());
        match close {
            Some(end) => start = (end + 1).min(text.len()),
            None => return None,
        }
    }

    let tail = text[floor_char_boundary(text, start)..].trim_start();
    (!tail.is_empty()).then(|| tail.to_string())
}

/// Split `text` into parts of at most `budget` tokens, at paragraph
/// boundaries first, then lines, then characters. Fenced code blocks are
/// kept atomic at the paragraph level; a fence larger than the budget is
/// split at the hard cap.
fn split_text(text: &str, budget: usize) -> Vec<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in split_paragraphs_fence_aware(text) {
        segments.push(segment);
    }

    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();
    for segment in segments {
        // Budget checks run on the prospective joined length so the token
        // estimate of an emitted part never exceeds the budget.
        let prospective = current.len() + 2 + segment.len();
        if !current.is_empty() && (prospective / 4).max(1) > budget {
            parts.push(std::mem::take(&mut current));
        }
        if estimate_tokens(segment) > budget {
            // Paragraph (or whole fence) alone exceeds the budget.
            for line_part in split_lines(segment, budget) {
                parts.push(line_part);
            }
            continue;
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(segment);
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Paragraph segmentation that treats a whole fenced block (opening fence
/// line through closing fence line) as a single segment.
fn split_paragraphs_fence_aware(text: &str) -> Vec<&str> {
    let mut segments = Vec::new();
    let mut cursor = 0usize;
    let mut seg_start = 0usize;
    let mut in_fence = false;
    let bytes = text.as_bytes();

    for line in text.split_inclusive('\n') {
        let line_start = cursor;
        cursor += line.len();
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        // A blank line outside a fence closes the current paragraph.
        if line.trim().is_empty() && line_start > seg_start {
            let segment = text[seg_start..line_start].trim_matches('\n');
            if !segment.is_empty() {
                segments.push(segment);
            }
            seg_start = cursor;
        }
    }
    debug_assert!(cursor == bytes.len());
    let tail = text[seg_start..].trim_matches('\n');
    if !tail.is_empty() {
        segments.push(tail);
    }
    segments
}

fn split_lines(text: &str, budget: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if !current.is_empty() && ((current.len() + line.len()) / 4).max(1) > budget {
            parts.push(std::mem::take(&mut current));
        }
        if estimate_tokens(line) > budget {
            for char_part in split_chars(line, budget) {
                parts.push(char_part);
            }
            continue;
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
        .into_iter()
        .map(|p| p.trim_end_matches('\n').to_string())
        .filter(|p| !p.trim().is_empty())
        .collect()
}

fn split_chars(text: &str, budget: usize) -> Vec<String> {
    let budget_chars = (budget * 4).max(1);
    let mut parts = Vec::new();
    let mut start = 0usize;
    while start < text.len() {
        let end = ceil_char_boundary(text, (start + budget_chars).min(text.len()));
        parts.push(text[start..end].to_string());
        start = end;
    }
    parts
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
