//! Line-wise transcript parsing.
//!
//! The producer appends one JSON document per line. Two shapes occur in the
//! wild: flat `{role, content, timestamp?}` records and nested
//! `{message: {role, content, ...}, timestamp?}` records. Both are mapped to
//! a tagged [`MessageLine`] before extraction so downstream code can
//! pattern-match instead of probing maps.

use crate::error::{Result, TranscriptError};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

/// One usable message extracted from a transcript line.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: String,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub metadata: Option<Map<String, Value>>,
}

/// Shape of a raw transcript line.
#[derive(Debug)]
pub enum MessageLine {
    /// `{role, content, timestamp?, ...}`
    Flat(Map<String, Value>),
    /// `{message: {role, content, ...}, timestamp?, ...}`
    Nested {
        envelope: Map<String, Value>,
        message: Map<String, Value>,
    },
}

impl MessageLine {
    fn classify(value: Value) -> Option<Self> {
        let Value::Object(map) = value else {
            return None;
        };
        match map.get("message") {
            Some(Value::Object(_)) => {
                let mut envelope = map;
                let Some(Value::Object(message)) = envelope.remove("message") else {
                    unreachable!("checked object variant above");
                };
                Some(Self::Nested { envelope, message })
            }
            _ => Some(Self::Flat(map)),
        }
    }
}

/// Counters accumulated over one file read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadStats {
    pub lines_read: usize,
    pub lines_skipped: usize,
    pub bytes_read: u64,
}

/// Streaming reader for append-only JSONL transcripts.
///
/// Reads stop at EOF; a file being appended to concurrently is simply
/// re-read on the next watcher event. The whole file is never held in
/// memory, only the current line.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranscriptReader {
    strict: bool,
}

impl TranscriptReader {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict: false }
    }

    /// In strict mode a malformed line aborts the read instead of being
    /// skipped.
    #[must_use]
    pub const fn strict() -> Self {
        Self { strict: true }
    }

    pub fn read_file(&self, path: &Path) -> Result<(Vec<Message>, ReadStats)> {
        let file = File::open(path)?;
        self.read_from(file)
    }

    pub fn read_from<R: Read>(&self, source: R) -> Result<(Vec<Message>, ReadStats)> {
        let mut reader = BufReader::new(source);
        let mut messages = Vec::new();
        let mut stats = ReadStats::default();
        let mut buf = Vec::new();
        let mut line_number = 0usize;

        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 {
                break;
            }
            line_number += 1;
            stats.lines_read += 1;
            stats.bytes_read += n as u64;

            // Invalid UTF-8 gets replacement characters rather than failing
            // the whole file.
            let line = String::from_utf8_lossy(&buf);
            let trimmed = line.trim();
            if trimmed.is_empty() {
                stats.lines_skipped += 1;
                continue;
            }

            let value: Value = match serde_json::from_str(trimmed) {
                Ok(value) => value,
                Err(err) => {
                    stats.lines_skipped += 1;
                    if self.strict {
                        return Err(TranscriptError::ParseError {
                            line: line_number,
                            reason: err.to_string(),
                        });
                    }
                    log::warn!("Malformed JSON at line {line_number}: {err}");
                    continue;
                }
            };

            match MessageLine::classify(value).and_then(extract_message) {
                Some(message) => messages.push(message),
                None => stats.lines_skipped += 1,
            }
        }

        Ok((messages, stats))
    }
}

/// Count non-blank lines without parsing them. Used by the background
/// indexer as a cheap "did the file grow" probe.
pub fn count_lines(path: &Path) -> Result<usize> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut count = 0usize;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.iter().any(|b| !b.is_ascii_whitespace()) {
            count += 1;
        }
    }
    Ok(count)
}

fn extract_message(line: MessageLine) -> Option<Message> {
    let (role, content, timestamp, meta_source) = match line {
        MessageLine::Flat(map) => {
            // Producer housekeeping records carry a type but no conversation
            // content; skip them.
            if map.get("type").and_then(Value::as_str) == Some("queue-operation") {
                return None;
            }
            let role = map
                .get("role")
                .and_then(Value::as_str)
                .or_else(|| map.get("type").and_then(Value::as_str))?
                .to_string();
            let content = map
                .get("content")
                .and_then(flatten_content)
                .or_else(|| map.get("text").and_then(Value::as_str).map(String::from))?;
            let timestamp = map.get("timestamp").and_then(parse_timestamp);
            (role, content, timestamp, map)
        }
        MessageLine::Nested { envelope, message } => {
            let role = message
                .get("role")
                .and_then(Value::as_str)
                .or_else(|| envelope.get("type").and_then(Value::as_str))?
                .to_string();
            let content = message.get("content").and_then(flatten_content)?;
            let timestamp = envelope
                .get("timestamp")
                .or_else(|| message.get("timestamp"))
                .and_then(parse_timestamp);
            (role, content, timestamp, message)
        }
    };

    if role.is_empty() || content.trim().is_empty() {
        return None;
    }

    let mut metadata = Map::new();
    for key in ["model", "id", "stop_reason", "usage"] {
        if let Some(value) = meta_source.get(key) {
            metadata.insert(key.to_string(), value.clone());
        }
    }

    Some(Message {
        role,
        content,
        timestamp,
        metadata: (!metadata.is_empty()).then_some(metadata),
    })
}

/// Content is either a plain string or an array of content blocks; textual
/// blocks are concatenated in order, everything else is dropped.
fn flatten_content(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                match block {
                    Value::String(s) => parts.push(s.as_str()),
                    Value::Object(map) => {
                        if let Some(text) = map.get("text").and_then(Value::as_str) {
                            parts.push(text);
                        }
                    }
                    _ => {}
                }
            }
            (!parts.is_empty()).then(|| parts.join("\n"))
        }
        _ => None,
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(raw) => DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => {
            if let Some(secs) = n.as_i64() {
                Utc.timestamp_opt(secs, 0).single()
            } else {
                n.as_f64().and_then(|secs| {
                    let whole = secs.trunc() as i64;
                    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
                    Utc.timestamp_opt(whole, nanos).single()
                })
            }
        }
        _ => None,
    }
}
