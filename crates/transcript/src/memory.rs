//! Memory-marker detection.
//!
//! Three categorical cues boost a session's rank when they appear in chunk
//! text: PATTERN (reusable designs), WORKING_SOLUTION (verified fixes), and
//! WAITING (unfinished threads worth resuming).

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MemoryKind {
    Pattern,
    WorkingSolution,
    Waiting,
}

impl MemoryKind {
    pub const ALL: [Self; 3] = [Self::Pattern, Self::WorkingSolution, Self::Waiting];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pattern => "PATTERN",
            Self::WorkingSolution => "WORKING_SOLUTION",
            Self::Waiting => "WAITING",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PATTERN" => Some(Self::Pattern),
            "WORKING_SOLUTION" => Some(Self::WorkingSolution),
            "WAITING" => Some(Self::Waiting),
            _ => None,
        }
    }

    /// Additive score contribution of this marker kind.
    #[must_use]
    pub const fn boost(self) -> f32 {
        match self {
            Self::Pattern => 0.05,
            Self::WorkingSolution => 0.08,
            Self::Waiting => 0.02,
        }
    }
}

impl fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected marker with its surrounding context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMarker {
    pub kind: MemoryKind,
    pub context: String,
    pub position: usize,
}

const PATTERN_KEYWORDS: &[&str] = &[
    r"\bpattern\b",
    r"\bdesign pattern\b",
    r"\barchitectural pattern\b",
    r"\bsolution pattern\b",
    r"\bapproach\b",
    r"\bstrategy\b",
    r"\barchitecture\b",
];

const WORKING_SOLUTION_KEYWORDS: &[&str] = &[
    r"\bworking solution\b",
    r"\bworking\b",
    r"\bproven implementation\b",
    r"\bsuccessful\b",
    r"\btested\b",
    r"\bverified\b",
    r"\bworks correctly\b",
    r"\bsolved\b",
    r"\ball tests pass\b",
];

const WAITING_KEYWORDS: &[&str] = &[
    r"\bwaiting\b",
    r"\bpending\b",
    r"\bto be completed\b",
    r"\bresume later\b",
    r"\bin progress\b",
    r"\bto do\b",
    r"\btodo\b",
    r"\bblocked\b",
];

fn compiled(keywords: &[&str]) -> Regex {
    RegexBuilder::new(&keywords.join("|"))
        .case_insensitive(true)
        .build()
        .expect("static keyword alternation compiles")
}

fn regex_for(kind: MemoryKind) -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    static WORKING: OnceLock<Regex> = OnceLock::new();
    static WAITING: OnceLock<Regex> = OnceLock::new();
    match kind {
        MemoryKind::Pattern => PATTERN.get_or_init(|| compiled(PATTERN_KEYWORDS)),
        MemoryKind::WorkingSolution => WORKING.get_or_init(|| compiled(WORKING_SOLUTION_KEYWORDS)),
        MemoryKind::Waiting => WAITING.get_or_init(|| compiled(WAITING_KEYWORDS)),
    }
}

/// Keyword-based marker extraction over chunk text.
#[derive(Debug, Clone, Copy)]
pub struct MemoryExtractor {
    context_window: usize,
}

impl Default for MemoryExtractor {
    fn default() -> Self {
        Self {
            context_window: 100,
        }
    }
}

impl MemoryExtractor {
    #[must_use]
    pub const fn new(context_window: usize) -> Self {
        Self { context_window }
    }

    /// Ordered distinct set of marker kinds present in `text`.
    #[must_use]
    pub fn extract_kinds(&self, text: &str) -> Vec<MemoryKind> {
        MemoryKind::ALL
            .into_iter()
            .filter(|kind| regex_for(*kind).is_match(text))
            .collect()
    }

    /// All marker occurrences with ±`context_window` characters of context,
    /// sorted by position.
    #[must_use]
    pub fn extract_markers(&self, text: &str) -> Vec<MemoryMarker> {
        let mut markers = Vec::new();
        for kind in MemoryKind::ALL {
            for found in regex_for(kind).find_iter(text) {
                markers.push(MemoryMarker {
                    kind,
                    context: self.context_at(text, found.start()),
                    position: found.start(),
                });
            }
        }
        markers.sort_by_key(|m| (m.position, m.kind));
        markers
    }

    #[must_use]
    pub fn has_kind(&self, text: &str, kind: MemoryKind) -> bool {
        regex_for(kind).is_match(text)
    }

    /// Total additive boost for a marker set, capped at +0.15.
    #[must_use]
    pub fn boost_for(kinds: &[MemoryKind]) -> f32 {
        let mut seen = [false; 3];
        let mut boost = 0.0f32;
        for kind in kinds {
            let slot = *kind as usize;
            if !seen[slot] {
                seen[slot] = true;
                boost += kind.boost();
            }
        }
        boost.min(0.15)
    }

    fn context_at(&self, text: &str, position: usize) -> String {
        let start = floor_char_boundary(text, position.saturating_sub(self.context_window));
        let end = ceil_char_boundary(text, (position + self.context_window).min(text.len()));
        let mut context = text[start..end].trim().to_string();
        if start > 0 {
            context.insert_str(0, "...");
        }
        if end < text.len() {
            context.push_str("...");
        }
        context
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_each_kind_case_insensitively() {
        let extractor = MemoryExtractor::default();
        assert_eq!(
            extractor.extract_kinds("We chose this Architecture for the service"),
            vec![MemoryKind::Pattern]
        );
        assert_eq!(
            extractor.extract_kinds("the fix is TESTED and verified"),
            vec![MemoryKind::WorkingSolution]
        );
        assert_eq!(
            extractor.extract_kinds("still blocked on the upstream release"),
            vec![MemoryKind::Waiting]
        );
    }

    #[test]
    fn respects_word_boundaries() {
        let extractor = MemoryExtractor::default();
        // "patterns" matches \bpattern\b? No: the trailing 's' breaks the \b.
        assert!(extractor.extract_kinds("antipattern detected").is_empty());
        assert!(extractor.extract_kinds("network failure").is_empty());
    }

    #[test]
    fn ordered_distinct_set_and_boosts() {
        let extractor = MemoryExtractor::default();
        let kinds =
            extractor.extract_kinds("todo: apply the observer pattern, it worked when tested");
        assert_eq!(
            kinds,
            vec![
                MemoryKind::Pattern,
                MemoryKind::WorkingSolution,
                MemoryKind::Waiting
            ]
        );
        let boost = MemoryExtractor::boost_for(&kinds);
        assert!((boost - 0.15).abs() < f32::EPSILON);
    }

    #[test]
    fn boost_dedupes_and_caps() {
        let kinds = vec![MemoryKind::Waiting, MemoryKind::Waiting];
        assert!((MemoryExtractor::boost_for(&kinds) - 0.02).abs() < f32::EPSILON);

        let all = vec![
            MemoryKind::Pattern,
            MemoryKind::WorkingSolution,
            MemoryKind::Waiting,
        ];
        assert!(MemoryExtractor::boost_for(&all) <= 0.15 + f32::EPSILON);
    }

    #[test]
    fn markers_carry_context_windows() {
        let extractor = MemoryExtractor::new(10);
        let text = "aaaaaaaaaaaaaaaaaaaa pattern bbbbbbbbbbbbbbbbbbbb";
        let markers = extractor.extract_markers(text);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].kind, MemoryKind::Pattern);
        assert!(markers[0].context.starts_with("..."));
        assert!(markers[0].context.ends_with("..."));
        assert!(markers[0].context.contains("pattern"));
    }

    #[test]
    fn markers_sorted_by_position() {
        let extractor = MemoryExtractor::default();
        let markers = extractor.extract_markers("blocked first, then a pattern appears");
        assert_eq!(markers[0].kind, MemoryKind::Waiting);
        assert!(markers.windows(2).all(|w| w[0].position <= w[1].position));
    }

    #[test]
    fn parse_round_trips() {
        for kind in MemoryKind::ALL {
            assert_eq!(MemoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MemoryKind::parse("nonsense"), None);
    }
}
