//! Multi-signal technique matching: per-signal candidate producers plus the
//! fusion pass that yields scored, deduplicated matches.

pub mod fusion;
pub mod fuzzy;
pub mod keyword;
pub mod tfidf;
pub mod vocab;

pub use fusion::{fuse_matches, EvalMatch, FusionOptions};

use crate::core::catalog::Technique;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which signal produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Keyword,
    Tfidf,
    Fuzzy,
}

impl MatchSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchSource::Keyword => "keyword",
            MatchSource::Tfidf => "tfidf",
            MatchSource::Fuzzy => "fuzzy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "keyword" => Some(MatchSource::Keyword),
            "tfidf" => Some(MatchSource::Tfidf),
            "fuzzy" => Some(MatchSource::Fuzzy),
            _ => None,
        }
    }
}

/// A single candidate produced by one matcher. Positions are half-open byte
/// offsets into the text handed to `find_matches`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMatch {
    pub technique_id: String,
    pub technique_name: String,
    pub tactics: Vec<String>,
    pub matched_text: String,
    pub start_char: usize,
    pub end_char: usize,
    pub keyword_score: Option<f64>,
    pub tfidf_score: Option<f64>,
    pub fuzzy_score: Option<f64>,
    pub source: MatchSource,
}

impl RawMatch {
    /// Highest per-signal score carried by this match.
    pub fn peak_score(&self) -> f64 {
        [self.keyword_score, self.tfidf_score, self.fuzzy_score]
            .into_iter()
            .flatten()
            .fold(0.0, f64::max)
    }
}

/// Common matcher contract. Matchers are constructed once per catalog
/// snapshot and shared across chunks.
pub trait Matcher: Send + Sync {
    fn source(&self) -> MatchSource;
    fn find_matches(&self, text: &str) -> Vec<RawMatch>;
}

/// Evaluation output for one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalResult {
    pub matches: Vec<EvalMatch>,
    pub summary: EvalSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalSummary {
    pub document_id: String,
    pub match_count: usize,
    /// Top technique ids, score descending, ties by lexicographic id.
    pub top_techniques: Vec<String>,
    /// Tactic -> count of distinct matched techniques covering it.
    pub tactics_coverage: BTreeMap<String, usize>,
    pub processing_time_ms: u64,
}

impl EvalSummary {
    pub fn from_matches(
        document_id: String,
        matches: &[EvalMatch],
        processing_time_ms: u64,
    ) -> Self {
        let mut ranked: Vec<&EvalMatch> = matches.iter().collect();
        ranked.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.technique_id.cmp(&b.technique_id))
        });
        let top_techniques = ranked
            .iter()
            .take(5)
            .map(|m| m.technique_id.clone())
            .collect();

        let mut tactics_coverage: BTreeMap<String, usize> = BTreeMap::new();
        for m in matches {
            for tactic in &m.tactics {
                *tactics_coverage.entry(tactic.clone()).or_insert(0) += 1;
            }
        }

        EvalSummary {
            document_id,
            match_count: matches.len(),
            top_techniques,
            tactics_coverage,
            processing_time_ms,
        }
    }
}

/// Byte span of one token.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Token<'a> {
    pub text: &'a str,
    pub start: usize,
    pub end: usize,
}

/// Tokenize keeping byte positions. Token characters are alphanumerics plus
/// `.`, `-`, `_` so file names and technique ids survive; edge punctuation is
/// trimmed off each token.
pub(crate) fn tokenize(text: &str) -> Vec<Token<'_>> {
    let bytes = text.as_bytes();
    let is_token_byte =
        |b: u8| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_' || b >= 0x80;
    let is_edge = |b: u8| b == b'.' || b == b'-' || b == b'_';

    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        if !is_token_byte(bytes[i]) {
            i += 1;
            continue;
        }
        let mut j = i;
        while j < bytes.len() && is_token_byte(bytes[j]) {
            j += 1;
        }
        let (mut s, mut e) = (i, j);
        while s < e && is_edge(bytes[s]) {
            s += 1;
        }
        while e > s && is_edge(bytes[e - 1]) {
            e -= 1;
        }
        if s < e {
            tokens.push(Token {
                text: &text[s..e],
                start: s,
                end: e,
            });
        }
        i = j;
    }
    tokens
}

/// Lowercased word list without positions, for frequency work.
pub(crate) fn tokenize_lower(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .map(|t| t.text.to_lowercase())
        .collect()
}


/// Reference to a technique carried inside matcher tables.
#[derive(Debug, Clone)]
pub(crate) struct TechRef {
    pub id: String,
    pub name: String,
    pub tactics: Vec<String>,
}

impl TechRef {
    pub fn of(technique: &Technique) -> Self {
        TechRef {
            id: technique.id.clone(),
            name: technique.name.clone(),
            tactics: technique.tactics.clone(),
        }
    }
}
