//! Exact keyword occurrence matcher.

use crate::core::catalog::TechniqueIndex;
use crate::core::matching::{tokenize, MatchSource, Matcher, RawMatch, TechRef};
use std::collections::HashMap;

/// Finds every occurrence of every technique keyword in the lowercased
/// document. Single-token keywords go through a token table; multi-word
/// keyword phrases are scanned directly.
pub struct KeywordMatcher {
    entries: Vec<TechRef>,
    /// keyword -> entry indices carrying it
    single: HashMap<String, Vec<usize>>,
    /// (phrase, entry index) for keywords containing whitespace
    phrases: Vec<(String, usize)>,
}

impl KeywordMatcher {
    pub fn new(index: &TechniqueIndex) -> Self {
        let mut entries = Vec::with_capacity(index.len());
        let mut single: HashMap<String, Vec<usize>> = HashMap::new();
        let mut phrases = Vec::new();
        for technique in index.techniques() {
            let entry_id = entries.len();
            entries.push(TechRef::of(technique));
            for keyword in &technique.keywords {
                if keyword.contains(' ') {
                    phrases.push((keyword.clone(), entry_id));
                } else {
                    single.entry(keyword.clone()).or_default().push(entry_id);
                }
            }
        }
        KeywordMatcher {
            entries,
            single,
            phrases,
        }
    }

    fn score_for(keyword_len: usize) -> f64 {
        (keyword_len as f64 / 20.0).min(1.0) * 0.8 + 0.2
    }

    fn raw(&self, entry: usize, text: &str, start: usize, end: usize, score: f64) -> RawMatch {
        let tech = &self.entries[entry];
        RawMatch {
            technique_id: tech.id.clone(),
            technique_name: tech.name.clone(),
            tactics: tech.tactics.clone(),
            matched_text: text[start..end].to_string(),
            start_char: start,
            end_char: end,
            keyword_score: Some(score),
            tfidf_score: None,
            fuzzy_score: None,
            source: MatchSource::Keyword,
        }
    }
}

impl Matcher for KeywordMatcher {
    fn source(&self) -> MatchSource {
        MatchSource::Keyword
    }

    fn find_matches(&self, text: &str) -> Vec<RawMatch> {
        let lower = text.to_ascii_lowercase();
        let mut matches = Vec::new();

        for token in tokenize(&lower) {
            if let Some(entry_ids) = self.single.get(token.text) {
                let score = Self::score_for(token.text.len());
                for &entry in entry_ids {
                    matches.push(self.raw(entry, text, token.start, token.end, score));
                }
            }
        }

        for (phrase, entry) in &self.phrases {
            let score = Self::score_for(phrase.len());
            for (pos, _) in lower.match_indices(phrase.as_str()) {
                if !word_bounded(lower.as_bytes(), pos, pos + phrase.len()) {
                    continue;
                }
                matches.push(self.raw(*entry, text, pos, pos + phrase.len(), score));
            }
        }

        matches
    }
}

fn word_bounded(bytes: &[u8], start: usize, end: usize) -> bool {
    let before_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
    let after_ok = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();
    before_ok && after_ok
}
