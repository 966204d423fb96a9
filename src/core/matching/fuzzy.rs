//! Approximate occurrence matcher built on edit-distance similarity.

use crate::core::catalog::TechniqueIndex;
use crate::core::matching::{tokenize, MatchSource, Matcher, RawMatch, TechRef, Token};

const SIMILARITY_THRESHOLD: f64 = 0.88;

struct FuzzyEntry {
    tech_index: usize,
    phrase: String,
    word_count: usize,
}

/// Scans token windows for near-matches of technique names and keywords.
/// A cheap length/first-letter prefilter keeps the similarity computation
/// off the hot path.
pub struct FuzzyMatcher {
    techniques: Vec<TechRef>,
    entries: Vec<FuzzyEntry>,
}

impl FuzzyMatcher {
    pub fn new(index: &TechniqueIndex) -> Self {
        let mut techniques = Vec::with_capacity(index.len());
        let mut entries = Vec::new();
        for technique in index.techniques() {
            let tech_index = techniques.len();
            techniques.push(TechRef::of(technique));

            let mut phrases: Vec<String> = vec![technique.name.to_lowercase()];
            phrases.extend(technique.keywords.iter().cloned());
            phrases.sort();
            phrases.dedup();
            for phrase in phrases {
                if phrase.len() < 4 {
                    continue;
                }
                let word_count = phrase.split_whitespace().count().max(1);
                entries.push(FuzzyEntry {
                    tech_index,
                    phrase,
                    word_count,
                });
            }
        }
        FuzzyMatcher {
            techniques,
            entries,
        }
    }

    fn candidate_similarity(phrase: &str, candidate: &str) -> Option<f64> {
        // Prefilter: comparable length and matching first letter.
        let len_a = phrase.len();
        let len_b = candidate.len();
        if len_b * 4 < len_a * 3 || len_a * 4 < len_b * 3 {
            return None;
        }
        if phrase.as_bytes().first()?.to_ascii_lowercase()
            != candidate.as_bytes().first()?.to_ascii_lowercase()
        {
            return None;
        }
        let similarity = strsim::jaro_winkler(phrase, candidate);
        (similarity >= SIMILARITY_THRESHOLD).then_some(similarity)
    }
}

impl Matcher for FuzzyMatcher {
    fn source(&self) -> MatchSource {
        MatchSource::Fuzzy
    }

    fn find_matches(&self, text: &str) -> Vec<RawMatch> {
        let tokens: Vec<Token<'_>> = tokenize(text);
        if tokens.is_empty() {
            return Vec::new();
        }
        let lowered: Vec<String> = tokens.iter().map(|t| t.text.to_lowercase()).collect();

        let mut matches = Vec::new();
        for entry in &self.entries {
            if entry.word_count > tokens.len() {
                continue;
            }
            for i in 0..=(tokens.len() - entry.word_count) {
                let last = i + entry.word_count - 1;
                let candidate = if entry.word_count == 1 {
                    lowered[i].clone()
                } else {
                    lowered[i..=last].join(" ")
                };
                let Some(similarity) = Self::candidate_similarity(&entry.phrase, &candidate)
                else {
                    continue;
                };
                let (start, end) = (tokens[i].start, tokens[last].end);
                let tech = &self.techniques[entry.tech_index];
                matches.push(RawMatch {
                    technique_id: tech.id.clone(),
                    technique_name: tech.name.clone(),
                    tactics: tech.tactics.clone(),
                    matched_text: text[start..end].to_string(),
                    start_char: start,
                    end_char: end,
                    keyword_score: None,
                    tfidf_score: None,
                    fuzzy_score: Some(similarity),
                    source: MatchSource::Fuzzy,
                });
            }
        }
        matches
    }
}
