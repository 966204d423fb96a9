//! TF-IDF similarity matcher.
//!
//! Each technique's name + description + keywords forms one corpus document.
//! Query windows slide across the analyzed text and are compared by cosine
//! similarity against every technique vector.

use crate::core::catalog::TechniqueIndex;
use crate::core::matching::{tokenize, tokenize_lower, MatchSource, Matcher, RawMatch, TechRef};
use std::collections::{BTreeMap, HashMap, HashSet};

const WINDOW_BYTES: usize = 500;
const WINDOW_STRIDE: usize = 250;
const SIMILARITY_THRESHOLD: f64 = 0.2;

struct TechniqueVector {
    tech: TechRef,
    name_tokens: HashSet<String>,
    weights: BTreeMap<String, f64>,
    norm: f64,
}

pub struct TfidfMatcher {
    vectors: Vec<TechniqueVector>,
    idf: HashMap<String, f64>,
    doc_count: usize,
}

impl TfidfMatcher {
    pub fn new(index: &TechniqueIndex) -> Self {
        let docs: Vec<(TechRef, Vec<String>)> = index
            .techniques()
            .map(|technique| {
                let combined = format!(
                    "{} {} {}",
                    technique.name,
                    technique.description,
                    technique.keywords.join(" ")
                );
                (TechRef::of(technique), tokenize_lower(&combined))
            })
            .collect();

        let doc_count = docs.len();
        let mut df: HashMap<String, usize> = HashMap::new();
        for (_, tokens) in &docs {
            let unique: HashSet<&String> = tokens.iter().collect();
            for term in unique {
                *df.entry(term.clone()).or_insert(0) += 1;
            }
        }
        let idf: HashMap<String, f64> = df
            .into_iter()
            .map(|(term, count)| (term, Self::idf_value(doc_count, count)))
            .collect();

        let vectors = docs
            .into_iter()
            .map(|(tech, tokens)| {
                let name_tokens: HashSet<String> = tokenize_lower(&tech.name).into_iter().collect();
                let weights = weigh(&tokens, |term| {
                    idf.get(term)
                        .copied()
                        .unwrap_or_else(|| Self::idf_value(doc_count, 0))
                });
                let norm = vector_norm(&weights);
                TechniqueVector {
                    tech,
                    name_tokens,
                    weights,
                    norm,
                }
            })
            .collect();

        TfidfMatcher {
            vectors,
            idf,
            doc_count,
        }
    }

    fn idf_value(doc_count: usize, df: usize) -> f64 {
        ((doc_count as f64 + 1.0) / (df as f64 + 1.0)).ln() + 1.0
    }

    fn window_match(&self, text: &str, window_start: usize, window_end: usize) -> Vec<RawMatch> {
        let window = &text[window_start..window_end];
        let tokens = tokenize_lower(window);
        if tokens.is_empty() {
            return Vec::new();
        }
        let query = weigh(&tokens, |term| {
            self.idf
                .get(term)
                .copied()
                .unwrap_or_else(|| Self::idf_value(self.doc_count, 0))
        });
        let query_norm = vector_norm(&query);
        if query_norm == 0.0 {
            return Vec::new();
        }

        let mut matches = Vec::new();
        for vector in &self.vectors {
            if vector.norm == 0.0 {
                continue;
            }
            let mut dot = 0.0;
            for (term, weight) in &query {
                if let Some(other) = vector.weights.get(term) {
                    dot += weight * other;
                }
            }
            let similarity = dot / (query_norm * vector.norm);
            if similarity <= SIMILARITY_THRESHOLD {
                continue;
            }
            let (rel_start, rel_end) = best_sentence(window, &vector.name_tokens);
            matches.push(RawMatch {
                technique_id: vector.tech.id.clone(),
                technique_name: vector.tech.name.clone(),
                tactics: vector.tech.tactics.clone(),
                matched_text: window[rel_start..rel_end].to_string(),
                start_char: window_start + rel_start,
                end_char: window_start + rel_end,
                keyword_score: None,
                tfidf_score: Some(similarity),
                fuzzy_score: None,
                source: MatchSource::Tfidf,
            });
        }
        matches
    }
}

impl Matcher for TfidfMatcher {
    fn source(&self) -> MatchSource {
        MatchSource::Tfidf
    }

    fn find_matches(&self, text: &str) -> Vec<RawMatch> {
        if text.is_empty() {
            return Vec::new();
        }
        let mut matches = Vec::new();
        let mut start = 0usize;
        loop {
            let end = floor_boundary(text, (start + WINDOW_BYTES).min(text.len()));
            matches.extend(self.window_match(text, start, end));
            if end >= text.len() {
                break;
            }
            start = floor_boundary(text, start + WINDOW_STRIDE);
        }
        matches
    }
}

/// Term frequency x inverse document frequency over one token list.
/// Ordered so similarity sums are deterministic.
fn weigh<F: Fn(&str) -> f64>(tokens: &[String], idf_of: F) -> BTreeMap<String, f64> {
    let mut counts: HashMap<&String, usize> = HashMap::new();
    for token in tokens {
        *counts.entry(token).or_insert(0) += 1;
    }
    let len = tokens.len() as f64;
    counts
        .into_iter()
        .map(|(term, count)| {
            let tf = count as f64 / len;
            (term.clone(), tf * idf_of(term))
        })
        .collect()
}

fn vector_norm(weights: &BTreeMap<String, f64>) -> f64 {
    weights.values().map(|w| w * w).sum::<f64>().sqrt()
}

/// The sentence inside the window sharing the most tokens with the technique
/// name; the whole window when it has no sentence punctuation.
fn best_sentence(window: &str, name_tokens: &HashSet<String>) -> (usize, usize) {
    let mut best: Option<(usize, usize, usize)> = None;
    let mut sentence_start = 0usize;
    let bytes = window.as_bytes();
    for i in 0..=bytes.len() {
        let at_break = i == bytes.len() || bytes[i] == b'.' || bytes[i] == b'!' || bytes[i] == b'?';
        if !at_break {
            continue;
        }
        let end = if i < bytes.len() { i + 1 } else { i };
        if end > sentence_start {
            let sentence = &window[sentence_start..end];
            let shared = tokenize(sentence)
                .iter()
                .filter(|t| name_tokens.contains(&t.text.to_lowercase()))
                .count();
            let better = match best {
                Some((_, _, best_shared)) => shared > best_shared,
                None => sentence.trim().len() > 1,
            };
            if better {
                best = Some((sentence_start, end, shared));
            }
        }
        sentence_start = end;
    }
    match best {
        Some((start, end, _)) => (start, end),
        None => (0, window.len()),
    }
}

fn floor_boundary(text: &str, mut index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::Technique;

    fn technique(id: &str, name: &str, description: &str, keywords: &[&str]) -> Technique {
        Technique {
            id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            tactics: vec!["initial-access".to_string()],
            platforms: Vec::new(),
            data_sources: Vec::new(),
            detection: String::new(),
            mitigations: Vec::new(),
            url: String::new(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            parent_id: None,
            sub_techniques: Vec::new(),
        }
    }

    fn sample_index() -> TechniqueIndex {
        TechniqueIndex::from_techniques(
            "test".to_string(),
            vec![
                technique(
                    "T1566",
                    "Phishing",
                    "Adversaries send phishing emails with malicious attachments to victims",
                    &["phishing", "emails", "attachments", "malicious"],
                ),
                technique(
                    "T1110",
                    "Brute Force",
                    "Adversaries guess passwords through repeated brute force login attempts",
                    &["brute", "force", "passwords", "login"],
                ),
            ],
        )
    }

    #[test]
    fn relevant_text_scores_above_threshold() {
        let matcher = TfidfMatcher::new(&sample_index());
        let matches =
            matcher.find_matches("The phishing emails carried malicious attachments for victims.");
        assert!(matches.iter().any(|m| m.technique_id == "T1566"));
        let phishing = matches.iter().find(|m| m.technique_id == "T1566").unwrap();
        assert!(phishing.tfidf_score.unwrap() > SIMILARITY_THRESHOLD);
    }

    #[test]
    fn unrelated_text_is_quiet() {
        let matcher = TfidfMatcher::new(&sample_index());
        let matches = matcher.find_matches("The weather tomorrow looks bright and sunny again.");
        assert!(matches.is_empty());
    }

    #[test]
    fn rare_terms_weigh_more() {
        assert!(TfidfMatcher::idf_value(10, 1) > TfidfMatcher::idf_value(10, 9));
    }

    #[test]
    fn best_sentence_prefers_name_overlap() {
        let name_tokens: HashSet<String> = ["phishing".to_string()].into_iter().collect();
        let window = "Nothing here. The phishing wave continued. Unrelated end.";
        let (start, end) = best_sentence(window, &name_tokens);
        assert_eq!(&window[start..end].trim_start(), &"The phishing wave continued.");
    }

    #[test]
    fn empty_text_yields_nothing() {
        let matcher = TfidfMatcher::new(&sample_index());
        assert!(matcher.find_matches("").is_empty());
    }
}
