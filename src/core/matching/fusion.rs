//! Cross-signal fusion: overlap merging, confidence scoring, context
//! extraction, per-document dedup.

use crate::core::matching::vocab::{is_common_term, INDICATIVE_TERMS};
use crate::core::matching::{MatchSource, RawMatch};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A fused, scored match. At most one per technique id survives fusion for a
/// given document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalMatch {
    pub technique_id: String,
    pub technique_name: String,
    pub tactics: Vec<String>,
    /// Integer confidence in [0, 100].
    pub score: u8,
    pub matched_text: String,
    pub context: String,
    pub start_char: usize,
    pub end_char: usize,
    pub matched_by_multiple: bool,
    pub dominant_source: MatchSource,
}

#[derive(Debug, Clone)]
pub struct FusionOptions {
    /// Context window size around the matched range.
    pub context_window: usize,
}

impl Default for FusionOptions {
    fn default() -> Self {
        FusionOptions {
            context_window: 200,
        }
    }
}

/// Merged signal cluster for one technique over one overlapping range.
struct MergedMatch {
    technique_id: String,
    technique_name: String,
    tactics: Vec<String>,
    start_char: usize,
    end_char: usize,
    keyword_score: f64,
    tfidf_score: f64,
    fuzzy_score: f64,
    sources: Vec<MatchSource>,
    /// Matched substring of the raw match with the highest single signal.
    best_text: String,
    best_signal: f64,
}

impl MergedMatch {
    fn from(raw: &RawMatch) -> Self {
        MergedMatch {
            technique_id: raw.technique_id.clone(),
            technique_name: raw.technique_name.clone(),
            tactics: raw.tactics.clone(),
            start_char: raw.start_char,
            end_char: raw.end_char,
            keyword_score: raw.keyword_score.unwrap_or(0.0),
            tfidf_score: raw.tfidf_score.unwrap_or(0.0),
            fuzzy_score: raw.fuzzy_score.unwrap_or(0.0),
            sources: vec![raw.source],
            best_text: raw.matched_text.clone(),
            best_signal: raw.peak_score(),
        }
    }

    fn absorb(&mut self, raw: &RawMatch) {
        self.start_char = self.start_char.min(raw.start_char);
        self.end_char = self.end_char.max(raw.end_char);
        self.keyword_score = self.keyword_score.max(raw.keyword_score.unwrap_or(0.0));
        self.tfidf_score = self.tfidf_score.max(raw.tfidf_score.unwrap_or(0.0));
        self.fuzzy_score = self.fuzzy_score.max(raw.fuzzy_score.unwrap_or(0.0));
        if !self.sources.contains(&raw.source) {
            self.sources.push(raw.source);
        }
        let peak = raw.peak_score();
        if peak > self.best_signal {
            self.best_signal = peak;
            self.best_text = raw.matched_text.clone();
        }
    }

    /// The source contributing the highest single-signal score.
    fn dominant_source(&self) -> MatchSource {
        let mut best = (MatchSource::Keyword, self.keyword_score);
        if self.tfidf_score > best.1 {
            best = (MatchSource::Tfidf, self.tfidf_score);
        }
        if self.fuzzy_score > best.1 {
            best = (MatchSource::Fuzzy, self.fuzzy_score);
        }
        best.0
    }
}

/// Fuse raw matches from all enabled matchers over one document text.
/// Returns one scored match per technique, ordered by score descending with
/// lexicographic-id tie-breaks.
pub fn fuse_matches(raw: &[RawMatch], text: &str, opts: &FusionOptions) -> Vec<EvalMatch> {
    let mut by_technique: BTreeMap<&str, Vec<&RawMatch>> = BTreeMap::new();
    for m in raw {
        by_technique.entry(&m.technique_id).or_default().push(m);
    }

    let mut out: Vec<EvalMatch> = Vec::new();
    for (_, mut group) in by_technique {
        group.sort_by_key(|m| (m.start_char, m.end_char));

        let mut merged: Vec<MergedMatch> = Vec::new();
        for m in group {
            match merged.last_mut() {
                // Half-open ranges overlap when the next starts before the
                // current merged range ends.
                Some(current) if m.start_char < current.end_char => current.absorb(m),
                _ => merged.push(MergedMatch::from(m)),
            }
        }

        let mut best: Option<EvalMatch> = None;
        for cluster in merged {
            let context = extract_context(
                text,
                cluster.start_char,
                cluster.end_char,
                opts.context_window,
            );
            let score = confidence_score(&cluster, &context);
            let candidate = EvalMatch {
                technique_id: cluster.technique_id.clone(),
                technique_name: cluster.technique_name.clone(),
                tactics: cluster.tactics.clone(),
                score,
                matched_text: cluster.best_text.clone(),
                context,
                start_char: cluster.start_char,
                end_char: cluster.end_char,
                matched_by_multiple: cluster.sources.len() >= 2,
                dominant_source: cluster.dominant_source(),
            };
            let keep = match &best {
                Some(current) => candidate.score > current.score,
                None => true,
            };
            if keep {
                best = Some(candidate);
            }
        }
        if let Some(m) = best {
            out.push(m);
        }
    }

    out.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.technique_id.cmp(&b.technique_id))
    });
    out
}

/// Confidence scoring, 0-100 integer, rounded toward zero.
fn confidence_score(cluster: &MergedMatch, context: &str) -> u8 {
    let mut score: f64 = match cluster.dominant_source() {
        MatchSource::Keyword => cluster.keyword_score * 80.0,
        MatchSource::Tfidf => cluster.tfidf_score * 80.0,
        MatchSource::Fuzzy => cluster.fuzzy_score * 70.0,
    };

    if cluster.sources.len() >= 2 {
        score += 10.0;
    }

    let context_lower = context.to_lowercase();
    let indicative = INDICATIVE_TERMS
        .iter()
        .any(|term| context_lower.contains(term))
        || cluster
            .tactics
            .iter()
            .any(|tactic| context_lower.contains(tactic.as_str()));
    if indicative {
        score += 10.0;
    }

    let matched_lower = cluster.best_text.to_lowercase();
    if is_common_term(&matched_lower) {
        score -= 15.0;
    }

    if cluster.best_text.chars().count() < 4 {
        score -= 20.0;
    }

    if cluster.best_text.to_uppercase() == cluster.technique_id {
        score += 20.0;
    }

    score.clamp(0.0, 100.0).trunc() as u8
}

/// Slice a context window around `[start, end)`, extended outward (up to 100
/// bytes either way) to the nearest sentence boundary.
pub fn extract_context(text: &str, start: usize, end: usize, window: usize) -> String {
    let half = window / 2;
    let mut s = floor_boundary(text, start.saturating_sub(half));
    let mut e = floor_boundary(text, (end + half).min(text.len()));

    // Backward: land just past the previous sentence end.
    let scan_start = floor_boundary(text, s.saturating_sub(100));
    if let Some(pos) = rfind_boundary(&text[scan_start..s]) {
        s = scan_start + pos;
    }
    // Forward: include the next sentence end.
    let scan_end = floor_boundary(text, (e + 100).min(text.len()));
    if let Some(pos) = find_boundary(&text[e..scan_end]) {
        e += pos;
    }

    text[s..e].trim().to_string()
}

/// Position just after the last sentence boundary in `slice`.
fn rfind_boundary(slice: &str) -> Option<usize> {
    [". ", "! ", "? ", "\n\n"]
        .iter()
        .filter_map(|sep| slice.rfind(sep).map(|pos| pos + sep.len()))
        .max()
}

/// Position just after the first sentence-ending mark in `slice`.
fn find_boundary(slice: &str) -> Option<usize> {
    [". ", "! ", "? ", "\n\n"]
        .iter()
        .filter_map(|sep| slice.find(sep).map(|pos| pos + 1))
        .min()
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
