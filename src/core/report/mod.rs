//! Report assembly: tactic breakdown, top techniques, key findings.

use crate::core::matching::{EvalMatch, EvalResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Matches at or above this score count as high confidence.
pub const HIGH_CONFIDENCE_THRESHOLD: u8 = 85;
const TOP_TECHNIQUES: usize = 5;
const MAX_KEY_FINDINGS: usize = 6;

/// Where the analyzed document came from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub url: Option<String>,
    pub filename: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopTechnique {
    pub id: String,
    pub name: String,
    pub score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub match_count: usize,
    pub high_confidence_count: usize,
    pub tactics_breakdown: BTreeMap<String, usize>,
    pub top_techniques: Vec<TopTechnique>,
    pub key_findings: Vec<String>,
}

/// The durable output of one analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub source_url: Option<String>,
    pub source_filename: Option<String>,
    pub created_at: DateTime<Utc>,
    pub mitre_version: String,
    pub summary: ReportSummary,
    /// Ordered by confidence descending, ties by technique id.
    pub matches: Vec<EvalMatch>,
}

/// Build a report from an evaluation result. Matches are re-sorted so the
/// persisted order is always score-descending.
pub fn build_report(
    eval: &EvalResult,
    source: &SourceDescriptor,
    workflow_id: Uuid,
    mitre_version: &str,
) -> Report {
    let mut matches = eval.matches.clone();
    matches.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.technique_id.cmp(&b.technique_id))
    });

    let high_confidence_count = matches
        .iter()
        .filter(|m| m.score >= HIGH_CONFIDENCE_THRESHOLD)
        .count();

    let mut tactics_breakdown: BTreeMap<String, usize> = BTreeMap::new();
    for m in &matches {
        for tactic in &m.tactics {
            *tactics_breakdown.entry(tactic.clone()).or_insert(0) += 1;
        }
    }

    let top_techniques: Vec<TopTechnique> = matches
        .iter()
        .take(TOP_TECHNIQUES)
        .map(|m| TopTechnique {
            id: m.technique_id.clone(),
            name: m.technique_name.clone(),
            score: m.score,
        })
        .collect();

    let key_findings = key_findings(&matches, &tactics_breakdown, high_confidence_count);

    Report {
        id: Uuid::new_v4(),
        workflow_id,
        source_url: source.url.clone(),
        source_filename: source.filename.clone(),
        created_at: Utc::now(),
        mitre_version: mitre_version.to_string(),
        summary: ReportSummary {
            match_count: matches.len(),
            high_confidence_count,
            tactics_breakdown,
            top_techniques,
            key_findings,
        },
        matches,
    }
}

/// Short human-readable sentences covering the dominant tactic, the top
/// technique, and the high-confidence total.
fn key_findings(
    matches: &[EvalMatch],
    tactics_breakdown: &BTreeMap<String, usize>,
    high_confidence_count: usize,
) -> Vec<String> {
    let mut findings = Vec::new();
    if matches.is_empty() {
        findings.push("No ATT&CK techniques were identified in this document.".to_string());
        return findings;
    }

    if let Some((tactic, count)) = tactics_breakdown
        .iter()
        .max_by_key(|(tactic, count)| (**count, std::cmp::Reverse(tactic.as_str())))
    {
        findings.push(format!(
            "The most prevalent tactic is {} with {} matched technique{}.",
            tactic,
            count,
            if *count == 1 { "" } else { "s" }
        ));
    }

    let top = &matches[0];
    findings.push(format!(
        "The strongest signal is {} ({}) at confidence {}.",
        top.technique_name, top.technique_id, top.score
    ));

    findings.push(format!(
        "{} match{} scored at or above the high-confidence threshold of {}.",
        high_confidence_count,
        if high_confidence_count == 1 { "" } else { "es" },
        HIGH_CONFIDENCE_THRESHOLD
    ));

    // One sentence per remaining prominent tactic, most covered first.
    let mut remaining: Vec<(&String, &usize)> = tactics_breakdown.iter().collect();
    remaining.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
    for (tactic, count) in remaining.into_iter().skip(1) {
        if findings.len() >= MAX_KEY_FINDINGS {
            break;
        }
        findings.push(format!(
            "Tactic {} is covered by {} technique{}.",
            tactic,
            count,
            if *count == 1 { "" } else { "s" }
        ));
    }

    findings.truncate(MAX_KEY_FINDINGS);
    findings
}
