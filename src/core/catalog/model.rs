use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A mitigation attached to a technique via a `mitigates` relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mitigation {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// One ATT&CK technique, keyed by its canonical external id (`T####` or
/// `T####.###`). Sub-technique ids share their parent's prefix before the dot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Technique {
    pub id: String,
    pub name: String,
    pub description: String,
    pub tactics: Vec<String>,
    pub platforms: Vec<String>,
    pub data_sources: Vec<String>,
    pub detection: String,
    pub mitigations: Vec<Mitigation>,
    pub url: String,
    /// Lowercased matching vocabulary derived from name + description.
    pub keywords: Vec<String>,
    pub parent_id: Option<String>,
    /// Ordered sub-technique ids, populated after grouping.
    pub sub_techniques: Vec<String>,
}

impl Technique {
    pub fn is_sub_technique(&self) -> bool {
        self.id.contains('.')
    }
}

/// Immutable technique lookup built once per catalog version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechniqueIndex {
    version: String,
    techniques: IndexMap<String, Technique>,
    by_tactic: BTreeMap<String, Vec<String>>,
}

impl TechniqueIndex {
    pub fn from_techniques(version: String, techniques: Vec<Technique>) -> Self {
        let mut map = IndexMap::with_capacity(techniques.len());
        let mut by_tactic: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for technique in techniques {
            for tactic in &technique.tactics {
                by_tactic
                    .entry(tactic.clone())
                    .or_default()
                    .push(technique.id.clone());
            }
            map.insert(technique.id.clone(), technique);
        }
        for ids in by_tactic.values_mut() {
            ids.sort();
            ids.dedup();
        }
        TechniqueIndex {
            version,
            techniques: map,
            by_tactic,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn get(&self, id: &str) -> Option<&Technique> {
        self.techniques.get(id)
    }

    pub fn techniques(&self) -> impl Iterator<Item = &Technique> {
        self.techniques.values()
    }

    pub fn len(&self) -> usize {
        self.techniques.len()
    }

    pub fn is_empty(&self) -> bool {
        self.techniques.is_empty()
    }

    pub fn tactics(&self) -> impl Iterator<Item = &str> {
        self.by_tactic.keys().map(String::as_str)
    }

    pub fn techniques_for_tactic(&self, tactic: &str) -> &[String] {
        self.by_tactic
            .get(tactic)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
