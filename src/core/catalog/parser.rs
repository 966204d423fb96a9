#![allow(clippy::result_large_err)]

//! STIX bundle parsing into the indexed technique model.

use crate::core::catalog::keywords::derive_keywords;
use crate::core::catalog::model::{Mitigation, Technique, TechniqueIndex};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Parse a STIX bundle into a [`TechniqueIndex`]. Unknown object types are
/// ignored; a bundle without an `objects` array is malformed.
pub fn parse_bundle(bundle: &Value) -> Result<TechniqueIndex, AppError> {
    let objects = bundle
        .get("objects")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            AppError::new(
                ErrorCategory::ValidationError,
                "malformed catalog: bundle has no objects array",
            )
            .with_code("CAT-PARSE-001")
        })?;

    let version = discover_version(bundle, objects);

    // First pass: bucket the object types we care about.
    let mut attack_patterns: Vec<&Value> = Vec::new();
    let mut mitigation_defs: HashMap<&str, Mitigation> = HashMap::new();
    let mut mitigates_edges: Vec<(&str, &str)> = Vec::new();
    for object in objects {
        match object.get("type").and_then(Value::as_str) {
            Some("attack-pattern") => attack_patterns.push(object),
            Some("course-of-action") => {
                if let Some(stix_id) = object.get("id").and_then(Value::as_str) {
                    mitigation_defs.insert(
                        stix_id,
                        Mitigation {
                            id: external_reference(object)
                                .map(|(id, _)| id)
                                .unwrap_or_default(),
                            name: str_field(object, "name"),
                            description: str_field(object, "description"),
                        },
                    );
                }
            }
            Some("relationship") => {
                if object.get("relationship_type").and_then(Value::as_str) == Some("mitigates") {
                    if let (Some(source), Some(target)) = (
                        object.get("source_ref").and_then(Value::as_str),
                        object.get("target_ref").and_then(Value::as_str),
                    ) {
                        mitigates_edges.push((source, target));
                    }
                }
            }
            // x-mitre-tactic and everything else: tactic membership comes
            // from kill-chain phases, so only techniques need a second look.
            _ => {}
        }
    }

    // Second pass: build techniques keyed by STIX id so relationship edges
    // can be resolved.
    let mut by_stix_id: HashMap<String, Technique> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for object in &attack_patterns {
        let Some((external_id, url)) = external_reference(object) else {
            debug!("skipping attack-pattern without a mitre-attack reference");
            continue;
        };
        let Some(stix_id) = object.get("id").and_then(Value::as_str) else {
            continue;
        };
        let name = str_field(object, "name");
        let description = str_field(object, "description");
        let mut keywords = derive_keywords(&name, &description);
        let id_lower = external_id.to_lowercase();
        if !keywords.contains(&id_lower) {
            keywords.push(id_lower);
        }
        let parent_id = external_id
            .find('.')
            .map(|dot| external_id[..dot].to_string());
        let technique = Technique {
            id: external_id,
            name,
            description,
            tactics: kill_chain_tactics(object),
            platforms: str_array(object, "x_mitre_platforms"),
            data_sources: str_array(object, "x_mitre_data_sources"),
            detection: str_field(object, "x_mitre_detection"),
            mitigations: Vec::new(),
            url,
            keywords,
            parent_id,
            sub_techniques: Vec::new(),
        };
        order.push(stix_id.to_string());
        by_stix_id.insert(stix_id.to_string(), technique);
    }

    // Attach mitigations.
    for (source, target) in mitigates_edges {
        if let (Some(mitigation), Some(technique)) =
            (mitigation_defs.get(source), by_stix_id.get_mut(target))
        {
            technique.mitigations.push(mitigation.clone());
        }
    }
    for technique in by_stix_id.values_mut() {
        technique.mitigations.sort_by(|a, b| a.id.cmp(&b.id));
    }

    // Re-key by external id, preserving bundle order.
    let mut techniques: Vec<Technique> = order
        .iter()
        .filter_map(|stix_id| by_stix_id.remove(stix_id))
        .collect();

    group_sub_techniques(&mut techniques);

    Ok(TechniqueIndex::from_techniques(version, techniques))
}

/// Group sub-techniques under their parents, dropping records whose parent
/// chain loops back on itself or never terminates.
fn group_sub_techniques(techniques: &mut Vec<Technique>) {
    let ids: HashMap<String, Option<String>> = techniques
        .iter()
        .map(|t| (t.id.clone(), t.parent_id.clone()))
        .collect();

    let mut dropped: HashSet<String> = HashSet::new();
    for technique in techniques.iter() {
        if technique.parent_id.is_none() {
            continue;
        }
        let mut visited: HashSet<&str> = HashSet::new();
        visited.insert(technique.id.as_str());
        let mut cursor = technique.parent_id.as_deref();
        while let Some(parent) = cursor {
            if !visited.insert(parent) {
                warn!(technique = %technique.id, "dropping sub-technique with cyclic parent chain");
                dropped.insert(technique.id.clone());
                break;
            }
            cursor = match ids.get(parent) {
                Some(grand) => grand.as_deref(),
                // Orphan sub-technique: kept, just not grouped.
                None => None,
            };
        }
    }
    techniques.retain(|t| !dropped.contains(&t.id));

    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for technique in techniques.iter() {
        if let Some(parent) = &technique.parent_id {
            children
                .entry(parent.clone())
                .or_default()
                .push(technique.id.clone());
        }
    }
    for technique in techniques.iter_mut() {
        if let Some(mut subs) = children.remove(&technique.id) {
            subs.sort();
            technique.sub_techniques = subs;
        }
    }
}

/// Version discovery: `spec_version` on the bundle, then any object's
/// `x_mitre_version`, then `unknown`.
fn discover_version(bundle: &Value, objects: &[Value]) -> String {
    if let Some(version) = bundle.get("spec_version").and_then(Value::as_str) {
        return version.to_string();
    }
    for object in objects {
        if let Some(version) = object.get("x_mitre_version").and_then(Value::as_str) {
            return version.to_string();
        }
    }
    "unknown".to_string()
}

/// The canonical mitre-attack external reference: `(external_id, url)`.
fn external_reference(object: &Value) -> Option<(String, String)> {
    let refs = object.get("external_references")?.as_array()?;
    for reference in refs {
        let source = reference.get("source_name").and_then(Value::as_str);
        if matches!(source, Some("mitre-attack") | Some("mitre-mobile-attack")) {
            let id = reference.get("external_id")?.as_str()?.to_string();
            let url = reference
                .get("url")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Some((id, url));
        }
    }
    None
}

fn kill_chain_tactics(object: &Value) -> Vec<String> {
    let mut tactics = Vec::new();
    if let Some(phases) = object.get("kill_chain_phases").and_then(Value::as_array) {
        for phase in phases {
            let chain = phase.get("kill_chain_name").and_then(Value::as_str);
            if matches!(chain, Some("mitre-attack") | Some("mitre-mobile-attack")) {
                if let Some(name) = phase.get("phase_name").and_then(Value::as_str) {
                    tactics.push(kebab(name));
                }
            }
        }
    }
    tactics
}

fn kebab(name: &str) -> String {
    name.trim().to_lowercase().replace([' ', '_'], "-")
}

fn str_field(object: &Value, key: &str) -> String {
    object
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn str_array(object: &Value, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
