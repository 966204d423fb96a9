//! Task I/O payloads for the document-analysis workflow: a tagged record per
//! task shape, validated by the engine against each task's declared kind.

use crate::core::analysis::extract::DocumentFormat;
use crate::core::matching::EvalResult;
use crate::core::text::Chunk;
use crate::core::workflow::{MetadataPatch, TaskPayload};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

pub const KIND_REQUEST: &str = "request";
pub const KIND_DOCUMENT: &str = "document";
pub const KIND_CATALOG: &str = "catalog";
pub const KIND_EVALUATION: &str = "evaluation";
pub const KIND_REPORT: &str = "report";
pub const KIND_JOIN: &str = "join";

/// Per-request analysis knobs, all optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnalysisOptions {
    pub min_confidence: Option<u8>,
    pub max_results: Option<usize>,
    pub include_tactics: Option<Vec<String>>,
}

/// Submission payload: exactly one of `url` / `document_path` is expected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub url: Option<String>,
    pub document_path: Option<PathBuf>,
    pub document_name: Option<String>,
    #[serde(default)]
    pub options: AnalysisOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadata {
    pub char_count: usize,
    pub format: DocumentFormat,
    pub source_url: Option<String>,
    pub source_filename: Option<String>,
}

/// Ingestion output. Owned by the producing workflow; only derived matches
/// and summaries outlive it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBundle {
    pub text: String,
    pub chunks: Vec<Chunk>,
    pub metadata: DocumentMetadata,
    pub content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreparedDocument {
    pub bundle: DocumentBundle,
    #[serde(default)]
    pub options: AnalysisOptions,
}

/// Reference to the catalog snapshot a workflow observed. The catalog
/// service pins snapshots per version so downstream tasks resolve exactly
/// this version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogRef {
    pub version: String,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRef {
    pub report_id: Uuid,
}

/// The document-analysis task payload, one variant per task shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisPayload {
    Request(AnalysisRequest),
    Document(PreparedDocument),
    Catalog(CatalogRef),
    Evaluation(EvalResult),
    Report(ReportRef),
    Join(BTreeMap<String, AnalysisPayload>),
}

impl AnalysisPayload {
    /// Join member by task name, when this payload is a merge record.
    pub fn join_member(&self, task_name: &str) -> Option<&AnalysisPayload> {
        match self {
            AnalysisPayload::Join(parts) => parts.get(task_name),
            _ => None,
        }
    }
}

impl TaskPayload for AnalysisPayload {
    fn kind(&self) -> &'static str {
        match self {
            AnalysisPayload::Request(_) => KIND_REQUEST,
            AnalysisPayload::Document(_) => KIND_DOCUMENT,
            AnalysisPayload::Catalog(_) => KIND_CATALOG,
            AnalysisPayload::Evaluation(_) => KIND_EVALUATION,
            AnalysisPayload::Report(_) => KIND_REPORT,
            AnalysisPayload::Join(_) => KIND_JOIN,
        }
    }

    fn merge(parts: BTreeMap<String, Self>) -> Self {
        AnalysisPayload::Join(parts)
    }

    fn metadata_patch(&self) -> Option<MetadataPatch> {
        match self {
            AnalysisPayload::Request(request) => Some(MetadataPatch {
                source_url: request.url.clone(),
                source_filename: request.document_name.clone(),
                document_format: None,
            }),
            AnalysisPayload::Document(prepared) => Some(MetadataPatch {
                source_url: None,
                source_filename: prepared.bundle.metadata.source_filename.clone(),
                document_format: Some(prepared.bundle.metadata.format.as_str().to_string()),
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_kinds_match_tags() {
        let request = AnalysisPayload::Request(AnalysisRequest::default());
        assert_eq!(request.kind(), "request");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["kind"], "request");
    }

    #[test]
    fn join_round_trips() {
        let mut parts = BTreeMap::new();
        parts.insert(
            "get-mitre-data".to_string(),
            AnalysisPayload::Catalog(CatalogRef {
                version: "17.0".to_string(),
                stale: false,
            }),
        );
        let join = AnalysisPayload::merge(parts);
        assert_eq!(join.kind(), "join");

        let value = serde_json::to_value(&join).unwrap();
        let back: AnalysisPayload = serde_json::from_value(value).unwrap();
        match back.join_member("get-mitre-data") {
            Some(AnalysisPayload::Catalog(catalog)) => assert_eq!(catalog.version, "17.0"),
            other => panic!("unexpected join member: {:?}", other),
        }
    }

    #[test]
    fn options_reject_unknown_fields() {
        let err = serde_json::from_str::<AnalysisOptions>(r#"{"minConfidence": 70, "bogus": 1}"#);
        assert!(err.is_err());
        let ok: AnalysisOptions = serde_json::from_str(r#"{"maxResults": 5}"#).unwrap();
        assert_eq!(ok.max_results, Some(5));
    }
}
