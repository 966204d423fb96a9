#![allow(clippy::result_large_err)]

//! Pluggable document-format text extraction.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Html,
    Pdf,
    Docx,
    Txt,
    Markdown,
    Rtf,
}

impl DocumentFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Html => "html",
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Docx => "docx",
            DocumentFormat::Txt => "txt",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Rtf => "rtf",
        }
    }

    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        match essence {
            "text/html" | "application/xhtml+xml" => Some(DocumentFormat::Html),
            "application/pdf" => Some(DocumentFormat::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(DocumentFormat::Docx)
            }
            "text/plain" => Some(DocumentFormat::Txt),
            "text/markdown" => Some(DocumentFormat::Markdown),
            "application/rtf" | "text/rtf" => Some(DocumentFormat::Rtf),
            _ => None,
        }
    }

    pub fn from_extension(name: &str) -> Option<Self> {
        let extension = name.rsplit('.').next()?.to_ascii_lowercase();
        match extension.as_str() {
            "html" | "htm" => Some(DocumentFormat::Html),
            "pdf" => Some(DocumentFormat::Pdf),
            "docx" => Some(DocumentFormat::Docx),
            "txt" | "text" | "log" => Some(DocumentFormat::Txt),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "rtf" => Some(DocumentFormat::Rtf),
            _ => None,
        }
    }

    /// Content sniffing for when neither MIME nor extension decide.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(DocumentFormat::Pdf);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return Some(DocumentFormat::Docx);
        }
        if bytes.starts_with(b"{\\rtf") {
            return Some(DocumentFormat::Rtf);
        }
        let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]).to_lowercase();
        if head.contains("<!doctype html") || head.contains("<html") {
            return Some(DocumentFormat::Html);
        }
        None
    }
}

impl std::fmt::Display for DocumentFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// MIME, then file extension, then content sniff, then plain text.
pub fn detect_format(mime: Option<&str>, filename: Option<&str>, bytes: &[u8]) -> DocumentFormat {
    mime.and_then(DocumentFormat::from_mime)
        .or_else(|| filename.and_then(DocumentFormat::from_extension))
        .or_else(|| DocumentFormat::sniff(bytes))
        .unwrap_or(DocumentFormat::Txt)
}

/// Format-specific text extraction. Implementations return UTF-8 text or an
/// `UnsupportedFormat` error.
pub trait Extractor: Send + Sync + 'static {
    fn format(&self) -> DocumentFormat;
    fn extract(&self, bytes: &[u8]) -> Result<String, AppError>;
}

/// Builder used to register extractors before serving requests.
pub struct ExtractorRegistryBuilder {
    extractors: HashMap<DocumentFormat, Arc<dyn Extractor>>,
}

impl Default for ExtractorRegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtractorRegistryBuilder {
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    pub fn register<T: Extractor>(&mut self, extractor: T) -> &mut Self {
        let format = extractor.format();
        if self
            .extractors
            .insert(format, Arc::new(extractor))
            .is_some()
        {
            panic!("duplicate extractor registered: {}", format);
        }
        self
    }

    pub fn build(self) -> ExtractorRegistry {
        ExtractorRegistry {
            inner: Arc::new(self.extractors),
        }
    }
}

/// Immutable extractor lookup shared across workflows.
#[derive(Clone)]
pub struct ExtractorRegistry {
    inner: Arc<HashMap<DocumentFormat, Arc<dyn Extractor>>>,
}

impl ExtractorRegistry {
    pub fn builder() -> ExtractorRegistryBuilder {
        ExtractorRegistryBuilder::new()
    }

    pub fn get(&self, format: DocumentFormat) -> Option<Arc<dyn Extractor>> {
        self.inner.get(&format).cloned()
    }

    /// The stock registry: real extraction for text-based formats; binary
    /// formats are registered but unsupported until a real parser is plugged
    /// in.
    pub fn standard() -> ExtractorRegistry {
        let mut builder = ExtractorRegistryBuilder::new();
        builder.register(PlainTextExtractor);
        builder.register(MarkdownExtractor::new());
        builder.register(HtmlExtractor::new());
        builder.register(UnsupportedExtractor::new(DocumentFormat::Pdf));
        builder.register(UnsupportedExtractor::new(DocumentFormat::Docx));
        builder.register(UnsupportedExtractor::new(DocumentFormat::Rtf));
        builder.build()
    }
}

pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Txt
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, AppError> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

pub struct MarkdownExtractor {
    code_fence: Regex,
    image: Regex,
    link: Regex,
    heading: Regex,
    emphasis: Regex,
}

impl Default for MarkdownExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl MarkdownExtractor {
    pub fn new() -> Self {
        MarkdownExtractor {
            code_fence: Regex::new(r"(?s)```[^\n]*\n(.*?)```").expect("static regex"),
            image: Regex::new(r"!\[([^\]]*)\]\([^)]*\)").expect("static regex"),
            link: Regex::new(r"\[([^\]]+)\]\([^)]*\)").expect("static regex"),
            heading: Regex::new(r"(?m)^#{1,6}\s+").expect("static regex"),
            emphasis: Regex::new(r"[*_]{1,3}([^*_]+)[*_]{1,3}").expect("static regex"),
        }
    }
}

impl Extractor for MarkdownExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Markdown
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, AppError> {
        let text = String::from_utf8_lossy(bytes);
        let text = self.code_fence.replace_all(&text, "$1");
        let text = self.image.replace_all(&text, "$1");
        let text = self.link.replace_all(&text, "$1");
        let text = self.heading.replace_all(&text, "");
        let text = self.emphasis.replace_all(&text, "$1");
        Ok(text.replace('`', ""))
    }
}

pub struct HtmlExtractor {
    script_style: Regex,
    tag: Regex,
}

impl Default for HtmlExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl HtmlExtractor {
    pub fn new() -> Self {
        HtmlExtractor {
            script_style: Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>")
                .expect("static regex"),
            tag: Regex::new(r"(?s)<[^>]+>").expect("static regex"),
        }
    }
}

impl Extractor for HtmlExtractor {
    fn format(&self) -> DocumentFormat {
        DocumentFormat::Html
    }

    fn extract(&self, bytes: &[u8]) -> Result<String, AppError> {
        let html = String::from_utf8_lossy(bytes);
        let text = self.script_style.replace_all(&html, " ");
        let text = self.tag.replace_all(&text, " ");
        Ok(text
            .replace("&nbsp;", " ")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'"))
    }
}

/// Placeholder for formats without a built-in parser. The registry is the
/// seam where a real implementation plugs in.
pub struct UnsupportedExtractor {
    format: DocumentFormat,
}

impl UnsupportedExtractor {
    pub fn new(format: DocumentFormat) -> Self {
        UnsupportedExtractor { format }
    }
}

impl Extractor for UnsupportedExtractor {
    fn format(&self) -> DocumentFormat {
        self.format
    }

    fn extract(&self, _bytes: &[u8]) -> Result<String, AppError> {
        Err(AppError::new(
            ErrorCategory::UnsupportedFormat,
            format!("no extractor available for {} documents", self.format),
        )
        .with_code("DOC-EXTRACT-001"))
    }
}
