use crate::core::types::ErrorCategory;
use std::fmt;

/// Substrings that mark an error message as transient. Matched
/// case-insensitively against the full message chain.
const TRANSIENT_MESSAGE_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "connection",
    "econnrefused",
    "etimedout",
    "enotfound",
    "socket hang up",
    "server responded with a 5",
    "too many requests",
    "rate limit",
];

#[derive(Debug)]
pub struct AppError {
    pub category: ErrorCategory,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    pub context: Option<String>,
    pub code: String,
}

impl AppError {
    pub fn new<T: Into<String>>(category: ErrorCategory, message: T) -> Self {
        AppError {
            category,
            message: message.into(),
            source: None,
            context: None,
            code: format!("{:?}", category).to_uppercase(),
        }
    }

    pub fn with_source<T: Into<String>>(
        category: ErrorCategory,
        message: T,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        let mut error = AppError::new(category, message);
        error.source = Some(source);
        error
    }

    pub fn with_context<T: Into<String>>(mut self, context: T) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_code<T: Into<String>>(mut self, code: T) -> Self {
        self.code = code.into();
        self
    }

    /// Classify this error for the retry policy. Only the workflow engine
    /// consults this; call sites never pattern-match on messages themselves.
    pub fn retriable(&self) -> bool {
        if self.category.is_permanent() {
            return false;
        }
        if self.category.is_transient() {
            return true;
        }
        let haystack = match &self.source {
            Some(source) => format!("{} {}", self.message, source).to_lowercase(),
            None => self.message.to_lowercase(),
        };
        TRANSIENT_MESSAGE_MARKERS
            .iter()
            .any(|marker| haystack.contains(marker))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.code, self.category, self.message)?;
        if let Some(ref context) = self.context {
            write!(f, " (Context: {})", context)?;
        }
        if let Some(ref source) = self.source {
            write!(f, "\nCaused by: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::with_source(ErrorCategory::IoError, e.to_string(), Box::new(e))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::with_source(ErrorCategory::SerializationError, e.to_string(), Box::new(e))
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::with_source(ErrorCategory::StorageError, e.to_string(), Box::new(e))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        let category = if e.is_timeout() {
            ErrorCategory::TimeoutError
        } else if let Some(status) = e.status() {
            if status.as_u16() == 429 {
                ErrorCategory::RateLimited
            } else if status.is_server_error() {
                ErrorCategory::UpstreamServerError
            } else {
                ErrorCategory::FetchError
            }
        } else {
            ErrorCategory::FetchError
        };
        AppError::with_source(category, e.to_string(), Box::new(e))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::new(ErrorCategory::InternalError, e.to_string())
    }
}
