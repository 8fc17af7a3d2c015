//! Errors raised while fetching from the upstream read endpoints.

use serde::{Deserialize, Serialize};
use serde_json::error::Category;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FetchError {
    #[error("request timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("connection failed: {message}")]
    Connection { message: String },

    #[error("upstream responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("response is not valid JSON: {message}")]
    InvalidJson { message: String },

    #[error("response failed validation: {message}")]
    Schema { message: String },

    #[error("request cancelled")]
    Cancelled,
}

/// Error body served by the upstream on non-2xx responses.
#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

impl FetchError {
    /// Whether another attempt may succeed. Client errors and payloads of
    /// the wrong shape will not change on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Connection { .. } | FetchError::InvalidJson { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Schema { .. } | FetchError::Cancelled => false,
        }
    }

    pub fn from_status(status: u16, body: &str) -> Self {
        let message = match serde_json::from_str::<ErrorBody>(body) {
            Ok(parsed) => parsed.error,
            Err(_) if body.trim().is_empty() => "no error message".to_string(),
            Err(_) => body.trim().to_string(),
        };
        FetchError::Status { status, message }
    }

    /// Syntax errors and truncated bodies are retryable; well-formed JSON
    /// that does not match the expected shape is not.
    pub fn from_json(error: serde_json::Error) -> Self {
        match error.classify() {
            Category::Data => FetchError::Schema { message: error.to_string() },
            Category::Io | Category::Syntax | Category::Eof => {
                FetchError::InvalidJson { message: error.to_string() }
            }
        }
    }
}
