//! Error hierarchy for Conduit.

use thiserror::Error;

/// Errors from the chat-completion HTTP client.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timeout")]
    Timeout,

    #[error("Stream parse error: {0}")]
    StreamParse(String),

    #[error("API error ({error_type}): {message}")]
    Remote { error_type: String, message: String },

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    /// HTTP status code, if this error came from a non-2xx response.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Best-effort human message for an HTTP failure.
    ///
    /// Error bodies usually look like `{"error":{"message":"..."}}`; anything
    /// else falls back to the raw body.
    pub fn message(&self) -> String {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            error: Option<ErrorDetail>,
        }
        #[derive(serde::Deserialize)]
        struct ErrorDetail {
            message: Option<String>,
        }

        match self {
            ApiError::Http { body, .. } => serde_json::from_str::<ErrorBody>(body)
                .ok()
                .and_then(|b| b.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| body.clone()),
            other => other.to_string(),
        }
    }
}

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingKey { key: String },

    #[error("Unknown MCP server '{name}'")]
    UnknownServer { name: String },
}
