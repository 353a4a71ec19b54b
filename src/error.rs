//! Error types for cloud-bootstrap

use thiserror::Error;

/// Main error type for cloud-bootstrap operations
///
/// Everything below the datasource controller recovers locally; only
/// [`BootstrapError::NoDatasource`] and document-level [`BootstrapError::Parse`]
/// failures are expected to reach the caller of a full bootstrap run.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport '{transport}' unavailable: {message}")]
    TransportUnavailable { transport: String, message: String },

    #[error("Failed to decode '{key}': {message}")]
    Decode { key: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Handler '{handler}' failed on {content_type}: {message}")]
    Handler {
        handler: String,
        content_type: String,
        message: String,
    },

    #[error("No datasource found")]
    NoDatasource,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Command execution failed: {0}")]
    Command(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Cancelled while {0}")]
    Cancelled(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl BootstrapError {
    /// Create a transport-unavailable error
    pub fn transport(transport: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            transport: transport.into(),
            message: message.into(),
        }
    }

    /// Create a decode error for a named value
    pub fn decode(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a handler failure
    pub fn handler(
        handler: impl Into<String>,
        content_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Handler {
            handler: handler.into(),
            content_type: content_type.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for BootstrapError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http(err.to_string())
    }
}
