//! Error types for the Gemini web client.

use std::time::Duration;

use thiserror::Error;

use crate::constants::ErrorCode;

/// Boxed underlying cause kept on wrapping variants.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the Gemini web client.
#[derive(Error, Debug)]
pub enum GeminiError {
    /// Session bootstrap or cookie rotation was refused or never reached the service.
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Non-2xx status, malformed envelope or an upstream error code.
    #[error("API error: {message}{}", status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    Api {
        message: String,
        status: Option<u16>,
        #[source]
        source: Option<BoxError>,
    },

    /// The service rejected the model selection.
    #[error("model rejected: {0}")]
    ModelInvalid(String),

    /// The account's usage limit for the selected model is exhausted.
    #[error("usage limit exceeded: {0}")]
    UsageLimitExceeded(String),

    /// The service is throttling requests from this IP.
    #[error("temporarily blocked: {0}")]
    TemporarilyBlocked(String),

    /// The request deadline passed before the service answered.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The client was closed; no further operations are accepted.
    #[error("client is closed")]
    Closed,

    /// The caller passed an argument the operation cannot use.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Gemini client operations.
pub type Result<T> = std::result::Result<T, GeminiError>;

impl GeminiError {
    pub fn authentication(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        GeminiError::Authentication {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn api(message: impl Into<String>) -> Self {
        GeminiError::Api {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    pub fn api_status(message: impl Into<String>, status: u16) -> Self {
        GeminiError::Api {
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    /// Map an error code found inside a frame payload.
    pub fn from_error_code(code: i64) -> Self {
        match ErrorCode::from_code(code) {
            ErrorCode::UsageLimitExceeded => GeminiError::UsageLimitExceeded(format!(
                "usage limit of the selected model exceeded (code {code})"
            )),
            ErrorCode::ModelInconsistent => GeminiError::ModelInvalid(format!(
                "selected model is inconsistent with the conversation (code {code})"
            )),
            ErrorCode::ModelHeaderInvalid => GeminiError::ModelInvalid(format!(
                "model header rejected by the service (code {code})"
            )),
            ErrorCode::IpTemporarilyBlocked => GeminiError::TemporarilyBlocked(format!(
                "requests from this IP are temporarily blocked (code {code})"
            )),
            ErrorCode::TemporaryError1013 | ErrorCode::Unknown(_) => {
                GeminiError::api(format!("service returned error code {code}"))
            }
        }
    }

    /// Classify a transport failure. Timeouts are reported as such; anything
    /// else becomes an [`GeminiError::Api`] with the status when one is known.
    pub(crate) fn transport(context: &str, err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return GeminiError::Timeout(timeout);
        }
        GeminiError::Api {
            message: format!("{context}: {err}"),
            status: err.status().map(|s| s.as_u16()),
            source: Some(Box::new(err)),
        }
    }

    /// Transport failure on a request without a configured deadline.
    pub(crate) fn http(context: &str, err: reqwest::Error) -> Self {
        GeminiError::Api {
            message: format!("{context}: {err}"),
            status: err.status().map(|s| s.as_u16()),
            source: Some(Box::new(err)),
        }
    }

    /// Like [`GeminiError::transport`] but for bootstrap, where every failure
    /// is an authentication failure with the cause kept.
    pub(crate) fn bootstrap(context: &str, err: reqwest::Error) -> Self {
        Self::authentication(format!("{context}: {err}"), err)
    }
}
