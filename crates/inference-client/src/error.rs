use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("inference endpoint returned HTTP {code}")]
    HttpStatus { code: u16 },

    #[error("malformed response: {0}")]
    MalformedData(String),

    #[error("inference service rejected the request: {0}")]
    Rejected(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl InferenceError {
    /// Connection failures, deadlines and 5xx responses are worth another
    /// attempt; client errors and unusable payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            InferenceError::Network(_) | InferenceError::Timeout(_) => true,
            InferenceError::HttpStatus { code } => *code >= 500,
            _ => false,
        }
    }

    /// True for failures where the server answered but the answer was unusable.
    pub fn is_malformed(&self) -> bool {
        match self {
            InferenceError::MalformedData(_) | InferenceError::Rejected(_) => true,
            InferenceError::HttpStatus { code } => (400..500).contains(code),
            _ => false,
        }
    }

    /// Short label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            InferenceError::Network(_) => "network",
            InferenceError::Timeout(_) => "timeout",
            InferenceError::HttpStatus { code } if *code >= 500 => "http_5xx",
            InferenceError::HttpStatus { .. } => "http_4xx",
            InferenceError::MalformedData(_) => "malformed",
            InferenceError::Rejected(_) => "rejected",
            InferenceError::InvalidEndpoint(_) => "invalid_endpoint",
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, deadline: Duration) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout(deadline)
        } else if err.is_decode() || err.is_body() {
            InferenceError::MalformedData(err.to_string())
        } else if let Some(status) = err.status() {
            InferenceError::HttpStatus {
                code: status.as_u16(),
            }
        } else {
            InferenceError::Network(err.to_string())
        }
    }
}
