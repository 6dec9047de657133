//! API error types.

use thiserror::Error;

/// Errors returned by a [`crate::FarmApi`] implementation.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Credentials were rejected or the access token expired.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The farm answered with a non-success status.
    #[error("API error {status}: {message}")]
    Status { status: u16, message: String },

    /// The request never produced a response.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The response body did not match the expected record shape.
    #[error("failed to decode {context}: {source}")]
    Decode {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    /// Client configuration is unusable.
    #[error("invalid client configuration: {0}")]
    Config(String),
}

impl ApiError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self::Status {
            status,
            message: message.into(),
        }
    }

    pub fn decode(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }

    /// HTTP status code, if the farm produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::NotAuthenticated(_) => Some(401),
            _ => None,
        }
    }
}
