//! Allocation errors.

use std::time::Duration;

use devlease_farm_api::{ApiError, ProxyKind};
use thiserror::Error;

use crate::cancel::Cancelled;

/// Proxy discovery errors.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{kind} proxy for session {session_id} not published after {waited:?}")]
    Timeout {
        kind: ProxyKind,
        session_id: i64,
        waited: Duration,
    },

    #[error("failed to query {kind} proxy: {source}")]
    Api {
        kind: ProxyKind,
        #[source]
        source: ApiError,
    },

    #[error("proxy discovery cancelled")]
    Cancelled,
}

impl From<Cancelled> for ProxyError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Errors that end an allocation.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("authentication failed: {0}")]
    Auth(#[source] ApiError),

    /// No device matches the filters, even a locked one.
    #[error("no device matches filters: {filters}")]
    NoMatchingDevice { filters: String },

    #[error("provisioning project `{0}` not found")]
    JobNotFound(String),

    #[error("no device carries the requested build after {attempts} attempts")]
    FlashingFailed { attempts: u32 },

    #[error("device session is null after {attempts} attempts")]
    SessionUnavailable { attempts: u32 },

    #[error("session request failed: {0}")]
    Session(#[source] ApiError),

    #[error(transparent)]
    ProxyDiscovery(ProxyError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("allocation cancelled")]
    Cancelled,
}

impl From<Cancelled> for AllocError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

/// Cancellation keeps its own variant whichever phase it interrupted.
impl From<ProxyError> for AllocError {
    fn from(err: ProxyError) -> Self {
        match err {
            ProxyError::Cancelled => Self::Cancelled,
            other => Self::ProxyDiscovery(other),
        }
    }
}

impl AllocError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
