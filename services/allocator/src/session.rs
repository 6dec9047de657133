//! Exclusive device sessions.

use std::sync::Arc;
use std::time::Duration;

use devlease_farm_api::{ApiError, Connect, DeviceSession, FarmApi, SessionState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::Cancellation;
use crate::error::AllocError;

/// Session timing and conflict detection.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub conflict_status: u16,
}

/// Acquires and releases sessions.
#[derive(Clone)]
pub struct SessionManager {
    api: Arc<dyn FarmApi>,
    connector: Arc<dyn Connect>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(
        api: Arc<dyn FarmApi>,
        connector: Arc<dyn Connect>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            api,
            connector,
            settings,
        }
    }

    /// Lock `device_id` and wait for the session to start running.
    ///
    /// `Ok(None)` means the device could not be had right now: it was taken,
    /// the session stayed `WAITING` until the timeout, or it ended in another
    /// state. Any session created on the way is released before returning.
    /// A session still `WAITING` at exactly the timeout counts as failed.
    pub async fn acquire(
        &self,
        device_id: i64,
        cancel: &Cancellation,
    ) -> Result<Option<DeviceSession>, AllocError> {
        let mut session = match self.api.create_session(device_id).await {
            Ok(session) => session,
            Err(e) if e.status_code() == Some(self.settings.conflict_status) => {
                info!(device_id, error = %e, "Device is already locked");
                return Ok(None);
            }
            Err(e) => {
                warn!(device_id, error = %e, "Failed to start device session");
                return Err(AllocError::Session(e));
            }
        };
        info!(device_id, session_id = session.id, state = ?session.state, "Session created");

        let deadline = Instant::now() + self.settings.timeout;
        while session.state == SessionState::Waiting {
            if Instant::now() >= deadline {
                info!(
                    session_id = session.id,
                    timeout = ?self.settings.timeout,
                    "Timed out waiting for session to start"
                );
                self.release_quietly(session.id).await;
                return Ok(None);
            }

            if let Err(cancelled) = cancel.sleep(self.settings.poll_interval).await {
                info!(session_id = session.id, "Cancelled while waiting for session");
                self.release_quietly(session.id).await;
                return Err(cancelled.into());
            }

            match self.api.session(session.id).await {
                Ok(refreshed) => session = refreshed,
                Err(e) => debug!(session_id = session.id, error = %e, "Session refresh failed"),
            }
        }

        if session.state == SessionState::Running {
            info!(device_id, session_id = session.id, "Session running");
            Ok(Some(session))
        } else {
            info!(session_id = session.id, state = ?session.state, "Session ended before running");
            self.release_quietly(session.id).await;
            Ok(None)
        }
    }

    pub async fn release(&self, session_id: i64) -> Result<(), ApiError> {
        self.api.release_session(session_id).await?;
        info!(session_id, "Session released");
        Ok(())
    }

    /// Release, and on failure reconnect with fresh credentials and try once
    /// more. Tokens may expire while a long build holds the device.
    pub async fn release_with_refresh(&self, session_id: i64) -> Result<(), ApiError> {
        let first = match self.release(session_id).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(session_id, error = %first, "Release failed, reconnecting");

        let api = self.connector.connect().await?;
        api.release_session(session_id).await?;
        info!(session_id, "Session released after reconnect");
        Ok(())
    }

    async fn release_quietly(&self, session_id: i64) {
        if let Err(e) = self.release_with_refresh(session_id).await {
            warn!(session_id, error = %e, "Failed to release session");
        }
    }
}
