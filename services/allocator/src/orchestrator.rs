//! Allocation state machine.
//!
//! ```text
//! Idle -> Locating -> (Flashing <-> Locating) -> SessionPending
//!      -> ResolvingProxies -> Ready -> Teardown -> Released
//! ```
//!
//! `Failed` is reachable from every non-terminal phase.
//!
//! # Invariants
//!
//! - "no device carries the build" and "session could not be started" draw
//!   from the same retry budget
//! - a session that reached `RUNNING` is released on every error path,
//!   cancellation included, before the error is returned
//! - teardown releases at most once

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use devlease_farm_api::{
    Connect, Device, DeviceSession, FarmApi, FarmConfig, HttpConnector, ProxyKind,
};
use devlease_retry::{retry, Attempt, RetryError, RetryPolicy};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::cancel::Cancellation;
use crate::config::{AllocationRequest, AllocatorConfig};
use crate::error::AllocError;
use crate::filter::DeviceFilter;
use crate::locator::DeviceLocator;
use crate::provision::{ProvisionOutcome, Provisioner};
use crate::proxy::ProxyResolver;
use crate::redact::remove_bewit;
use crate::session::{SessionManager, SessionSettings};
use crate::snapshot::{write_device_snapshot, Workspace};

/// Allocation phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Locating,
    Flashing,
    SessionPending,
    ResolvingProxies,
    Ready,
    Teardown,
    Released,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Locating => "locating",
            Self::Flashing => "flashing",
            Self::SessionPending => "session_pending",
            Self::ResolvingProxies => "resolving_proxies",
            Self::Ready => "ready",
            Self::Teardown => "teardown",
            Self::Released => "released",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
struct PhaseCell(Arc<Mutex<Phase>>);

impl PhaseCell {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Phase::Idle)))
    }

    fn get(&self) -> Phase {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, to: Phase) {
        let from = {
            let mut phase = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *phase, to)
        };
        if from != to {
            info!(%from, %to, "Phase transition");
        }
    }
}

/// Everything a build needs to talk to the leased device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDescriptor {
    pub session_id: i64,
    pub device_id: i64,
    pub device_name: String,
    pub adb_port: u16,
    pub adb_host: String,
    pub android_serial: String,
    pub marionette_port: u16,
    pub marionette_host: String,
    /// Device label snapshot, relative to the workspace, when one was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_data: Option<String>,
}

impl SessionDescriptor {
    /// Environment variables handed to the build.
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("SESSION_ID", self.session_id.to_string()),
            ("ADB_PORT", self.adb_port.to_string()),
            ("ADB_HOST", self.adb_host.clone()),
            ("ANDROID_SERIAL", self.android_serial.clone()),
            ("MARIONETTE_PORT", self.marionette_port.to_string()),
            ("MARIONETTE_HOST", self.marionette_host.clone()),
        ];
        if let Some(file) = &self.device_data {
            vars.push(("DEVICE_DATA", file.clone()));
        }
        vars
    }
}

/// Result of [`Teardown::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    /// Nothing to release: no session, or already released.
    Skipped,
    Released,
    /// Release failed even after reconnecting; the farm will expire the
    /// session on its own.
    ReleaseFailed,
}

/// Releases the leased session at the end of the build.
pub struct Teardown {
    sessions: SessionManager,
    session_id: Option<i64>,
    phase: PhaseCell,
}

impl Teardown {
    fn new(sessions: SessionManager, session_id: Option<i64>, phase: PhaseCell) -> Self {
        Self {
            sessions,
            session_id,
            phase,
        }
    }

    /// Session still held by this lease.
    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    /// Release the session. Only the first call does anything and it never
    /// fails; release errors are logged.
    pub async fn release(&mut self) -> TeardownOutcome {
        let Some(session_id) = self.session_id.take() else {
            debug!("No session to release");
            return TeardownOutcome::Skipped;
        };

        self.phase.set(Phase::Teardown);
        let outcome = match self.sessions.release_with_refresh(session_id).await {
            Ok(()) => TeardownOutcome::Released,
            Err(e) => {
                error!(session_id, error = %e, "Failed to release device session");
                TeardownOutcome::ReleaseFailed
            }
        };
        self.phase.set(Phase::Released);
        outcome
    }

    /// Give up ownership without releasing; the session outlives the
    /// process and must be released by id later.
    pub fn detach(mut self) -> Option<i64> {
        self.session_id.take()
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if let Some(session_id) = self.session_id {
            warn!(session_id, "Lease dropped without teardown, session still held");
        }
    }
}

/// A running session plus the handle that ends it.
#[derive(Debug)]
pub struct Lease {
    pub descriptor: SessionDescriptor,
    pub teardown: Teardown,
}

/// Why a single locate/acquire attempt came up empty.
#[derive(Debug)]
enum AttemptError {
    NotFound,
    SessionNull,
    Fatal(AllocError),
}

impl AttemptError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound | Self::SessionNull)
    }
}

/// Drives one allocation from filters to a ready lease.
pub struct Orchestrator {
    api: Arc<dyn FarmApi>,
    config: AllocatorConfig,
    host: String,
    workspace: Option<Workspace>,
    locator: DeviceLocator,
    provisioner: Provisioner,
    sessions: SessionManager,
    proxies: ProxyResolver,
    phase: PhaseCell,
}

impl Orchestrator {
    /// `host` is where the farm exposes proxy ports.
    pub fn new(
        api: Arc<dyn FarmApi>,
        connector: Arc<dyn Connect>,
        config: AllocatorConfig,
        host: impl Into<String>,
    ) -> Self {
        let settings = SessionSettings {
            timeout: config.session_timeout,
            poll_interval: config.session_poll_interval,
            conflict_status: config.conflict_status,
        };

        Self {
            locator: DeviceLocator::new(Arc::clone(&api)),
            provisioner: Provisioner::new(Arc::clone(&api), &config),
            sessions: SessionManager::new(Arc::clone(&api), connector, settings),
            proxies: ProxyResolver::new(
                Arc::clone(&api),
                config.proxy_timeout,
                config.proxy_poll_interval,
            ),
            api,
            config,
            host: host.into(),
            workspace: None,
            phase: PhaseCell::new(),
        }
    }

    /// Authenticate against the farm and verify the account.
    pub async fn connect(farm: &FarmConfig, config: AllocatorConfig) -> Result<Self, AllocError> {
        farm.validate()
            .map_err(|e| AllocError::InvalidRequest(e.to_string()))?;
        let host = farm
            .host()
            .map_err(|e| AllocError::InvalidRequest(e.to_string()))?;

        let connector = Arc::new(HttpConnector::new(farm.clone()));
        let api = connector.connect().await.map_err(AllocError::Auth)?;
        let user = api.me().await.map_err(AllocError::Auth)?;
        info!(user_id = user.id, email = user.email.as_deref().unwrap_or(""), "Authenticated");

        Ok(Self::new(api, connector, config, host))
    }

    /// Write the device label snapshot and flash logs into `workspace`.
    pub fn with_workspace(mut self, workspace: Workspace) -> Self {
        self.provisioner = self.provisioner.with_workspace(workspace.clone());
        self.workspace = Some(workspace);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase.get()
    }

    /// Session operations using this orchestrator's farm connection.
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Lease a device carrying `request.build_url`, flashing one if needed.
    pub async fn allocate(
        &self,
        request: &AllocationRequest,
        cancel: &Cancellation,
    ) -> Result<Lease, AllocError> {
        self.phase.set(Phase::Idle);
        match self.try_allocate(request, cancel).await {
            Ok(lease) => Ok(lease),
            Err(e) => {
                error!(error = %e, "Allocation failed");
                self.phase.set(Phase::Failed);
                Err(e)
            }
        }
    }

    async fn try_allocate(
        &self,
        request: &AllocationRequest,
        cancel: &Cancellation,
    ) -> Result<Lease, AllocError> {
        request.validate()?;
        let mem_total = request.memory_mb()?;

        let identity = DeviceFilter::new(
            self.config.build_identifier_group.as_str(),
            request.build_identifier(),
        );
        let mut search = request.filters.clone();
        search.push(identity);

        info!(
            build_url = %remove_bewit(&request.build_url),
            mem_total,
            filters = request.filters.len(),
            max_retries = self.config.max_retries,
            "Allocating device"
        );

        let policy = RetryPolicy::new(self.config.max_retries);
        let (device, session) = {
            let this = self;
            let search = &search;
            retry(
                policy,
                move |attempt| this.attempt(attempt, search, request, mem_total, cancel),
                AttemptError::is_retryable,
            )
            .await
            .map_err(|e| match e {
                RetryError::Exhausted {
                    attempts,
                    last: AttemptError::NotFound,
                } => AllocError::FlashingFailed { attempts },
                RetryError::Exhausted { attempts, .. } => {
                    AllocError::SessionUnavailable { attempts }
                }
                RetryError::Fatal {
                    error: AttemptError::Fatal(e),
                    ..
                } => e,
                RetryError::Fatal { attempt, .. } => AllocError::SessionUnavailable {
                    attempts: attempt,
                },
            })?
        };
        info!(
            session_id = session.id,
            device_id = device.id,
            device_name = %device.display_name,
            "Started session"
        );

        // A cancel that lands during the last proxy query has no sleep to
        // interrupt, so it is checked once more here.
        let described = match self.describe(&device, &session, cancel).await {
            Ok(_) if cancel.is_cancelled() => Err(AllocError::Cancelled),
            other => other,
        };

        match described {
            Ok(descriptor) => {
                self.phase.set(Phase::Ready);
                Ok(Lease {
                    descriptor,
                    teardown: Teardown::new(
                        self.sessions.clone(),
                        Some(session.id),
                        self.phase.clone(),
                    ),
                })
            }
            Err(e) => {
                self.release_after_failure(session.id, &e).await;
                Err(e)
            }
        }
    }

    async fn release_after_failure(&self, session_id: i64, reason: &AllocError) {
        warn!(session_id, error = %reason, "Releasing session after failure");
        if let Err(e) = self.sessions.release_with_refresh(session_id).await {
            error!(session_id, error = %e, "Failed to release device session");
        }
    }

    /// One locate, then either flash (not found) or acquire (found).
    async fn attempt(
        &self,
        attempt: Attempt,
        search: &[DeviceFilter],
        request: &AllocationRequest,
        mem_total: u64,
        cancel: &Cancellation,
    ) -> Result<(Device, DeviceSession), AttemptError> {
        if cancel.is_cancelled() {
            return Err(AttemptError::Fatal(AllocError::Cancelled));
        }

        self.phase.set(Phase::Locating);
        info!(
            attempt = attempt.number,
            max_attempts = attempt.max_attempts,
            "Locating device"
        );

        let located = self
            .locator
            .locate(search, false)
            .await
            .map_err(|e| AttemptError::Fatal(e.into()))?;

        let Some(device) = located else {
            if !attempt.is_last() {
                self.flash(request, mem_total, cancel).await?;
            } else {
                info!(attempts = attempt.number, "Flashing device failed, no device found");
            }
            return Err(AttemptError::NotFound);
        };

        self.phase.set(Phase::SessionPending);
        match self
            .sessions
            .acquire(device.id, cancel)
            .await
            .map_err(AttemptError::Fatal)?
        {
            Some(session) if cancel.is_cancelled() => {
                let err = AllocError::Cancelled;
                self.release_after_failure(session.id, &err).await;
                Err(AttemptError::Fatal(err))
            }
            Some(session) => Ok((device, session)),
            None => {
                info!(device_id = device.id, attempt = attempt.number, "Device session is null");
                Err(AttemptError::SessionNull)
            }
        }
    }

    async fn flash(
        &self,
        request: &AllocationRequest,
        mem_total: u64,
        cancel: &Cancellation,
    ) -> Result<(), AttemptError> {
        self.phase.set(Phase::Flashing);
        let outcome = self
            .provisioner
            .provision(&request.filters, &request.build_url, mem_total, cancel)
            .await
            .map_err(AttemptError::Fatal)?;

        match outcome {
            ProvisionOutcome::Flashed { run_id, device_id } => {
                info!(run_id, device_id, "Device flashed")
            }
            ProvisionOutcome::Failed { run_id } => warn!(run_id, "Flash run failed"),
            ProvisionOutcome::TimedOut { run_id } => warn!(run_id, "Flash run timed out"),
            ProvisionOutcome::JobNotFound => {
                return Err(AttemptError::Fatal(AllocError::JobNotFound(
                    self.config.flash_project.clone(),
                )))
            }
        }
        Ok(())
    }

    /// Snapshot labels and discover both proxies of a running session.
    async fn describe(
        &self,
        device: &Device,
        session: &DeviceSession,
        cancel: &Cancellation,
    ) -> Result<SessionDescriptor, AllocError> {
        let device_data = match &self.workspace {
            Some(workspace) => {
                write_device_snapshot(
                    &*self.api,
                    workspace,
                    device.id,
                    &self.config.device_data_file,
                )
                .await
            }
            None => None,
        };

        self.phase.set(Phase::ResolvingProxies);
        let adb = self
            .proxies
            .resolve(session.id, ProxyKind::Adb, cancel)
            .await?;
        info!(port = adb.port, host = %self.host, serial = %adb.host_identity, "ADB proxy");

        let marionette = self
            .proxies
            .resolve(session.id, ProxyKind::Marionette, cancel)
            .await?;
        info!(port = marionette.port, host = %self.host, "Marionette proxy");

        Ok(SessionDescriptor {
            session_id: session.id,
            device_id: device.id,
            device_name: device.display_name.clone(),
            adb_port: adb.port,
            adb_host: self.host.clone(),
            android_serial: adb.host_identity,
            marionette_port: marionette.port,
            marionette_host: self.host.clone(),
            device_data,
        })
    }
}

/// Descriptor variables as a map, e.g. for a child process environment.
pub fn env_map(descriptor: &SessionDescriptor) -> HashMap<String, String> {
    descriptor
        .env_vars()
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
