//! Device farm API.
//!
//! The allocator talks to the farm only through the [`FarmApi`] trait. The
//! farm owns every entity; values returned here are snapshots that may be
//! stale the moment they arrive.
//!
//! - [`HttpFarmClient`]: REST implementation over reqwest
//! - [`Connect`]: produces freshly authenticated clients, used to recover
//!   from expired tokens

use std::sync::Arc;

use async_trait::async_trait;

pub use reqwest::Url;

pub mod client;
pub mod config;
pub mod error;
pub mod model;

pub use client::{HttpConnector, HttpFarmClient};
pub use config::FarmConfig;
pub use error::ApiError;
pub use model::{
    Device, DeviceProperty, DeviceQuery, DeviceRun, DeviceRunStatus, DeviceSession, Label,
    LabelGroup, Project, ProxyEntry, ProxyKind, RunParameter, RunState, SessionState, TestRun,
    User,
};

/// Operations the allocator needs from the device farm.
#[async_trait]
pub trait FarmApi: Send + Sync {
    /// Current account; doubles as an authentication check.
    async fn me(&self) -> Result<User, ApiError>;

    /// Label groups whose name contains `search`.
    async fn label_groups(&self, search: &str) -> Result<Vec<LabelGroup>, ApiError>;

    /// Labels of a group whose name contains `search`.
    async fn labels(&self, group_id: i64, search: &str) -> Result<Vec<Label>, ApiError>;

    async fn devices(&self, query: &DeviceQuery) -> Result<Vec<Device>, ApiError>;

    /// Labels attached to a device.
    async fn device_properties(&self, device_id: i64) -> Result<Vec<DeviceProperty>, ApiError>;

    /// Projects whose name contains `search`.
    async fn projects(&self, search: &str) -> Result<Vec<Project>, ApiError>;

    async fn create_run(&self, project_id: i64) -> Result<TestRun, ApiError>;

    /// Refresh a run.
    async fn run(&self, project_id: i64, run_id: i64) -> Result<TestRun, ApiError>;

    async fn run_parameters(
        &self,
        project_id: i64,
        run_id: i64,
    ) -> Result<Vec<RunParameter>, ApiError>;

    async fn delete_run_parameter(
        &self,
        project_id: i64,
        run_id: i64,
        parameter_id: i64,
    ) -> Result<(), ApiError>;

    async fn create_run_parameter(
        &self,
        project_id: i64,
        run_id: i64,
        key: &str,
        value: &str,
    ) -> Result<RunParameter, ApiError>;

    /// Start a run on exactly the given devices.
    async fn start_run(&self, run_id: i64, device_ids: &[i64]) -> Result<TestRun, ApiError>;

    async fn abort_run(&self, project_id: i64, run_id: i64) -> Result<(), ApiError>;

    async fn device_runs(&self, project_id: i64, run_id: i64) -> Result<Vec<DeviceRun>, ApiError>;

    /// Plain-text log of one device run.
    async fn device_run_log(
        &self,
        project_id: i64,
        run_id: i64,
        device_run_id: i64,
    ) -> Result<String, ApiError>;

    /// Request an exclusive session. The farm rejects the request with a
    /// conflict status when the device is already locked.
    async fn create_session(&self, device_id: i64) -> Result<DeviceSession, ApiError>;

    /// Refresh a session.
    async fn session(&self, session_id: i64) -> Result<DeviceSession, ApiError>;

    async fn release_session(&self, session_id: i64) -> Result<(), ApiError>;

    /// Proxy entries of `kind` published for a session; empty until the
    /// farm has provisioned them.
    async fn proxies(&self, kind: ProxyKind, session_id: i64) -> Result<Vec<ProxyEntry>, ApiError>;
}

/// Produces authenticated API clients.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn FarmApi>, ApiError>;
}
