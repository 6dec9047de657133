//! Allocator configuration and per-allocation request.

use std::time::Duration;

use devlease_farm_api::Url;
use devlease_retry::DEFAULT_MAX_RETRIES;

use crate::error::AllocError;
use crate::filter::DeviceFilter;

/// Tunables of the allocation protocol.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Label group that records which build a device carries.
    pub build_identifier_group: String,

    /// Name of the provisioning project.
    pub flash_project: String,

    /// Run parameter carrying the build image URL.
    pub build_url_param: String,

    /// Run parameter carrying the memory total.
    pub mem_total_param: String,

    pub flash_timeout: Duration,
    pub flash_poll_interval: Duration,

    /// How long a new session may stay `WAITING`.
    pub session_timeout: Duration,
    pub session_poll_interval: Duration,

    /// How long to wait for each proxy to be published.
    pub proxy_timeout: Duration,
    pub proxy_poll_interval: Duration,

    /// Retries after the first locate/acquire attempt.
    pub max_retries: u32,

    /// Status the farm answers with when a device is already locked.
    pub conflict_status: u16,

    /// File name of the device label snapshot, relative to the workspace.
    pub device_data_file: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            build_identifier_group: "Build Identifier".to_string(),
            flash_project: "flash-fxos".to_string(),
            build_url_param: "FLAME_ZIP_URL".to_string(),
            mem_total_param: "MEM_TOTAL".to_string(),
            flash_timeout: Duration::from_secs(10 * 60),
            flash_poll_interval: Duration::from_secs(10),
            session_timeout: Duration::from_secs(60),
            session_poll_interval: Duration::from_secs(5),
            proxy_timeout: Duration::from_secs(5 * 60),
            proxy_poll_interval: Duration::from_secs(10),
            max_retries: DEFAULT_MAX_RETRIES,
            conflict_status: 400,
            device_data_file: "device.json".to_string(),
        }
    }
}

impl AllocatorConfig {
    /// Defaults overridden by `DEVLEASE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(group) = std::env::var("DEVLEASE_BUILD_IDENTIFIER_GROUP") {
            config.build_identifier_group = group;
        }
        if let Ok(project) = std::env::var("DEVLEASE_FLASH_PROJECT") {
            config.flash_project = project;
        }
        if let Some(secs) = env_u64("DEVLEASE_FLASH_TIMEOUT_SECS") {
            config.flash_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DEVLEASE_SESSION_TIMEOUT_SECS") {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("DEVLEASE_PROXY_TIMEOUT_SECS") {
            config.proxy_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_u64("DEVLEASE_MAX_RETRIES") {
            config.max_retries = u32::try_from(retries).unwrap_or(u32::MAX);
        }
        if let Some(status) = env_u64("DEVLEASE_CONFLICT_STATUS").and_then(|s| u16::try_from(s).ok())
        {
            config.conflict_status = status;
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

/// What the caller wants leased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Build image to flash when no device already carries it.
    pub build_url: String,

    /// Memory total in MB as text; `0` means the device default.
    pub mem_total: String,

    /// Extra label predicates the device must satisfy.
    pub filters: Vec<DeviceFilter>,
}

impl AllocationRequest {
    /// Both values are stored trimmed, so flashing and locating agree on them.
    pub fn new(build_url: impl Into<String>, mem_total: impl Into<String>) -> Self {
        Self {
            build_url: build_url.into().trim().to_string(),
            mem_total: mem_total.into().trim().to_string(),
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Build URL must be present and parse; memory must be a non-negative integer.
    pub fn validate(&self) -> Result<(), AllocError> {
        let build_url = self.build_url.trim();
        if build_url.is_empty() {
            return Err(AllocError::InvalidRequest(
                "build URL is mandatory".to_string(),
            ));
        }
        Url::parse(build_url).map_err(|e| {
            AllocError::InvalidRequest(format!("build URL `{}` is not a valid URL: {}", build_url, e))
        })?;

        self.memory_mb()?;
        Ok(())
    }

    pub fn memory_mb(&self) -> Result<u64, AllocError> {
        let mem = self.mem_total.trim();
        if mem.is_empty() {
            return Ok(0);
        }
        mem.parse::<u64>().map_err(|_| {
            AllocError::InvalidRequest(format!(
                "memory total `{}` must be a non-negative integer",
                mem
            ))
        })
    }

    /// Label recording which build a device was flashed with.
    pub fn build_identifier(&self) -> String {
        let mem = self.memory_mb().unwrap_or(0);
        format!("{}_{}", mem, self.build_url.trim())
    }
}
