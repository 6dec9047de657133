//! Connection settings for the device farm.

use std::time::Duration;

use reqwest::Url;

use crate::error::ApiError;

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Farm endpoint and credentials.
#[derive(Clone)]
pub struct FarmConfig {
    /// Cloud endpoint, e.g. `https://cloud.example.com`.
    pub endpoint_url: String,

    pub username: String,

    pub password: String,

    /// Optional HTTP proxy for all API traffic.
    pub http_proxy: Option<String>,

    pub request_timeout: Duration,
}

impl std::fmt::Debug for FarmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FarmConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("http_proxy", &self.http_proxy)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl FarmConfig {
    pub fn new(
        endpoint_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            endpoint_url: endpoint_url.into(),
            username: username.into(),
            password: password.into(),
            http_proxy: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Reject missing credentials and malformed URLs up front.
    pub fn validate(&self) -> Result<(), ApiError> {
        if self.endpoint_url.trim().is_empty() {
            return Err(ApiError::Config("API endpoint is mandatory".to_string()));
        }
        self.endpoint()?;

        if self.username.trim().is_empty() {
            return Err(ApiError::Config("username is mandatory".to_string()));
        }
        if self.password.trim().is_empty() {
            return Err(ApiError::Config("password is mandatory".to_string()));
        }

        if let Some(proxy) = &self.http_proxy {
            Url::parse(proxy)
                .map_err(|e| ApiError::Config(format!("invalid HTTP proxy `{}`: {}", proxy, e)))?;
        }

        Ok(())
    }

    /// Parsed endpoint URL.
    pub fn endpoint(&self) -> Result<Url, ApiError> {
        Url::parse(self.endpoint_url.trim()).map_err(|e| {
            ApiError::Config(format!(
                "endpoint URL `{}` is not a valid URL: {}",
                self.endpoint_url, e
            ))
        })
    }

    /// Host name that proxy ports are exposed on.
    pub fn host(&self) -> Result<String, ApiError> {
        self.endpoint()?
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| ApiError::Config(format!("endpoint `{}` has no host", self.endpoint_url)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_from_endpoint() {
        let config = FarmConfig::new("https://cloud.example.com/", "ci", "secret");
        assert_eq!(config.host().unwrap(), "cloud.example.com");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_credentials() {
        let config = FarmConfig::new("https://cloud.example.com", "", "secret");
        assert!(matches!(config.validate(), Err(ApiError::Config(_))));

        let config = FarmConfig::new("https://cloud.example.com", "ci", " ");
        assert!(matches!(config.validate(), Err(ApiError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = FarmConfig::new("not a url", "ci", "secret");
        assert!(matches!(config.validate(), Err(ApiError::Config(_))));
    }

    #[test]
    fn test_debug_hides_password() {
        let config = FarmConfig::new("https://cloud.example.com", "ci", "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
