//! HTTP implementation of [`FarmApi`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::FarmConfig;
use crate::error::ApiError;
use crate::model::{
    Device, DeviceProperty, DeviceQuery, DeviceRun, DeviceSession, Label, LabelGroup, Page,
    Project, ProxyEntry, ProxyKind, RunParameter, TestRun, User,
};
use crate::{Connect, FarmApi};

/// OAuth client id accepted by the farm for password grants.
const OAUTH_CLIENT_ID: &str = "testdroid-cloud-api";

/// REST prefix below the endpoint URL.
const API_PREFIX: &str = "/api/v2";

/// Authenticated HTTP client for the farm REST API.
#[derive(Debug, Clone)]
pub struct HttpFarmClient {
    client: reqwest::Client,
    api_url: String,
}

impl HttpFarmClient {
    /// Authenticate against the farm and return a ready client.
    pub async fn connect(config: &FarmConfig) -> Result<Self, ApiError> {
        config.validate()?;
        let base_url = config.endpoint_url.trim().trim_end_matches('/').to_string();

        info!(
            endpoint = %base_url,
            username = %config.username,
            proxy = config.http_proxy.as_deref().unwrap_or("none"),
            "Connecting to device farm"
        );

        let anonymous = build_http(config, None)?;
        let token = fetch_token(&anonymous, &base_url, config).await?;

        Ok(Self {
            client: build_http(config, Some(&token))?,
            api_url: format!("{}{}", base_url, API_PREFIX),
        })
    }

    /// Build a URL for an endpoint.
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        debug!(path, "GET");
        let response = self.client.get(self.url(path)).query(query).send().await?;
        decode(path, response).await
    }

    async fn get_text(&self, path: &str) -> Result<String, ApiError> {
        debug!(path, "GET");
        let response = self
            .client
            .get(self.url(path))
            .header(ACCEPT, "text/plain")
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.text().await?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
    ) -> Result<T, ApiError> {
        debug!(path, "POST");
        let response = self.client.post(self.url(path)).form(form).send().await?;
        decode(path, response).await
    }

    async fn post_unit(&self, path: &str) -> Result<(), ApiError> {
        debug!(path, "POST");
        let response = self.client.post(self.url(path)).send().await?;
        check_status(response).await.map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<(), ApiError> {
        debug!(path, "DELETE");
        let response = self.client.delete(self.url(path)).send().await?;
        check_status(response).await.map(|_| ())
    }

    fn run_path(project_id: i64, run_id: i64) -> String {
        format!("/me/projects/{}/runs/{}", project_id, run_id)
    }
}

#[async_trait]
impl FarmApi for HttpFarmClient {
    async fn me(&self) -> Result<User, ApiError> {
        self.get("/me", &[]).await
    }

    async fn label_groups(&self, search: &str) -> Result<Vec<LabelGroup>, ApiError> {
        let page: Page<LabelGroup> = self
            .get("/label-groups", &[("search", search.to_string())])
            .await?;
        Ok(page.data)
    }

    async fn labels(&self, group_id: i64, search: &str) -> Result<Vec<Label>, ApiError> {
        let page: Page<Label> = self
            .get(
                &format!("/label-groups/{}/labels", group_id),
                &[("search", search.to_string())],
            )
            .await?;
        Ok(page.data)
    }

    async fn devices(&self, query: &DeviceQuery) -> Result<Vec<Device>, ApiError> {
        let page: Page<Device> = self.get("/devices", &query.to_pairs()).await?;
        Ok(page.data)
    }

    async fn device_properties(&self, device_id: i64) -> Result<Vec<DeviceProperty>, ApiError> {
        let page: Page<DeviceProperty> = self
            .get(
                &format!("/devices/{}/properties", device_id),
                &[("limit", "0".to_string())],
            )
            .await?;
        Ok(page.data)
    }

    async fn projects(&self, search: &str) -> Result<Vec<Project>, ApiError> {
        let page: Page<Project> = self
            .get("/me/projects", &[("search", search.to_string())])
            .await?;
        Ok(page.data)
    }

    async fn create_run(&self, project_id: i64) -> Result<TestRun, ApiError> {
        self.post("/runs", &[("projectId", project_id.to_string())])
            .await
    }

    async fn run(&self, project_id: i64, run_id: i64) -> Result<TestRun, ApiError> {
        self.get(&Self::run_path(project_id, run_id), &[]).await
    }

    async fn run_parameters(
        &self,
        project_id: i64,
        run_id: i64,
    ) -> Result<Vec<RunParameter>, ApiError> {
        let page: Page<RunParameter> = self
            .get(
                &format!("{}/config/parameters", Self::run_path(project_id, run_id)),
                &[("limit", "0".to_string())],
            )
            .await?;
        Ok(page.data)
    }

    async fn delete_run_parameter(
        &self,
        project_id: i64,
        run_id: i64,
        parameter_id: i64,
    ) -> Result<(), ApiError> {
        self.delete(&format!(
            "{}/config/parameters/{}",
            Self::run_path(project_id, run_id),
            parameter_id
        ))
        .await
    }

    async fn create_run_parameter(
        &self,
        project_id: i64,
        run_id: i64,
        key: &str,
        value: &str,
    ) -> Result<RunParameter, ApiError> {
        self.post(
            &format!("{}/config/parameters", Self::run_path(project_id, run_id)),
            &[("key", key.to_string()), ("value", value.to_string())],
        )
        .await
    }

    async fn start_run(&self, run_id: i64, device_ids: &[i64]) -> Result<TestRun, ApiError> {
        let form: Vec<(&str, String)> = device_ids
            .iter()
            .map(|id| ("usedDeviceIds[]", id.to_string()))
            .collect();
        self.post(&format!("/runs/{}/start", run_id), &form).await
    }

    async fn abort_run(&self, project_id: i64, run_id: i64) -> Result<(), ApiError> {
        self.post_unit(&format!("{}/abort", Self::run_path(project_id, run_id)))
            .await
    }

    async fn device_runs(&self, project_id: i64, run_id: i64) -> Result<Vec<DeviceRun>, ApiError> {
        let page: Page<DeviceRun> = self
            .get(
                &format!("{}/device-runs", Self::run_path(project_id, run_id)),
                &[("limit", "0".to_string())],
            )
            .await?;
        Ok(page.data)
    }

    async fn device_run_log(
        &self,
        project_id: i64,
        run_id: i64,
        device_run_id: i64,
    ) -> Result<String, ApiError> {
        self.get_text(&format!(
            "{}/device-runs/{}/logs",
            Self::run_path(project_id, run_id),
            device_run_id
        ))
        .await
    }

    async fn create_session(&self, device_id: i64) -> Result<DeviceSession, ApiError> {
        self.post(
            "/me/device-sessions",
            &[("deviceModelId", device_id.to_string())],
        )
        .await
    }

    async fn session(&self, session_id: i64) -> Result<DeviceSession, ApiError> {
        self.get(&format!("/me/device-sessions/{}", session_id), &[])
            .await
    }

    async fn release_session(&self, session_id: i64) -> Result<(), ApiError> {
        self.post_unit(&format!("/me/device-sessions/{}/release", session_id))
            .await
    }

    async fn proxies(&self, kind: ProxyKind, session_id: i64) -> Result<Vec<ProxyEntry>, ApiError> {
        let filter = format!(
            r#"{{"type":"{}","sessionId":{}}}"#,
            kind.as_str(),
            session_id
        );
        self.get("/proxy-plugin/proxies", &[("where", filter)]).await
    }
}

/// Connects fresh [`HttpFarmClient`]s, re-running authentication each time.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    config: FarmConfig,
}

impl HttpConnector {
    pub fn new(config: FarmConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connect for HttpConnector {
    async fn connect(&self) -> Result<Arc<dyn FarmApi>, ApiError> {
        let client = HttpFarmClient::connect(&self.config).await?;
        Ok(Arc::new(client))
    }
}

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Error body returned by the farm.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn build_http(config: &FarmConfig, token: Option<&str>) -> Result<reqwest::Client, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

    if let Some(token) = token {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| ApiError::NotAuthenticated("invalid token format".to_string()))?;
        headers.insert(AUTHORIZATION, value);
    }

    let mut builder = reqwest::Client::builder()
        .default_headers(headers)
        .timeout(config.request_timeout);

    if let Some(proxy) = &config.http_proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy.as_str())?);
    }

    Ok(builder.build()?)
}

async fn fetch_token(
    client: &reqwest::Client,
    base_url: &str,
    config: &FarmConfig,
) -> Result<String, ApiError> {
    let response = client
        .post(format!("{}/oauth/token", base_url))
        .form(&[
            ("client_id", OAUTH_CLIENT_ID),
            ("grant_type", "password"),
            ("username", config.username.as_str()),
            ("password", config.password.as_str()),
        ])
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::NotAuthenticated(format!("{} {}", status, body)));
    }

    let body = response.text().await?;
    let token: TokenResponse =
        serde_json::from_str(&body).map_err(|e| ApiError::decode("oauth token", e))?;
    Ok(token.access_token)
}

/// Map non-success statuses onto [`ApiError`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    if status.as_u16() == 401 {
        return Err(ApiError::NotAuthenticated(message));
    }
    Err(ApiError::status(status.as_u16(), message))
}

async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T, ApiError> {
    let response = check_status(response).await?;
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| ApiError::decode(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunState, SessionState};
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_farm() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .and(body_string_contains("grant_type=password"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "access_token": "tok-1" })),
            )
            .mount(&server)
            .await;
        server
    }

    async fn connect(server: &MockServer) -> HttpFarmClient {
        let config = FarmConfig::new(server.uri(), "ci", "secret");
        HttpFarmClient::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_bearer_token() {
        let server = mock_farm().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/me"))
            .and(header("authorization", "Bearer tok-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 42 })))
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let me = client.me().await.unwrap();
        assert_eq!(me.id, 42);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth/token"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let config = FarmConfig::new(server.uri(), "ci", "wrong");
        let result = HttpFarmClient::connect(&config).await;
        assert!(matches!(result, Err(ApiError::NotAuthenticated(_))));
    }

    #[tokio::test]
    async fn test_devices_filtered_by_labels() {
        let server = mock_farm().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/devices"))
            .and(query_param("limit", "0"))
            .and(query_param("label_id[]", "5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [
                    { "id": 1, "displayName": "flame-1", "online": true, "locked": false }
                ],
                "total": 1
            })))
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let devices = client
            .devices(&DeviceQuery::with_labels(vec![5]))
            .await
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].is_available());
    }

    #[tokio::test]
    async fn test_session_conflict_keeps_status() {
        let server = mock_farm().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/me/device-sessions"))
            .and(body_string_contains("deviceModelId=7"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({ "message": "Device is locked" })),
            )
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let err = client.create_session(7).await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        assert!(err.to_string().contains("Device is locked"));
    }

    #[tokio::test]
    async fn test_unknown_state_is_decode_error() {
        let server = mock_farm().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/me/device-sessions/3"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "id": 3, "state": "ZOMBIE" })),
            )
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let err = client.session(3).await.unwrap_err();
        assert!(matches!(err, ApiError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_session_and_run_decode() {
        let server = mock_farm().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/me/device-sessions/3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "id": 3, "deviceId": 7, "state": "RUNNING" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v2/me/projects/10/runs/20"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "id": 20, "projectId": 10, "state": "WAITING" }),
            ))
            .mount(&server)
            .await;

        let client = connect(&server).await;
        assert_eq!(client.session(3).await.unwrap().state, SessionState::Running);
        assert_eq!(client.run(10, 20).await.unwrap().state, RunState::Waiting);
    }

    #[tokio::test]
    async fn test_proxies_query_is_scoped() {
        let server = mock_farm().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/proxy-plugin/proxies"))
            .and(query_param("where", r#"{"type":"marionette","sessionId":9}"#))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "type": "marionette", "port": 2828, "sessionId": 9 }
            ])))
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let entries = client.proxies(ProxyKind::Marionette, 9).await.unwrap();
        assert_eq!(entries[0].port, 2828);
    }

    #[tokio::test]
    async fn test_expired_token_maps_to_not_authenticated() {
        let server = mock_farm().await;
        Mock::given(method("POST"))
            .and(path("/api/v2/me/device-sessions/3/release"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = connect(&server).await;
        let err = client.release_session(3).await.unwrap_err();
        assert!(matches!(err, ApiError::NotAuthenticated(_)));
    }
}
