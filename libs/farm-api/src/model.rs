//! Remote entities as returned by the device farm API.
//!
//! Every record is a point-in-time snapshot owned by the farm. State fields
//! are closed enums; a state the client does not know about fails decoding
//! instead of being mapped to a default.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Authenticated account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub email: Option<String>,
}

/// Paged list envelope used by every collection endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub total: i64,
}

/// Top level of the label taxonomy, e.g. "Build Identifier".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelGroup {
    pub id: i64,
    pub display_name: String,
}

/// A discrete value inside a [`LabelGroup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Label {
    pub id: i64,
    pub display_name: String,
}

/// A label as attached to a specific device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProperty {
    pub id: i64,
    pub display_name: String,
    pub property_group_name: String,
}

/// A device in the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: i64,
    pub display_name: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub locked: bool,
}

impl Device {
    /// Online and not held by anyone.
    pub fn is_available(&self) -> bool {
        self.online && !self.locked
    }
}

/// Device listing query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceQuery {
    /// Devices must carry every one of these label ids.
    pub label_ids: Vec<i64>,
    /// `0` means no limit.
    pub limit: u32,
}

impl DeviceQuery {
    pub fn with_labels(label_ids: Vec<i64>) -> Self {
        Self {
            label_ids,
            limit: 0,
        }
    }

    /// Query string pairs as understood by the farm.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("limit", self.limit.to_string())];
        pairs.extend(self.label_ids.iter().map(|id| ("label_id[]", id.to_string())));
        pairs
    }
}

/// A project; the flash job is one of these, located by name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    pub name: String,
}

/// A key/value parameter on a run's config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunParameter {
    pub id: i64,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Created,
    Waiting,
    Running,
    Finished,
    Aborted,
}

/// A provisioning run ("test run") of a project.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: i64,
    pub project_id: i64,
    pub state: RunState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRunStatus {
    Passed,
    Failed,
    #[serde(other)]
    Other,
}

/// Outcome of a run on one participating device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRun {
    pub id: i64,
    pub device_id: i64,
    pub run_status: DeviceRunStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Waiting,
    Running,
    Aborted,
    Timeout,
    Finished,
}

/// Exclusive lock on a device.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub id: i64,
    #[serde(default)]
    pub device_id: Option<i64>,
    pub state: SessionState,
}

/// Protocol bridged by a session proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Adb,
    Marionette,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Adb => "adb",
            Self::Marionette => "marionette",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxy entry as published by the proxy plugin once a session is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEntry {
    #[serde(rename = "type", default)]
    pub kind: Option<ProxyKind>,
    #[serde(deserialize_with = "port_from_number_or_string")]
    pub port: u16,
    #[serde(default)]
    pub serial_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<i64>,
}

/// The plugin serializes ports as either JSON numbers or strings.
fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Number(port) => Ok(port),
        Port::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}
