//! Build workspace sink and the device label snapshot.

use std::path::{Path, PathBuf};

use devlease_farm_api::{DeviceProperty, FarmApi};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

/// Directory the build runs in; artifacts are written relative to it.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `content` as UTF-8 to `relative`, creating parent directories.
    pub async fn write(&self, relative: &str, content: &str) -> std::io::Result<PathBuf> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content.as_bytes()).await?;
        debug!(path = %path.display(), bytes = content.len(), "Wrote workspace file");
        Ok(path)
    }
}

/// `"Device Type"` becomes `"device_type"`.
pub fn group_key(group_name: &str) -> String {
    group_name.to_lowercase().replace(' ', "_")
}

/// Group labels by normalized group name. A group with one label maps to a
/// string, a group with several maps to an array in label order.
pub fn label_snapshot(properties: &[DeviceProperty]) -> Value {
    let mut map = Map::new();

    for property in properties {
        let key = group_key(&property.property_group_name);
        let label = Value::String(property.display_name.clone());

        match map.get_mut(&key) {
            Some(Value::Array(labels)) => labels.push(label),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, label]);
            }
            None => {
                map.insert(key, label);
            }
        }
    }

    Value::Object(map)
}

/// Fetch the device's labels and write them to `file_name`.
///
/// Returns the file name when something was written. Never fails the
/// allocation: errors are logged and yield `None`, as does a device with no
/// labels.
pub async fn write_device_snapshot(
    api: &dyn FarmApi,
    workspace: &Workspace,
    device_id: i64,
    file_name: &str,
) -> Option<String> {
    let properties = match api.device_properties(device_id).await {
        Ok(properties) => properties,
        Err(e) => {
            warn!(device_id, error = %e, "Failed to fetch device labels");
            return None;
        }
    };

    if properties.is_empty() {
        info!(device_id, "No device labels have been set");
        return None;
    }

    let snapshot = label_snapshot(&properties);
    let content = match serde_json::to_string_pretty(&snapshot) {
        Ok(content) => content,
        Err(e) => {
            warn!(device_id, error = %e, "Failed to serialize device labels");
            return None;
        }
    };

    match workspace.write(file_name, &content).await {
        Ok(_) => {
            info!(device_id, file = file_name, data = %snapshot, "Device data written");
            Some(file_name.to_string())
        }
        Err(e) => {
            warn!(device_id, file = file_name, error = %e, "Failed to write device data");
            None
        }
    }
}
