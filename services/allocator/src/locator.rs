//! Device selection by label filters.

use std::sync::Arc;

use devlease_farm_api::{ApiError, Device, DeviceQuery, FarmApi};
use rand::seq::SliceRandom;
use tracing::{debug, info};

use crate::filter::DeviceFilter;

/// Resolves label filters to a concrete device. Read-only.
#[derive(Clone)]
pub struct DeviceLocator {
    api: Arc<dyn FarmApi>,
}

impl DeviceLocator {
    pub fn new(api: Arc<dyn FarmApi>) -> Self {
        Self { api }
    }

    /// Find a device carrying every label in `filters`.
    ///
    /// Unknown groups or labels yield `Ok(None)`. Candidates are shuffled so
    /// concurrent allocations spread across the pool. An available device is
    /// always preferred; with `allow_locked_fallback` an online but locked one
    /// is returned instead of nothing.
    pub async fn locate(
        &self,
        filters: &[DeviceFilter],
        allow_locked_fallback: bool,
    ) -> Result<Option<Device>, ApiError> {
        let mut label_ids = Vec::with_capacity(filters.len());
        for filter in filters {
            match self.resolve_label(filter).await? {
                Some(id) => label_ids.push(id),
                None => return Ok(None),
            }
        }

        let mut devices = self.api.devices(&DeviceQuery::with_labels(label_ids)).await?;
        debug!(candidates = devices.len(), "Devices matching filters");
        devices.shuffle(&mut rand::rng());

        let device = select_device(devices, allow_locked_fallback);
        match &device {
            Some(d) => info!(
                device_id = d.id,
                device_name = %d.display_name,
                locked = d.locked,
                "Selected device"
            ),
            None => info!(allow_locked_fallback, "No device found"),
        }
        Ok(device)
    }

    async fn resolve_label(&self, filter: &DeviceFilter) -> Result<Option<i64>, ApiError> {
        let groups = self.api.label_groups(&filter.group).await?;
        let Some(group) = groups.into_iter().next() else {
            info!(group = %filter.group, "Label group not found");
            return Ok(None);
        };
        debug!(group = %filter.group, group_id = group.id, "Resolved label group");

        let labels = self.api.labels(group.id, &filter.label).await?;
        match labels.into_iter().find(|l| l.display_name == filter.label) {
            Some(label) => {
                debug!(label = %filter.label, label_id = label.id, "Resolved label");
                Ok(Some(label.id))
            }
            None => {
                info!(group = %filter.group, label = %filter.label, "Label not found");
                Ok(None)
            }
        }
    }
}

/// First available device, else (with fallback) the first online locked one.
pub fn select_device(devices: Vec<Device>, allow_locked_fallback: bool) -> Option<Device> {
    let mut fallback = None;
    for device in devices {
        if device.is_available() {
            return Some(device);
        }
        if allow_locked_fallback && fallback.is_none() && device.online && device.locked {
            fallback = Some(device);
        }
    }
    fallback
}
