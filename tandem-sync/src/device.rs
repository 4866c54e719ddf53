//! Device registry: client installations and their per-document catch-up
//! indices.
//!
//! Devices are not pushed to. They pull what they missed with
//! `history_since(uri, last_synced_version[uri])` and then acknowledge the
//! version they reached.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::change::{now_millis, DocumentUri};
use crate::error::SyncError;

pub type DeviceId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Web,
    Desktop,
    Mobile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub platform: Platform,
    pub last_synced_version: HashMap<DocumentUri, u64>,
    /// Milliseconds since the Unix epoch
    pub registered_at: u64,
}

impl Device {
    /// Last acknowledged version of `uri` (0 if never synced).
    pub fn last_synced(&self, uri: &str) -> u64 {
        self.last_synced_version.get(uri).copied().unwrap_or(0)
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: DashMap<DeviceId, Device>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: a known device keeps its platform and catch-up indices.
    pub fn register(&self, device_id: impl Into<DeviceId>, platform: Platform) -> Device {
        let device_id = device_id.into();
        self.devices
            .entry(device_id.clone())
            .or_insert_with(|| {
                log::info!("Registered {platform:?} device {device_id}");
                Device {
                    device_id: device_id.clone(),
                    platform,
                    last_synced_version: HashMap::new(),
                    registered_at: now_millis(),
                }
            })
            .value()
            .clone()
    }

    /// Advance the catch-up index of `device_id` for `uri`.
    ///
    /// A regression fails with [`SyncError::StaleAck`] and leaves the stored
    /// value untouched; re-acknowledging the same version is a no-op.
    pub fn mark_synced(&self, device_id: &str, uri: &str, version: u64) -> Result<(), SyncError> {
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))?;

        let stored = device.last_synced(uri);
        if version < stored {
            return Err(SyncError::StaleAck {
                document_uri: uri.to_string(),
                reported: version,
                stored,
            });
        }
        device.last_synced_version.insert(uri.to_string(), version);
        Ok(())
    }

    /// Version the device has consumed for `uri`.
    pub fn last_synced(&self, device_id: &str, uri: &str) -> Result<u64, SyncError> {
        self.devices
            .get(device_id)
            .map(|device| device.last_synced(uri))
            .ok_or_else(|| SyncError::UnknownDevice(device_id.to_string()))
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
