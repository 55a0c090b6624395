//! Device Registry and the device-creation workflow

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::store::{self, RegistryError};
use crate::{Identifier, Link, Orchestrator, ProvisionError};

/// A provisioned device, keyed by its validated identifier.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeviceRecord {
    pub identifier: Identifier,
    pub name: String,
    pub room_id: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone)]
pub struct NewDevice {
    pub identifier: Identifier,
    pub name: String,
    pub room_id: u64,
}

#[async_trait::async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Whether a device with this identifier is already recorded.
    async fn contains(&self, identifier: &Identifier) -> Result<bool, RegistryError>;

    async fn create(&self, device: NewDevice) -> Result<DeviceRecord, RegistryError>;
}

/// Device registry kept in memory and mirrored to a JSON file.
pub struct DeviceStore {
    path: Option<PathBuf>,
    devices: Mutex<Vec<DeviceRecord>>,
}

impl DeviceStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let devices = store::load(&path).await?;
        Ok(Self {
            path: Some(path),
            devices: Mutex::new(devices),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            devices: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn find(&self, identifier: &Identifier) -> Option<DeviceRecord> {
        self.devices
            .lock()
            .await
            .iter()
            .find(|d| &d.identifier == identifier)
            .cloned()
    }

    pub async fn list_room(&self, room_id: u64) -> Vec<DeviceRecord> {
        self.devices
            .lock()
            .await
            .iter()
            .filter(|d| d.room_id == room_id)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl DeviceRegistry for DeviceStore {
    async fn contains(&self, identifier: &Identifier) -> Result<bool, RegistryError> {
        Ok(self.find(identifier).await.is_some())
    }

    async fn create(&self, device: NewDevice) -> Result<DeviceRecord, RegistryError> {
        let mut devices = self.devices.lock().await;
        if devices.iter().any(|d| d.identifier == device.identifier) {
            return Err(RegistryError::Duplicate(device.identifier));
        }

        let record = DeviceRecord {
            identifier: device.identifier,
            name: device.name,
            room_id: device.room_id,
            created_at: now(),
        };
        devices.push(record.clone());

        if let Some(path) = &self.path {
            if let Err(e) = store::save(path, &*devices).await {
                devices.pop();
                return Err(e);
            }
        }
        Ok(record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateDeviceError {
    #[error("provisioning failed: {0}")]
    Provisioning(ProvisionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Provisions the device advertising `name` and, only on success, records it
/// in `room_id`. A failed attempt persists nothing. An identifier that is
/// already recorded fails with [`ProvisionError::DeviceExists`] before any
/// credentials are sent.
pub async fn create_device<L: Link>(
    orchestrator: &Orchestrator<L>,
    devices: &dyn DeviceRegistry,
    name: &str,
    room_id: u64,
) -> Result<DeviceRecord, CreateDeviceError> {
    let identifier = orchestrator
        .provision_new(name, devices)
        .await
        .into_result()
        .map_err(CreateDeviceError::Provisioning)?;

    let record = devices
        .create(NewDevice {
            identifier,
            name: name.to_string(),
            room_id,
        })
        .await?;
    tracing::info!(identifier = %record.identifier, room_id, "device created");
    Ok(record)
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
