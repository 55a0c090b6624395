use std::path::Path;
use std::sync::Arc;

use mokki_provision::{
    CREDENTIALS_FILE, CreateDeviceError, CredentialStore, DEVICES_FILE, DeviceRecord, DeviceStore,
    HubConfig, Link, Orchestrator, RegistryError, create_device,
};

use crate::ReadKeyError;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Key(#[from] ReadKeyError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything a running hub needs: the orchestrator bound to a link and the
/// device registry that successful attempts land in.
pub struct Hub<L: Link> {
    orchestrator: Orchestrator<L>,
    devices: DeviceStore,
    config: HubConfig,
}

impl<L: Link> Hub<L> {
    pub fn new(orchestrator: Orchestrator<L>, devices: DeviceStore, config: HubConfig) -> Self {
        Self {
            orchestrator,
            devices,
            config,
        }
    }

    /// Loads the key and both registries from `home`.
    pub async fn open(home: &Path, config: HubConfig, link: L) -> Result<Self, OpenError> {
        let oracle = crate::read_key(home, config.provision.key_handle)?;
        let credentials = CredentialStore::open(home.join(CREDENTIALS_FILE)).await?;
        let devices = DeviceStore::open(home.join(DEVICES_FILE)).await?;

        if config.network.wifi_ssid.is_empty() {
            tracing::warn!("no wifi_ssid configured, devices will not join a network");
        }

        let orchestrator = Orchestrator::new(
            link,
            Arc::new(oracle),
            Arc::new(credentials),
            config.network.clone(),
            config.provision.clone(),
        );
        Ok(Self::new(orchestrator, devices, config))
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn devices(&self) -> &DeviceStore {
        &self.devices
    }

    pub async fn create_device(
        &self,
        name: &str,
        room_id: u64,
    ) -> Result<DeviceRecord, CreateDeviceError> {
        create_device(&self.orchestrator, &self.devices, name, room_id).await
    }
}
