//! Mokki Provision
//!
//! Binds an unprovisioned sensor to an account-scoped device record and
//! hands it network and broker credentials over a short-range link.
//!
//! The flow, driven by [`Orchestrator`]:
//! 1. discover the device by its advertised name and connect ([`Link`])
//! 2. wait for one notification carrying its sealed identifier
//! 3. open it with the [`DecryptionOracle`]
//! 4. consume the identifier in the [`CredentialRegistry`]
//! 5. write the chunked [`mokki_proto::ProvisioningPayload`] back
//!
//! [`create_device`] wraps an attempt and records the device on success.

mod config;
mod device;
mod error;
mod identifier;
mod link;
mod oracle;
mod orchestrator;
mod registry;
mod state;
mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    CONFIG_FILE, CREDENTIALS_FILE, ConfigError, DEVICES_FILE, HOME_ENV, HubConfig,
    NetworkSettings, ProvisionSettings, mokki_home,
};
pub use device::{
    CreateDeviceError, DeviceRecord, DeviceRegistry, DeviceStore, NewDevice, create_device,
};
pub use error::{ProvisionError, ProvisioningResult};
pub use identifier::Identifier;
pub use link::{DiscoveredPeer, Link, LinkError, LinkSession, Notifications};
pub use oracle::{
    DecryptionOracle, KeyError, KeyHandle, MIN_FRAME_LEN, OracleError, SealedBoxOracle,
    seal_identifier,
};
pub use orchestrator::{AttemptReport, Orchestrator};
pub use registry::{CredentialRecord, CredentialRegistry, CredentialStore};
pub use state::ProvisioningState;
pub use store::RegistryError;
