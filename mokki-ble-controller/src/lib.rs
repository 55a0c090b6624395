//! Mokki BLE Controller
//!
//! Bluetooth LE binding of the provisioning link for the hub.
//!
//! # Example
//!
//! ```ignore
//! use mokki_ble_controller::ble::BleLink;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = BleLink::first_adapter().await?;
//!
//!     // What is advertising nearby
//!     for device in link.scan(std::time::Duration::from_secs(5)).await? {
//!         println!("{} ({}) mokki={}", device.name, device.address, device.is_mokki);
//!     }
//!
//!     // Hand the link to an orchestrator
//!     // let orchestrator = mokki_provision::Orchestrator::new(link, ...);
//!     Ok(())
//! }
//! ```

pub mod ble;

pub use ble::{BleLink, BleSession, ScannedDevice};
