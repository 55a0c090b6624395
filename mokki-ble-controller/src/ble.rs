//! BLE link for provisioning Mokki sensors
//!
//! Implements [`Link`] over the host's first Bluetooth adapter using
//! btleplug. Sensors expose the Mokki GATT service with a notify
//! characteristic for the identity handshake and a write-without-response
//! characteristic for credential chunks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use futures::future::ready;
use mokki_proto::ble::{SERVICE_UUID, name_matches};
use mokki_provision::{DiscoveredPeer, Link, LinkError, LinkSession, Notifications};
use uuid::Uuid;

/// A device seen during a scan
#[derive(Debug, Clone)]
pub struct ScannedDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
    /// Advertises the Mokki provisioning service.
    pub is_mokki: bool,
}

fn adapter_error(e: btleplug::Error) -> LinkError {
    LinkError::Adapter(e.to_string())
}

/// Counts concurrent scanners so one finishing does not stop another's scan.
#[derive(Debug, Default)]
struct ScanCount(Mutex<usize>);

impl ScanCount {
    fn lock(&self) -> MutexGuard<'_, usize> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// True for the first holder.
    fn acquire(&self) -> bool {
        let mut n = self.lock();
        *n += 1;
        *n == 1
    }

    /// True when the last holder leaves.
    fn release(&self) -> bool {
        let mut n = self.lock();
        *n = n.saturating_sub(1);
        *n == 0
    }
}

/// Peripherals found by discovery, by address, until a connect takes them.
#[derive(Debug)]
struct PeerCache<P>(Mutex<HashMap<String, P>>);

impl<P> Default for PeerCache<P> {
    fn default() -> Self {
        Self(Mutex::new(HashMap::new()))
    }
}

impl<P> PeerCache<P> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, P>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn remember(&self, address: String, peer: P) {
        self.lock().insert(address, peer);
    }

    fn take(&self, address: &str) -> Option<P> {
        self.lock().remove(address)
    }
}

#[derive(Debug, Default)]
struct Shared {
    scans: ScanCount,
    peripherals: PeerCache<Peripheral>,
}

/// Disconnect bookkeeping. Only a disconnect that ran to completion counts,
/// so a session dropped mid-disconnect still cleans up.
#[derive(Debug, Default)]
struct Teardown {
    done: bool,
}

impl Teardown {
    /// Runs `disconnect` unless an earlier one completed.
    async fn run<F, T>(&mut self, disconnect: F) -> Option<T>
    where
        F: std::future::Future<Output = T>,
    {
        if self.done {
            return None;
        }
        let out = disconnect.await;
        self.done = true;
        Some(out)
    }

    fn pending(&self) -> bool {
        !self.done
    }
}

struct ScanLease {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl Drop for ScanLease {
    fn drop(&mut self) {
        if !self.shared.scans.release() {
            return;
        }
        let adapter = self.adapter.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = adapter.stop_scan().await {
                    tracing::debug!("stop_scan failed: {e}");
                }
            });
        }
    }
}

#[derive(Clone)]
pub struct BleLink {
    adapter: Adapter,
    shared: Arc<Shared>,
}

impl BleLink {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            shared: Arc::new(Shared::default()),
        }
    }

    /// Uses the first Bluetooth adapter of the host.
    pub async fn first_adapter() -> Result<Self, LinkError> {
        let manager = Manager::new().await.map_err(adapter_error)?;
        let adapters = manager.adapters().await.map_err(adapter_error)?;
        adapters
            .into_iter()
            .next()
            .map(Self::new)
            .ok_or(LinkError::NoAdapter)
    }

    /// Scans for `duration` and lists everything that advertised.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<ScannedDevice>, LinkError> {
        let _lease = self.scan_lease().await?;
        tokio::time::sleep(duration).await;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(adapter_error)? {
            if let Some(props) = peripheral.properties().await.map_err(adapter_error)? {
                devices.push(describe(peripheral.address().to_string(), &props));
            }
        }
        Ok(devices)
    }

    async fn scan_lease(&self) -> Result<ScanLease, LinkError> {
        let first = self.shared.scans.acquire();
        let lease = ScanLease {
            adapter: self.adapter.clone(),
            shared: self.shared.clone(),
        };
        if first {
            self.adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(adapter_error)?;
        }
        Ok(lease)
    }

    async fn matching(&self, peripheral: &Peripheral, wanted: &str) -> Option<DiscoveredPeer> {
        let props = peripheral.properties().await.ok().flatten()?;
        let name = props.local_name?;
        if !name_matches(&name, wanted) {
            return None;
        }

        let address = peripheral.address().to_string();
        self.shared
            .peripherals
            .remember(address.clone(), peripheral.clone());
        tracing::debug!(%address, %name, "found peer");
        Some(DiscoveredPeer { address, name })
    }

    /// Takes the peripheral out of the discovery cache, or asks the adapter.
    async fn lookup(&self, address: &str) -> Result<Option<Peripheral>, LinkError> {
        if let Some(peripheral) = self.shared.peripherals.take(address) {
            return Ok(Some(peripheral));
        }
        let peripherals = self.adapter.peripherals().await.map_err(adapter_error)?;
        Ok(peripherals
            .into_iter()
            .find(|p| p.address().to_string() == address))
    }
}

fn describe(address: String, props: &PeripheralProperties) -> ScannedDevice {
    let name = props
        .local_name
        .clone()
        .unwrap_or_else(|| "Unknown".to_string());
    ScannedDevice {
        name,
        address,
        rssi: props.rssi,
        is_mokki: props.services.contains(&Uuid::from_u128(SERVICE_UUID)),
    }
}

#[async_trait::async_trait]
impl Link for BleLink {
    type Session = BleSession;

    async fn discover(&self, name: &str) -> Result<DiscoveredPeer, LinkError> {
        // subscribe before scanning so no advertisement slips between the two
        let mut events = self.adapter.events().await.map_err(adapter_error)?;
        let _lease = self.scan_lease().await?;

        for peripheral in self.adapter.peripherals().await.map_err(adapter_error)? {
            if let Some(peer) = self.matching(&peripheral, name).await {
                return Ok(peer);
            }
        }

        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if let Some(peer) = self.matching(&peripheral, name).await {
                return Ok(peer);
            }
        }

        Err(LinkError::Adapter("adapter event stream ended".to_string()))
    }

    async fn connect(&self, peer: &DiscoveredPeer) -> Result<BleSession, LinkError> {
        let peripheral = self
            .lookup(&peer.address)
            .await?
            .ok_or_else(|| LinkError::PeerUnreachable(peer.address.clone()))?;

        peripheral
            .connect()
            .await
            .map_err(|e| LinkError::PeerUnreachable(e.to_string()))?;
        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(LinkError::PeerUnreachable(e.to_string()));
        }
        tracing::debug!(address = %peer.address, "connected");

        Ok(BleSession {
            adapter: self.adapter.clone(),
            characteristics: peripheral.characteristics().into_iter().collect(),
            peripheral,
            subscribed: false,
            teardown: Teardown::default(),
        })
    }
}

pub struct BleSession {
    adapter: Adapter,
    peripheral: Peripheral,
    characteristics: Vec<Characteristic>,
    subscribed: bool,
    teardown: Teardown,
}

impl BleSession {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic, LinkError> {
        self.characteristics
            .iter()
            .find(|c| c.uuid == uuid)
            .ok_or(LinkError::CharacteristicMissing(uuid))
    }
}

#[async_trait::async_trait]
impl LinkSession for BleSession {
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Notifications, LinkError> {
        if self.subscribed {
            return Err(LinkError::AlreadySubscribed);
        }
        let target = self.characteristic(characteristic)?.clone();
        let lost = |e: btleplug::Error| LinkError::LinkLost(e.to_string());

        // open the stream first so the first frame cannot be missed
        let notifications = self.peripheral.notifications().await.map_err(lost)?;
        let events = self.adapter.events().await.map_err(lost)?;
        self.peripheral.subscribe(&target).await.map_err(lost)?;
        self.subscribed = true;

        let id = self.peripheral.id();
        let gone = events
            .filter(move |event| {
                ready(matches!(event, CentralEvent::DeviceDisconnected(d) if *d == id))
            })
            .into_future();

        Ok(notifications
            .filter_map(move |n| ready((n.uuid == characteristic).then_some(n.value)))
            .take_until(gone)
            .boxed())
    }

    async fn write_chunk(&mut self, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError> {
        if !self.teardown.pending() {
            return Err(LinkError::LinkLost("disconnected".to_string()));
        }
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(target, bytes, WriteType::WithoutResponse)
            .await
            .map_err(|e| LinkError::WriteFailed(e.to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        match self.teardown.run(self.peripheral.disconnect()).await {
            Some(result) => result.map_err(adapter_error),
            None => Ok(()),
        }
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        if !self.teardown.pending() {
            return;
        }
        let peripheral = self.peripheral.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = peripheral.disconnect().await {
                    tracing::warn!("disconnect after cancelled attempt failed: {e}");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_stops_with_last_holder() {
        let count = ScanCount::default();
        assert!(count.acquire());
        assert!(!count.acquire());
        assert!(!count.release());
        assert!(count.release());
        // stray release does not underflow
        assert!(count.release());
        assert!(count.acquire());
    }

    #[test]
    fn connect_takes_peer_out_of_cache() {
        let cache = PeerCache::default();
        cache.remember("AA:BB:CC:DD:EE:FF".to_string(), 1);
        cache.remember("AA:BB:CC:DD:EE:FF".to_string(), 2);
        assert_eq!(cache.lock().len(), 1);

        assert_eq!(cache.take("AA:BB:CC:DD:EE:FF"), Some(2));
        assert_eq!(cache.take("AA:BB:CC:DD:EE:FF"), None);
        assert!(cache.lock().is_empty());
    }

    #[test]
    fn teardown_completes_once() {
        use futures::FutureExt;

        let mut teardown = Teardown::default();
        assert_eq!(teardown.run(ready(7)).now_or_never(), Some(Some(7)));
        assert!(!teardown.pending());
        assert_eq!(teardown.run(ready(8)).now_or_never(), Some(None));
    }

    #[test]
    fn interrupted_teardown_stays_pending() {
        use futures::FutureExt;

        let mut teardown = Teardown::default();
        // dropped before the disconnect finishes
        assert!(
            teardown
                .run(futures::future::pending::<()>())
                .now_or_never()
                .is_none()
        );
        assert!(teardown.pending());
    }

    #[test]
    fn describe_flags_mokki_service() {
        let props = PeripheralProperties {
            local_name: Some("nimble [sensor-42]".to_string()),
            rssi: Some(-60),
            services: vec![Uuid::from_u128(SERVICE_UUID)],
            ..Default::default()
        };
        let device = describe("AA:BB:CC:DD:EE:FF".to_string(), &props);
        assert!(device.is_mokki);
        assert_eq!(device.name, "nimble [sensor-42]");
        assert_eq!(device.rssi, Some(-60));

        let other = describe("11:22:33:44:55:66".to_string(), &PeripheralProperties::default());
        assert!(!other.is_mokki);
        assert_eq!(other.name, "Unknown");
    }
}
