//! Provisioning Orchestrator
//!
//! One call to [`Orchestrator::provision`] is one attempt: discover the
//! device, connect, wait for its sealed identity, open it with the oracle,
//! consume the identifier in the credential registry and only then send the
//! network and broker secrets. Any failure ends the attempt; the session is
//! disconnected on every path.

use std::sync::Arc;

use futures::StreamExt;
use mokki_proto::ProvisioningPayload;
use mokki_proto::ble::{CREDENTIALS_UUID, HANDSHAKE_UUID, MAX_HANDSHAKE_LEN};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    CredentialRegistry, DecryptionOracle, DeviceRegistry, Identifier, Link, LinkSession,
    NetworkSettings, ProvisionError, ProvisionSettings, ProvisioningResult, ProvisioningState,
};

/// Outcome of one attempt together with the states it went through.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub result: ProvisioningResult,
    pub states: Vec<ProvisioningState>,
}

pub struct Orchestrator<L> {
    link: L,
    oracle: Arc<dyn DecryptionOracle>,
    credentials: Arc<dyn CredentialRegistry>,
    network: NetworkSettings,
    settings: ProvisionSettings,
}

struct Attempt<'a> {
    device: &'a str,
    // registry the device will be recorded in, checked before secrets go out
    devices: Option<&'a dyn DeviceRegistry>,
    state: ProvisioningState,
    states: Vec<ProvisioningState>,
}

impl<'a> Attempt<'a> {
    fn new(device: &'a str, devices: Option<&'a dyn DeviceRegistry>) -> Self {
        Self {
            device,
            devices,
            state: ProvisioningState::Idle,
            states: vec![ProvisioningState::Idle],
        }
    }

    fn advance(&mut self, next: ProvisioningState) {
        debug_assert!(
            self.state.can_advance_to(&next),
            "illegal transition {:?} -> {next:?}",
            self.state
        );
        debug!(device = self.device, from = ?self.state, to = ?next, "transition");
        self.state = next;
        self.states.push(next);
    }
}

impl<L: Link> Orchestrator<L> {
    pub fn new(
        link: L,
        oracle: Arc<dyn DecryptionOracle>,
        credentials: Arc<dyn CredentialRegistry>,
        network: NetworkSettings,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            link,
            oracle,
            credentials,
            network,
            settings,
        }
    }

    pub fn settings(&self) -> &ProvisionSettings {
        &self.settings
    }

    /// Provisions the device advertising `device_name`.
    pub async fn provision(&self, device_name: &str) -> ProvisioningResult {
        self.attempt(device_name).await.result
    }

    pub async fn attempt(&self, device_name: &str) -> AttemptReport {
        self.run_attempt(Attempt::new(device_name, None)).await
    }

    /// Like [`Orchestrator::provision`], but refuses a device whose
    /// identifier already has a record in `devices`. The check happens
    /// before the identifier is consumed and before anything is written.
    pub async fn provision_new(
        &self,
        device_name: &str,
        devices: &dyn DeviceRegistry,
    ) -> ProvisioningResult {
        self.run_attempt(Attempt::new(device_name, Some(devices)))
            .await
            .result
    }

    async fn run_attempt(&self, mut attempt: Attempt<'_>) -> AttemptReport {
        let device_name = attempt.device;
        attempt.advance(ProvisioningState::Scanning);

        let outcome = self.run(&mut attempt).await;
        match &outcome {
            Ok(identifier) => {
                attempt.advance(ProvisioningState::Complete);
                info!(device = device_name, %identifier, "device provisioned");
            }
            Err(reason) => {
                attempt.advance(ProvisioningState::Failed(*reason));
                warn!(device = device_name, reason = reason.as_str(), "provisioning failed");
            }
        }

        AttemptReport {
            result: outcome.into(),
            states: attempt.states,
        }
    }

    async fn run(&self, attempt: &mut Attempt<'_>) -> Result<Identifier, ProvisionError> {
        let peer = match timeout(
            self.settings.discovery_timeout(),
            self.link.discover(attempt.device),
        )
        .await
        {
            Ok(Ok(peer)) => peer,
            Ok(Err(e)) => {
                warn!(device = attempt.device, error = %e, "discovery failed");
                return Err(ProvisionError::PeerNotFound);
            }
            Err(_) => return Err(ProvisionError::PeerNotFound),
        };

        let mut session = match timeout(
            self.settings.discovery_timeout(),
            self.link.connect(&peer),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(device = attempt.device, address = %peer.address, error = %e, "connect failed");
                return Err(ProvisionError::PeerUnreachable);
            }
            Err(_) => {
                warn!(device = attempt.device, address = %peer.address, "connect timed out");
                return Err(ProvisionError::PeerUnreachable);
            }
        };
        attempt.advance(ProvisioningState::Connected);

        let outcome = self.exchange(attempt, &mut session).await;
        // a hung disconnect is left to the session's drop
        match timeout(self.settings.handshake_timeout(), session.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(device = attempt.device, error = %e, "disconnect failed"),
            Err(_) => warn!(device = attempt.device, "disconnect timed out"),
        }
        outcome
    }

    async fn exchange(
        &self,
        attempt: &mut Attempt<'_>,
        session: &mut L::Session,
    ) -> Result<Identifier, ProvisionError> {
        // one deadline covers enabling notifications and the first frame
        let deadline = tokio::time::Instant::now() + self.settings.handshake_timeout();

        let subscribed = tokio::time::timeout_at(
            deadline,
            session.subscribe(Uuid::from_u128(HANDSHAKE_UUID)),
        )
        .await;
        let mut notifications = match subscribed {
            Ok(Ok(notifications)) => notifications,
            Ok(Err(e)) => {
                warn!(device = attempt.device, error = %e, "subscribe failed");
                return Err(ProvisionError::LinkLost);
            }
            Err(_) => {
                warn!(device = attempt.device, "subscribe timed out");
                return Err(ProvisionError::HandshakeTimeout);
            }
        };
        attempt.advance(ProvisioningState::AwaitingHandshake);

        let frame = match tokio::time::timeout_at(deadline, notifications.next()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Err(ProvisionError::LinkLost),
            Err(_) => return Err(ProvisionError::HandshakeTimeout),
        };
        drop(notifications);
        attempt.advance(ProvisioningState::Decrypting);

        if frame.len() > MAX_HANDSHAKE_LEN {
            return Err(ProvisionError::DecryptionFailed);
        }
        let identifier = self
            .oracle
            .decrypt(&frame)
            .map_err(|_| ProvisionError::DecryptionFailed)?;
        attempt.advance(ProvisioningState::Validating);

        if let Some(devices) = attempt.devices {
            match devices.contains(&identifier).await {
                Ok(false) => {}
                Ok(true) => return Err(ProvisionError::DeviceExists),
                Err(e) => {
                    error!(device = attempt.device, error = %e, "device registry unavailable");
                    return Err(ProvisionError::UnknownOrUsedIdentifier);
                }
            }
        }

        match self.credentials.find_and_mark_used(&identifier).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(ProvisionError::UnknownOrUsedIdentifier),
            Err(e) => {
                // fail closed, a registry we cannot read authorizes nothing
                error!(device = attempt.device, error = %e, "credential registry unavailable");
                return Err(ProvisionError::UnknownOrUsedIdentifier);
            }
        }
        attempt.advance(ProvisioningState::Transmitting);

        self.transmit(attempt, session, &identifier).await?;
        Ok(identifier)
    }

    async fn transmit(
        &self,
        attempt: &Attempt<'_>,
        session: &mut L::Session,
        identifier: &Identifier,
    ) -> Result<(), ProvisionError> {
        let payload = ProvisioningPayload {
            wifi_ssid: self.network.wifi_ssid.clone(),
            wifi_password: self.network.wifi_password.clone(),
            mqtt_broker_url: self.network.mqtt_broker_url.clone(),
            identifier: identifier.to_string(),
        };
        let chunks = payload.to_chunks(self.settings.chunk_size).map_err(|e| {
            error!(device = attempt.device, error = %e, "failed to encode payload");
            ProvisionError::WriteFailed
        })?;

        let characteristic = Uuid::from_u128(CREDENTIALS_UUID);
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            session
                .write_chunk(characteristic, chunk)
                .await
                .map_err(|e| {
                    warn!(device = attempt.device, index, total, error = %e, "chunk write failed");
                    ProvisionError::WriteFailed
                })?;
        }
        debug!(device = attempt.device, chunks = total, "credentials written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::testing::{FakeLink, Handshake};
    use crate::{
        CredentialStore, DeviceStore, KeyHandle, NewDevice, SealedBoxOracle, seal_identifier,
    };

    const ID: &str = "f47ac10b-58cc-4372-a567-0e02b2c3d479";

    fn network() -> NetworkSettings {
        NetworkSettings {
            wifi_ssid: "home".to_string(),
            wifi_password: "secret".to_string(),
            mqtt_broker_url: "mqtt://broker:8883".to_string(),
        }
    }

    struct Fixture {
        link: FakeLink,
        oracle: Arc<SealedBoxOracle>,
        credentials: Arc<CredentialStore>,
    }

    impl Fixture {
        async fn new() -> Self {
            let credentials = Arc::new(CredentialStore::in_memory());
            credentials.insert(Identifier::from(ID)).await.unwrap();
            Self {
                link: FakeLink::new().advertise("sensor-42"),
                oracle: Arc::new(SealedBoxOracle::generate(KeyHandle::DEFAULT)),
                credentials,
            }
        }

        fn sealed(&self, identifier: &str) -> Vec<u8> {
            seal_identifier(&self.oracle.public_key(), identifier).unwrap()
        }

        fn orchestrator(&self) -> Orchestrator<FakeLink> {
            Orchestrator::new(
                self.link.clone(),
                self.oracle.clone(),
                self.credentials.clone(),
                network(),
                ProvisionSettings::default(),
            )
        }
    }

    #[tokio::test]
    async fn provisions_known_device() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));

        let report = fx.orchestrator().attempt("sensor-42").await;
        assert_eq!(
            report.result,
            ProvisioningResult::Success {
                identifier: Identifier::from(ID)
            }
        );
        assert_eq!(
            report.states,
            vec![
                ProvisioningState::Idle,
                ProvisioningState::Scanning,
                ProvisioningState::Connected,
                ProvisioningState::AwaitingHandshake,
                ProvisioningState::Decrypting,
                ProvisioningState::Validating,
                ProvisioningState::Transmitting,
                ProvisioningState::Complete,
            ]
        );

        let payload = fx.link.received_payload().unwrap();
        assert_eq!(payload.wifi_ssid, "home");
        assert_eq!(payload.wifi_password, "secret");
        assert_eq!(payload.mqtt_broker_url, "mqtt://broker:8883");
        assert_eq!(payload.identifier, ID);

        let writes = fx.link.writes();
        assert!(writes.iter().all(|(uuid, chunk)| {
            *uuid == Uuid::from_u128(CREDENTIALS_UUID) && chunk.len() <= 20
        }));
        assert_eq!(fx.link.disconnects(), 1);
        assert!(fx.credentials.get(&Identifier::from(ID)).await.unwrap().is_used);
    }

    #[tokio::test]
    async fn unknown_identifier_sends_nothing() {
        let fx = Fixture::new().await;
        fx.link
            .set_handshake(Handshake::Frame(fx.sealed("00000000-0000-4000-8000-000000000000")));

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(
            result,
            ProvisioningResult::Failure {
                reason: ProvisionError::UnknownOrUsedIdentifier
            }
        );
        assert!(fx.link.writes().is_empty());
        assert_eq!(fx.link.disconnects(), 1);
    }

    #[tokio::test]
    async fn replayed_identifier_rejected() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));
        let orchestrator = fx.orchestrator();

        assert!(orchestrator.provision("sensor-42").await.is_success());
        let sent = fx.link.writes().len();

        let second = orchestrator.attempt("sensor-42").await;
        assert_eq!(
            second.result,
            ProvisioningResult::Failure {
                reason: ProvisionError::UnknownOrUsedIdentifier
            }
        );
        assert_eq!(
            second.states.last(),
            Some(&ProvisioningState::Failed(
                ProvisionError::UnknownOrUsedIdentifier
            ))
        );
        assert_eq!(fx.link.writes().len(), sent);
        assert_eq!(fx.link.disconnects(), 2);
    }

    #[tokio::test]
    async fn concurrent_replay_grants_once() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));
        let orchestrator = fx.orchestrator();

        let (a, b) = tokio::join!(
            orchestrator.provision("sensor-42"),
            orchestrator.provision("sensor-42")
        );
        assert_eq!(
            [a.is_success(), b.is_success()]
                .iter()
                .filter(|ok| **ok)
                .count(),
            1
        );
        assert_eq!(fx.link.disconnects(), 2);
    }

    #[tokio::test]
    async fn garbage_handshake_fails_decryption() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(vec![0xAB; 64]));

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(
            result.into_result(),
            Err(ProvisionError::DecryptionFailed)
        );
        assert!(fx.link.writes().is_empty());
        assert_eq!(fx.link.disconnects(), 1);
        assert!(!fx.credentials.get(&Identifier::from(ID)).await.unwrap().is_used);
    }

    #[tokio::test]
    async fn oversized_handshake_fails_decryption() {
        let fx = Fixture::new().await;
        fx.link
            .set_handshake(Handshake::Frame(vec![0xAB; MAX_HANDSHAKE_LEN + 1]));

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(
            result.into_result(),
            Err(ProvisionError::DecryptionFailed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_device_times_out() {
        let fx = Fixture::new().await;

        let report = fx.orchestrator().attempt("sensor-7").await;
        assert_eq!(
            report.result.into_result(),
            Err(ProvisionError::PeerNotFound)
        );
        assert_eq!(
            report.states,
            vec![
                ProvisioningState::Idle,
                ProvisioningState::Scanning,
                ProvisioningState::Failed(ProvisionError::PeerNotFound),
            ]
        );
        assert_eq!(fx.link.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_and_disconnects() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Silent);

        let started = tokio::time::Instant::now();
        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(
            result.into_result(),
            Err(ProvisionError::HandshakeTimeout)
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(fx.link.writes().is_empty());
        assert_eq!(fx.link.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_connect_times_out() {
        let fx = Fixture::new().await;
        fx.link.stall_connections();

        let started = tokio::time::Instant::now();
        let report = tokio::time::timeout(
            Duration::from_secs(3600),
            fx.orchestrator().attempt("sensor-42"),
        )
        .await
        .expect("attempt must end on its own");
        assert_eq!(
            report.states,
            vec![
                ProvisioningState::Idle,
                ProvisioningState::Scanning,
                ProvisioningState::Failed(ProvisionError::PeerUnreachable),
            ]
        );
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(fx.link.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_subscribe_times_out_and_disconnects() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));
        fx.link.stall_subscribe();

        let result = tokio::time::timeout(
            Duration::from_secs(3600),
            fx.orchestrator().provision("sensor-42"),
        )
        .await
        .expect("attempt must end on its own");
        assert_eq!(
            result.into_result(),
            Err(ProvisionError::HandshakeTimeout)
        );
        assert_eq!(fx.link.connects(), 1);
        assert_eq!(fx.link.disconnects(), 1);
        assert!(!fx.credentials.get(&Identifier::from(ID)).await.unwrap().is_used);
    }

    #[tokio::test]
    async fn recorded_device_gets_no_secrets() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));
        let devices = DeviceStore::in_memory();
        devices
            .create(NewDevice {
                identifier: Identifier::from(ID),
                name: "old".to_string(),
                room_id: 1,
            })
            .await
            .unwrap();

        let result = fx.orchestrator().provision_new("sensor-42", &devices).await;
        assert_eq!(result.into_result(), Err(ProvisionError::DeviceExists));
        assert!(fx.link.writes().is_empty());
        assert_eq!(fx.link.disconnects(), 1);
        // the label is still good for the device it belongs to
        assert!(!fx.credentials.get(&Identifier::from(ID)).await.unwrap().is_used);
    }

    #[tokio::test]
    async fn link_closed_before_handshake() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Closed);

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(result.into_result(), Err(ProvisionError::LinkLost));
        assert_eq!(fx.link.disconnects(), 1);
    }

    #[tokio::test]
    async fn refused_connection() {
        let fx = Fixture::new().await;
        fx.link.refuse_connections();

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(
            result.into_result(),
            Err(ProvisionError::PeerUnreachable)
        );
        assert_eq!(fx.link.disconnects(), 0);
    }

    #[tokio::test]
    async fn write_failure_abandons_remaining_chunks() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));
        fx.link.fail_write_at(2);

        let result = fx.orchestrator().provision("sensor-42").await;
        assert_eq!(result.into_result(), Err(ProvisionError::WriteFailed));
        // chunks 0 and 1 went out, nothing after the failed one
        assert_eq!(fx.link.writes().len(), 2);
        assert!(fx.link.received_payload().is_none());
        assert_eq!(fx.link.disconnects(), 1);
    }

    #[tokio::test]
    async fn chunks_written_in_order() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Frame(fx.sealed(ID)));

        assert!(fx.orchestrator().provision("sensor-42").await.is_success());

        let writes = fx.link.writes();
        let expected = ProvisioningPayload {
            wifi_ssid: "home".to_string(),
            wifi_password: "secret".to_string(),
            mqtt_broker_url: "mqtt://broker:8883".to_string(),
            identifier: ID.to_string(),
        }
        .to_chunks(20)
        .unwrap();
        let written: Vec<Vec<u8>> = writes.into_iter().map(|(_, chunk)| chunk).collect();
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn cancelled_attempt_still_releases_session() {
        let fx = Fixture::new().await;
        fx.link.set_handshake(Handshake::Silent);
        let orchestrator = fx.orchestrator();

        let attempt = orchestrator.provision("sensor-42");
        let cancelled = tokio::time::timeout(Duration::from_millis(50), attempt).await;
        assert!(cancelled.is_err());
        assert_eq!(fx.link.connects(), 1);
        assert_eq!(fx.link.disconnects(), 1);
    }
}
