//! In-process [`Link`] for tests: scripted advertisement and handshake,
//! recorded writes and disconnects.

use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use mokki_proto::ProvisioningPayload;
use mokki_proto::ble::{CREDENTIALS_UUID, name_matches};
use uuid::Uuid;

use crate::{DiscoveredPeer, Link, LinkError, LinkSession, Notifications};

/// What the device does once subscribed.
#[derive(Debug, Clone)]
pub enum Handshake {
    /// Sends this frame, then stays connected.
    Frame(Vec<u8>),
    /// Never sends anything.
    Silent,
    /// Drops the connection.
    Closed,
}

#[derive(Debug)]
struct Script {
    advertised: Vec<String>,
    handshake: Handshake,
    refuse_connections: bool,
    stall_connections: bool,
    stall_subscribe: bool,
    fail_write_at: Option<usize>,
}

#[derive(Debug, Default)]
struct Log {
    connects: usize,
    disconnects: usize,
    writes: Vec<(Uuid, Vec<u8>)>,
}

#[derive(Debug)]
struct Shared {
    script: Mutex<Script>,
    log: Mutex<Log>,
}

#[derive(Debug, Clone)]
pub struct FakeLink {
    shared: Arc<Shared>,
}

impl Default for FakeLink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLink {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    advertised: Vec::new(),
                    handshake: Handshake::Silent,
                    refuse_connections: false,
                    stall_connections: false,
                    stall_subscribe: false,
                    fail_write_at: None,
                }),
                log: Mutex::new(Log::default()),
            }),
        }
    }

    pub fn advertise(self, name: &str) -> Self {
        self.script().advertised.push(name.to_string());
        self
    }

    pub fn set_handshake(&self, handshake: Handshake) {
        self.script().handshake = handshake;
    }

    pub fn refuse_connections(&self) {
        self.script().refuse_connections = true;
    }

    /// `connect` never completes.
    pub fn stall_connections(&self) {
        self.script().stall_connections = true;
    }

    /// `subscribe` never completes.
    pub fn stall_subscribe(&self) {
        self.script().stall_subscribe = true;
    }

    /// Makes the write with this index (counted across the link) fail.
    pub fn fail_write_at(&self, index: usize) {
        self.script().fail_write_at = Some(index);
    }

    pub fn connects(&self) -> usize {
        self.log().connects
    }

    pub fn disconnects(&self) -> usize {
        self.log().disconnects
    }

    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.log().writes.clone()
    }

    /// What a device would have reassembled from the first complete message
    /// on the credentials characteristic.
    pub fn received_payload(&self) -> Option<ProvisioningPayload> {
        let mut reassembler = mokki_proto::Reassembler::new();
        let credentials = Uuid::from_u128(CREDENTIALS_UUID);
        for (uuid, chunk) in self.writes() {
            if uuid != credentials {
                continue;
            }
            if let Ok(Some(body)) = reassembler.push(&chunk) {
                return ProvisioningPayload::from_body(&body).ok();
            }
        }
        None
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.shared.script.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn log(&self) -> MutexGuard<'_, Log> {
        self.shared.log.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait::async_trait]
impl Link for FakeLink {
    type Session = FakeSession;

    async fn discover(&self, name: &str) -> Result<DiscoveredPeer, LinkError> {
        let found = self
            .script()
            .advertised
            .iter()
            .position(|advertised| name_matches(advertised, name));
        match found {
            Some(index) => Ok(DiscoveredPeer {
                address: format!("00:00:00:00:00:{index:02X}"),
                name: name.to_string(),
            }),
            None => futures::future::pending().await,
        }
    }

    async fn connect(&self, peer: &DiscoveredPeer) -> Result<FakeSession, LinkError> {
        let (refuse, stall) = {
            let script = self.script();
            (script.refuse_connections, script.stall_connections)
        };
        if refuse {
            return Err(LinkError::PeerUnreachable(peer.address.clone()));
        }
        if stall {
            return futures::future::pending().await;
        }
        self.log().connects += 1;
        Ok(FakeSession {
            link: self.clone(),
            subscribed: false,
            disconnected: false,
        })
    }
}

pub struct FakeSession {
    link: FakeLink,
    subscribed: bool,
    disconnected: bool,
}

impl FakeSession {
    fn release(&mut self) {
        if !self.disconnected {
            self.disconnected = true;
            self.link.log().disconnects += 1;
        }
    }
}

#[async_trait::async_trait]
impl LinkSession for FakeSession {
    async fn subscribe(&mut self, _characteristic: Uuid) -> Result<Notifications, LinkError> {
        if self.subscribed {
            return Err(LinkError::AlreadySubscribed);
        }
        self.subscribed = true;

        let (handshake, stall) = {
            let script = self.link.script();
            (script.handshake.clone(), script.stall_subscribe)
        };
        if stall {
            return futures::future::pending().await;
        }
        Ok(match handshake {
            Handshake::Frame(frame) => futures::stream::iter(vec![frame])
                .chain(futures::stream::pending())
                .boxed(),
            Handshake::Silent => futures::stream::pending().boxed(),
            Handshake::Closed => futures::stream::empty().boxed(),
        })
    }

    async fn write_chunk(&mut self, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError> {
        if self.disconnected {
            return Err(LinkError::LinkLost("disconnected".to_string()));
        }
        let fail_at = self.link.script().fail_write_at;
        let mut log = self.link.log();
        if fail_at == Some(log.writes.len()) {
            return Err(LinkError::WriteFailed("rejected by stack".to_string()));
        }
        log.writes.push((characteristic, bytes.to_vec()));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.release();
        Ok(())
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.release();
    }
}
