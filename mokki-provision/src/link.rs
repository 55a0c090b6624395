//! Link Session contract
//!
//! A [`Link`] finds an advertising device and opens one connection to it.
//! The returned [`LinkSession`] owns that connection for the duration of a
//! single provisioning attempt. Implementations must make
//! [`LinkSession::disconnect`] idempotent and must release the connection
//! when a session is dropped without being disconnected (the attempt was
//! cancelled).

use std::pin::Pin;

use futures::Stream;
use uuid::Uuid;

/// Notification frames of one subscribed characteristic, in arrival order.
///
/// The stream ends when the connection goes away.
pub type Notifications = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no bluetooth adapter found")]
    NoAdapter,
    #[error("peer not found")]
    PeerNotFound,
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),
    #[error("characteristic {0} not found")]
    CharacteristicMissing(Uuid),
    #[error("already subscribed to a characteristic")]
    AlreadySubscribed,
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("bluetooth error: {0}")]
    Adapter(String),
}

#[async_trait::async_trait]
pub trait Link: Send + Sync {
    type Session: LinkSession;

    /// Waits until a device advertising `name` shows up.
    ///
    /// Does not time out on its own, callers bound it.
    async fn discover(&self, name: &str) -> Result<DiscoveredPeer, LinkError>;

    async fn connect(&self, peer: &DiscoveredPeer) -> Result<Self::Session, LinkError>;
}

#[async_trait::async_trait]
pub trait LinkSession: Send {
    /// Enables notifications on `characteristic`. At most one subscription
    /// per session.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Notifications, LinkError>;

    /// Write without response: returns once the local stack accepted the
    /// bytes. Order of calls is the only delivery guarantee.
    async fn write_chunk(&mut self, characteristic: Uuid, bytes: &[u8]) -> Result<(), LinkError>;

    /// Tears the connection down. Calling it again is a no-op.
    async fn disconnect(&mut self) -> Result<(), LinkError>;
}
