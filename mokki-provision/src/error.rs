use crate::Identifier;

/// Why a provisioning attempt failed.
///
/// Deliberately coarse: callers learn which step failed, never key handles,
/// ciphertext or registry contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionError {
    #[error("device not found")]
    PeerNotFound,
    #[error("device unreachable")]
    PeerUnreachable,
    #[error("link lost")]
    LinkLost,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("handshake could not be decrypted")]
    DecryptionFailed,
    #[error("unknown or already used identifier")]
    UnknownOrUsedIdentifier,
    #[error("device already registered")]
    DeviceExists,
    #[error("credential write failed")]
    WriteFailed,
}

impl ProvisionError {
    /// Stable tag used in logs and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProvisionError::PeerNotFound => "peer_not_found",
            ProvisionError::PeerUnreachable => "peer_unreachable",
            ProvisionError::LinkLost => "link_lost",
            ProvisionError::HandshakeTimeout => "handshake_timeout",
            ProvisionError::DecryptionFailed => "decryption_failed",
            ProvisionError::UnknownOrUsedIdentifier => "unknown_or_used_identifier",
            ProvisionError::DeviceExists => "device_exists",
            ProvisionError::WriteFailed => "write_failed",
        }
    }
}

/// Terminal value of one provisioning attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningResult {
    Success { identifier: Identifier },
    Failure { reason: ProvisionError },
}

impl ProvisioningResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ProvisioningResult::Success { .. })
    }

    pub fn into_result(self) -> Result<Identifier, ProvisionError> {
        match self {
            ProvisioningResult::Success { identifier } => Ok(identifier),
            ProvisioningResult::Failure { reason } => Err(reason),
        }
    }
}

impl From<Result<Identifier, ProvisionError>> for ProvisioningResult {
    fn from(result: Result<Identifier, ProvisionError>) -> Self {
        match result {
            Ok(identifier) => ProvisioningResult::Success { identifier },
            Err(reason) => ProvisioningResult::Failure { reason },
        }
    }
}
