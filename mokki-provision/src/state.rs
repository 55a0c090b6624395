use crate::ProvisionError;

/// Where a provisioning attempt is.
///
/// ```text
/// Idle -> Scanning -> Connected -> AwaitingHandshake -> Decrypting
///      -> Validating -> Transmitting -> Complete
/// ```
/// with `Failed(reason)` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Idle,
    Scanning,
    Connected,
    AwaitingHandshake,
    Decrypting,
    Validating,
    Transmitting,
    Complete,
    Failed(ProvisionError),
}

impl ProvisioningState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProvisioningState::Complete | ProvisioningState::Failed(_))
    }

    pub fn can_advance_to(&self, next: &ProvisioningState) -> bool {
        use ProvisioningState::*;

        match (self, next) {
            (current, _) if current.is_terminal() => false,
            (_, Failed(_)) => true,
            (Idle, Scanning)
            | (Scanning, Connected)
            | (Connected, AwaitingHandshake)
            | (AwaitingHandshake, Decrypting)
            | (Decrypting, Validating)
            | (Validating, Transmitting)
            | (Transmitting, Complete) => true,
            _ => false,
        }
    }
}
