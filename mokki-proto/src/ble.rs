//! BLE GATT Service Protocol Constants for Mokki Device Provisioning
//!
//! An unprovisioned device advertises its name and exposes one service with
//! two characteristics: the device pushes its encrypted identity through the
//! handshake characteristic, the hub writes the credential payload into the
//! credentials characteristic.

/// BLE Service UUID: 6d6f6b6b-6900-4000-8000-000000000000
pub const SERVICE_UUID: u128 = 0x6d6f6b6b_6900_4000_8000_000000000000;

/// Handshake Characteristic UUID (notify)
///
/// Carries exactly one notification per attempt: the sealed device
/// identifier, raw bytes, no framing.
pub const HANDSHAKE_UUID: u128 = 0x6d6f6b6b_6900_4000_8000_000000000001;

/// Credentials Characteristic UUID (write without response)
///
/// Receives the chunked credential payload, see [`crate::chunk`].
pub const CREDENTIALS_UUID: u128 = 0x6d6f6b6b_6900_4000_8000_000000000002;

/// Conservative ATT payload size for a default (23 byte) MTU.
pub const DEFAULT_CHUNK_SIZE: usize = 20;

/// Upper bound for a handshake notification, anything larger is not a
/// sealed identifier.
pub const MAX_HANDSHAKE_LEN: usize = 512;

/// Matches an advertised local name against the name a device was
/// registered with.
///
/// Some stacks decorate the name (`"nimble [sensor-42]"`), the bracketed
/// form is accepted as well.
pub fn name_matches(advertised: &str, wanted: &str) -> bool {
    if advertised == wanted {
        return true;
    }
    match (advertised.rfind('['), advertised.strip_suffix(']')) {
        (Some(open), Some(inner)) => &inner[open + 1..] == wanted,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::name_matches;

    #[test]
    fn exact_and_bracketed_names() {
        assert!(name_matches("sensor-42", "sensor-42"));
        assert!(name_matches("nimble [sensor-42]", "sensor-42"));
        assert!(!name_matches("sensor-420", "sensor-42"));
        assert!(!name_matches("nimble [sensor-4]", "sensor-42"));
        assert!(!name_matches("[sensor-42", "sensor-42"));
    }
}
