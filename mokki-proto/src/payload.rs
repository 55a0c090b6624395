/// Credentials delivered to a device once its identity has been validated.
///
/// Field order is the wire order of the JSON object.
#[derive(serde::Serialize, serde::Deserialize, Clone, PartialEq, Eq)]
pub struct ProvisioningPayload {
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt_broker_url: String,
    pub identifier: String,
}

impl ProvisioningPayload {
    pub fn to_chunks(&self, chunk_size: usize) -> Result<Vec<Vec<u8>>, crate::CodecError> {
        crate::chunk::encode(self, chunk_size)
    }

    pub fn from_body(body: &[u8]) -> Result<Self, crate::CodecError> {
        crate::chunk::decode(body)
    }
}

impl std::fmt::Debug for ProvisioningPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningPayload")
            .field("wifi_ssid", &self.wifi_ssid)
            .field("wifi_password", &"<redacted>")
            .field("mqtt_broker_url", &self.mqtt_broker_url)
            .field("identifier", &self.identifier)
            .finish()
    }
}
