use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Connection metadata presented with a login or refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl DeviceInfo {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: Some(ip_address.into()),
            user_agent: Some(user_agent.into()),
        }
    }
}

/// Keyed device fingerprint: HMAC-SHA256(secret, ip|user_agent), hex encoded.
///
/// Keyed so that a fingerprint read from the store cannot be recomputed or
/// forged without the secret.
#[derive(Clone)]
pub struct DeviceFingerprinter {
    mac: HmacSha256,
}

impl DeviceFingerprinter {
    pub fn new(secret: &SecretString) -> Result<Self, anyhow::Error> {
        let mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
            .map_err(|e| anyhow::anyhow!("Invalid fingerprint key: {}", e))?;
        Ok(Self { mac })
    }

    pub fn fingerprint(&self, device: &DeviceInfo) -> String {
        let payload = format!(
            "{}|{}",
            device.ip_address.as_deref().unwrap_or_default(),
            device.user_agent.as_deref().unwrap_or_default().trim()
        );

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison against a stored fingerprint.
    pub fn matches(&self, device: &DeviceInfo, stored: &str) -> bool {
        let expected = self.fingerprint(device);
        if expected.len() != stored.len() {
            return false;
        }
        expected.as_bytes().ct_eq(stored.as_bytes()).into()
    }
}
