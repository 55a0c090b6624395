//! Decryption Oracle
//!
//! The device seals its identifier to the hub's public key; only the holder
//! of the private key behind the persistent handle can open it. Every
//! failure is reported as the same [`OracleError::DecryptionFailed`] so a
//! peer probing the handshake learns nothing about why a frame was refused.

use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::Identifier;

const HKDF_INFO: &[u8] = b"mokki-handshake-v1";
const PUBLIC_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Smallest possible sealed frame: a one byte identifier.
pub const MIN_FRAME_LEN: usize = PUBLIC_LEN + NONCE_LEN + 1 + TAG_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OracleError {
    #[error("decryption failed")]
    DecryptionFailed,
}

pub trait DecryptionOracle: Send + Sync {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Identifier, OracleError>;
}

/// Persistent key handle, printed and parsed as `0x` + 8 hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyHandle(u32);

impl KeyHandle {
    /// First persistent handle in the owner hierarchy.
    pub const DEFAULT: KeyHandle = KeyHandle(0x8101_0001);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl Default for KeyHandle {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl std::fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl std::str::FromStr for KeyHandle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        u32::from_str_radix(digits, 16)
            .map(KeyHandle)
            .map_err(|e| format!("invalid key handle {s:?}: {e}"))
    }
}

impl TryFrom<String> for KeyHandle {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeyHandle> for String {
    fn from(handle: KeyHandle) -> Self {
        handle.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("key file not found: {0}")]
    NotFound(PathBuf),
    #[error("key file already exists: {0}")]
    AlreadyExists(PathBuf),
    #[error("failed to access key file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid key file: {0}")]
    Parse(String),
}

/// Software binding of the persistent key handle: an X25519 static secret
/// stored under `$MOKKI_HOME/keys/`.
///
/// Frame layout: `ephemeral public (32) || nonce (12) || ChaCha20-Poly1305
/// ciphertext with tag`, key derived with HKDF-SHA256 over the shared
/// secret, salted with both public keys.
pub struct SealedBoxOracle {
    handle: KeyHandle,
    secret: StaticSecret,
    public: PublicKey,
}

impl SealedBoxOracle {
    pub fn generate(handle: KeyHandle) -> Self {
        Self::from_secret(handle, StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret_bytes(handle: KeyHandle, bytes: [u8; 32]) -> Self {
        Self::from_secret(handle, StaticSecret::from(bytes))
    }

    fn from_secret(handle: KeyHandle, secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            handle,
            secret,
            public,
        }
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// The key devices seal their identifier to.
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    pub fn key_path(home: &Path, handle: KeyHandle) -> PathBuf {
        home.join("keys").join(format!("{:08x}.key", handle.raw()))
    }

    /// Generates a key for `handle` and writes it. Refuses to overwrite.
    pub fn create(home: &Path, handle: KeyHandle) -> Result<Self, KeyError> {
        let path = Self::key_path(home, handle);
        if path.exists() {
            return Err(KeyError::AlreadyExists(path));
        }
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let oracle = Self::generate(handle);
        let encoded = data_encoding::HEXLOWER.encode(oracle.secret.as_bytes());
        write_private(&path, encoded.as_bytes())?;
        Ok(oracle)
    }

    pub fn load(home: &Path, handle: KeyHandle) -> Result<Self, KeyError> {
        let path = Self::key_path(home, handle);
        if !path.exists() {
            return Err(KeyError::NotFound(path));
        }

        let content = std::fs::read_to_string(&path)?;
        let bytes = data_encoding::HEXLOWER
            .decode(content.trim().as_bytes())
            .map_err(|e| KeyError::Parse(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KeyError::Parse("expected 32 bytes".to_string()))?;

        Ok(Self::from_secret_bytes(handle, bytes))
    }

    fn open(&self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.len() < MIN_FRAME_LEN {
            return None;
        }
        let (ephemeral, rest) = frame.split_at(PUBLIC_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let ephemeral: [u8; PUBLIC_LEN] = ephemeral.try_into().ok()?;
        let ephemeral = PublicKey::from(ephemeral);
        let shared = self.secret.diffie_hellman(&ephemeral);
        if !shared.was_contributory() {
            return None;
        }

        let key = derive_key(shared.as_bytes(), ephemeral.as_bytes(), self.public.as_bytes())?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher.decrypt(Nonce::from_slice(nonce), sealed).ok()
    }
}

impl DecryptionOracle for SealedBoxOracle {
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Identifier, OracleError> {
        let plaintext = self.open(ciphertext).ok_or(OracleError::DecryptionFailed)?;
        let identifier = String::from_utf8(plaintext).map_err(|_| OracleError::DecryptionFailed)?;
        if identifier.is_empty() {
            return Err(OracleError::DecryptionFailed);
        }
        Ok(Identifier::from(identifier))
    }
}

impl std::fmt::Debug for SealedBoxOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBoxOracle")
            .field("handle", &self.handle)
            .field("public", &data_encoding::HEXLOWER.encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

/// Device side of the handshake: seals `identifier` to `recipient`.
pub fn seal_identifier(
    recipient: &[u8; 32],
    identifier: &str,
) -> Result<Vec<u8>, chacha20poly1305::Error> {
    let recipient = PublicKey::from(*recipient);
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&recipient);

    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())
        .ok_or(chacha20poly1305::Error)?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let sealed = cipher.encrypt(Nonce::from_slice(&nonce), identifier.as_bytes())?;

    let mut frame = Vec::with_capacity(PUBLIC_LEN + NONCE_LEN + sealed.len());
    frame.extend_from_slice(ephemeral_public.as_bytes());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&sealed);
    Ok(frame)
}

fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> Option<[u8; 32]> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(ephemeral);
    salt[32..].copy_from_slice(recipient);

    let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);
    let mut okm = [0u8; 32];
    hk.expand(HKDF_INFO, &mut okm).ok()?;
    Some(okm)
}

fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sealed_identifier_opens() {
        let oracle = SealedBoxOracle::generate(KeyHandle::DEFAULT);
        let frame = seal_identifier(&oracle.public_key(), "f47ac10b-58cc-4372-a567-0e02b2c3d479")
            .unwrap();
        assert_eq!(
            oracle.decrypt(&frame).unwrap(),
            Identifier::from("f47ac10b-58cc-4372-a567-0e02b2c3d479")
        );
    }

    #[test]
    fn wrong_key_fails() {
        let oracle = SealedBoxOracle::generate(KeyHandle::DEFAULT);
        let other = SealedBoxOracle::generate(KeyHandle::DEFAULT);
        let frame = seal_identifier(&other.public_key(), "abc").unwrap();
        assert_eq!(oracle.decrypt(&frame), Err(OracleError::DecryptionFailed));
    }

    #[test]
    fn tampering_and_truncation_collapse_to_one_error() {
        let oracle = SealedBoxOracle::generate(KeyHandle::DEFAULT);
        let frame = seal_identifier(&oracle.public_key(), "abc").unwrap();

        let mut flipped = frame.clone();
        let last = flipped.len() - 1;
        flipped[last] ^= 0x01;

        for bad in [&flipped[..], &frame[..MIN_FRAME_LEN - 1], &[][..], &[0u8; 80][..]] {
            assert_eq!(oracle.decrypt(bad), Err(OracleError::DecryptionFailed));
        }
    }

    #[test]
    fn empty_identifier_rejected() {
        let oracle = SealedBoxOracle::generate(KeyHandle::DEFAULT);
        let frame = seal_identifier(&oracle.public_key(), "").unwrap();
        assert_eq!(oracle.decrypt(&frame), Err(OracleError::DecryptionFailed));
    }

    #[test]
    fn key_file_round_trip() {
        let home = tempfile::tempdir().unwrap();
        let handle = KeyHandle::new(0x8101_0002);

        let created = SealedBoxOracle::create(home.path(), handle).unwrap();
        assert!(home.path().join("keys/81010002.key").exists());
        assert!(matches!(
            SealedBoxOracle::create(home.path(), handle),
            Err(KeyError::AlreadyExists(_))
        ));

        let loaded = SealedBoxOracle::load(home.path(), handle).unwrap();
        assert_eq!(loaded.public_key(), created.public_key());

        let frame = seal_identifier(&created.public_key(), "abc").unwrap();
        assert_eq!(loaded.decrypt(&frame).unwrap(), Identifier::from("abc"));
    }

    #[test]
    fn missing_key_file() {
        let home = tempfile::tempdir().unwrap();
        assert!(matches!(
            SealedBoxOracle::load(home.path(), KeyHandle::DEFAULT),
            Err(KeyError::NotFound(_))
        ));
    }

    #[test]
    fn debug_does_not_print_secret() {
        let oracle = SealedBoxOracle::from_secret_bytes(KeyHandle::DEFAULT, [7u8; 32]);
        let rendered = format!("{oracle:?}");
        assert!(!rendered.contains(&data_encoding::HEXLOWER.encode(&[7u8; 32])));
    }

    #[test]
    fn key_handle_text_form() {
        assert_eq!(KeyHandle::DEFAULT.to_string(), "0x81010001");
        assert_eq!("0x81010001".parse::<KeyHandle>().unwrap(), KeyHandle::DEFAULT);
        assert_eq!("81010001".parse::<KeyHandle>().unwrap(), KeyHandle::DEFAULT);
        assert!("handle".parse::<KeyHandle>().is_err());
    }
}
