use std::path::Path;

use mokki_provision::{KeyError, KeyHandle, SealedBoxOracle};

/// Creates the hub key for `handle` and returns its public half, hex
/// encoded, for flashing into sensors.
pub fn create_key(home: &Path, handle: KeyHandle) -> Result<String, KeyError> {
    let oracle = SealedBoxOracle::create(home, handle)?;
    tracing::info!(%handle, "created hub key");
    Ok(public_id(&oracle))
}

#[derive(Debug, thiserror::Error)]
pub enum ReadKeyError {
    #[error("no hub key for handle {0}, run `mokki-hub create-key` first")]
    Missing(KeyHandle),
    #[error(transparent)]
    Key(KeyError),
}

pub fn read_key(home: &Path, handle: KeyHandle) -> Result<SealedBoxOracle, ReadKeyError> {
    SealedBoxOracle::load(home, handle).map_err(|e| match e {
        KeyError::NotFound(_) => ReadKeyError::Missing(handle),
        e => ReadKeyError::Key(e),
    })
}

pub fn public_id(oracle: &SealedBoxOracle) -> String {
    data_encoding::HEXLOWER.encode(&oracle.public_key())
}
