//! JSON file persistence shared by the registries

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::Identifier;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("identifier {0} already exists")]
    Duplicate(Identifier),
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid registry file {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads `path`, a missing file is an empty registry.
pub(crate) async fn load<T: DeserializeOwned + Default>(path: &Path) -> Result<T, RegistryError> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
        Err(source) => {
            return Err(RegistryError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&bytes).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Replaces `path` with `value`: written to a sibling temp file first, then
/// renamed over, so readers never see a half written registry.
pub(crate) async fn save<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    };

    let json = serde_json::to_vec_pretty(value).map_err(|source| RegistryError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(io_err)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, path).await.map_err(io_err)
}
