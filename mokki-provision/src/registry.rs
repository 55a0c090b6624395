//! Credential Registry - pre-issued single-use identifiers

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::Identifier;
use crate::store::{self, RegistryError};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CredentialRecord {
    pub identifier: Identifier,
    #[serde(default)]
    pub is_used: bool,
}

#[async_trait::async_trait]
pub trait CredentialRegistry: Send + Sync {
    /// Consumes `identifier` if it exists and is unused.
    ///
    /// Lookup and marking happen as one step: of two concurrent calls with
    /// the same identifier at most one gets `Some`.
    async fn find_and_mark_used(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<CredentialRecord>, RegistryError>;
}

/// Credential registry kept in memory and mirrored to a JSON file.
pub struct CredentialStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<Identifier, CredentialRecord>>,
}

impl CredentialStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let list: Vec<CredentialRecord> = store::load(&path).await?;
        Ok(Self::from_records(Some(path), list))
    }

    pub fn in_memory() -> Self {
        Self::from_records(None, Vec::new())
    }

    fn from_records(path: Option<PathBuf>, list: Vec<CredentialRecord>) -> Self {
        let records = list
            .into_iter()
            .map(|record| (record.identifier.clone(), record))
            .collect();
        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Registers an identifier handed out of band.
    pub async fn insert(&self, identifier: Identifier) -> Result<(), RegistryError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&identifier) {
            return Err(RegistryError::Duplicate(identifier));
        }
        records.insert(
            identifier.clone(),
            CredentialRecord {
                identifier,
                is_used: false,
            },
        );
        self.persist(&records).await
    }

    /// Mints `count` fresh identifiers.
    pub async fn issue(&self, count: usize) -> Result<Vec<Identifier>, RegistryError> {
        let mut records = self.records.lock().await;
        let mut issued = Vec::with_capacity(count);
        while issued.len() < count {
            let identifier = Identifier::generate();
            if records.contains_key(&identifier) {
                continue;
            }
            records.insert(
                identifier.clone(),
                CredentialRecord {
                    identifier: identifier.clone(),
                    is_used: false,
                },
            );
            issued.push(identifier);
        }
        self.persist(&records).await?;
        tracing::info!(count, "issued identifiers");
        Ok(issued)
    }

    pub async fn get(&self, identifier: &Identifier) -> Option<CredentialRecord> {
        self.records.lock().await.get(identifier).cloned()
    }

    pub async fn list(&self) -> Vec<CredentialRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    async fn persist(
        &self,
        records: &BTreeMap<Identifier, CredentialRecord>,
    ) -> Result<(), RegistryError> {
        match &self.path {
            Some(path) => {
                let list: Vec<&CredentialRecord> = records.values().collect();
                store::save(path, &list).await
            }
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl CredentialRegistry for CredentialStore {
    async fn find_and_mark_used(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<CredentialRecord>, RegistryError> {
        let mut records = self.records.lock().await;
        let record = match records.get_mut(identifier) {
            Some(record) if !record.is_used => record,
            _ => return Ok(None),
        };
        // stays used in memory even if the write below fails
        record.is_used = true;
        let record = record.clone();
        self.persist(&records).await?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identifier_is_single_use() {
        let store = CredentialStore::in_memory();
        let id = Identifier::from("f47ac10b-58cc-4372-a567-0e02b2c3d479");
        store.insert(id.clone()).await.unwrap();

        let first = store.find_and_mark_used(&id).await.unwrap().unwrap();
        assert!(first.is_used);
        assert!(store.find_and_mark_used(&id).await.unwrap().is_none());
        assert!(store.get(&id).await.unwrap().is_used);
    }

    #[tokio::test]
    async fn unknown_identifier() {
        let store = CredentialStore::in_memory();
        assert!(
            store
                .find_and_mark_used(&Identifier::from("nope"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn duplicate_insert_rejected() {
        let store = CredentialStore::in_memory();
        store.insert(Identifier::from("a")).await.unwrap();
        assert!(matches!(
            store.insert(Identifier::from("a")).await,
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_consumers_race_once() {
        let store = std::sync::Arc::new(CredentialStore::in_memory());
        let id = Identifier::from("leaked");
        store.insert(id.clone()).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                store.find_and_mark_used(&id).await.unwrap().is_some()
            }));
        }

        let mut granted = 0;
        for task in tasks {
            if task.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn used_flag_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");

        let store = CredentialStore::open(&path).await.unwrap();
        let issued = store.issue(3).await.unwrap();
        assert_eq!(issued.len(), 3);
        store.find_and_mark_used(&issued[1]).await.unwrap().unwrap();
        drop(store);

        let reopened = CredentialStore::open(&path).await.unwrap();
        assert_eq!(reopened.list().await.len(), 3);
        assert!(reopened.get(&issued[1]).await.unwrap().is_used);
        assert!(!reopened.get(&issued[0]).await.unwrap().is_used);
        assert!(reopened.find_and_mark_used(&issued[1]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(matches!(
            CredentialStore::open(&path).await,
            Err(RegistryError::Json { .. })
        ));
    }
}
