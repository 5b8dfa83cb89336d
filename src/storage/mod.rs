use std::sync::Arc;

use async_trait::async_trait;
use local::LocalStorage;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::config::StorageConfig;
pub(crate) mod local;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sqlite returned an error: {1}")]
    LocalSqlite(rusqlite::Error, String),
    #[error("cannot create storage directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage lock poisoned")]
    Poisoned,
}

/// Known relay fingerprints, keyed by `host:port`.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Storage: Send + Sync {
    async fn get_server_fingerprint(&self, address: &str) -> Result<Option<String>, StorageError>;
    async fn store_server_fingerprint(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError>;
    async fn ensure(&self) -> Result<(), StorageError>;
}

pub async fn get_storage(storage_config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    let storage = LocalStorage::open(&storage_config.path)?;
    storage.ensure().await?;
    Ok(Arc::new(storage))
}
