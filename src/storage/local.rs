use std::{
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};

use super::{Storage, StorageError};

pub struct LocalStorage {
    connection: Arc<Mutex<rusqlite::Connection>>,
}
impl LocalStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(LocalStorage {
            connection: Arc::new(Mutex::new(Connection::open(path)?)),
        })
    }
    #[cfg(test)]
    pub fn in_memory() -> Result<Self, StorageError> {
        Ok(LocalStorage {
            connection: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }
}
#[async_trait]
impl Storage for LocalStorage {
    async fn get_server_fingerprint(&self, address: &str) -> Result<Option<String>, StorageError> {
        let conn = self.connection.lock().map_err(|_| StorageError::Poisoned)?;
        let fingerprint = conn
            .query_row(
                "select fingerprint from known_hosts where hostname = ?1",
                [address],
                |row| row.get(0),
            )
            .optional()?;
        Ok(fingerprint)
    }
    async fn store_server_fingerprint(
        &self,
        address: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError> {
        let conn = self.connection.lock().map_err(|_| StorageError::Poisoned)?;
        tracing::info!(host = address, "storing fingerprint");
        conn.execute(
            "insert or replace into known_hosts values (?1, ?2)",
            (address, fingerprint),
        )?;
        Ok(())
    }
    async fn ensure(&self) -> Result<(), StorageError> {
        let conn = self.connection.lock().map_err(|_| StorageError::Poisoned)?;
        conn.execute(r#"
            create table if not exists known_hosts(hostname varchar(255) primary key, fingerprint varchar(255) not null);
        "#, ())?;
        Ok(())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(value: rusqlite::Error) -> Self {
        let str_value = value.to_string();
        StorageError::LocalSqlite(value, str_value)
    }
}
