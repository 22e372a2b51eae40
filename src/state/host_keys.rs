//! Trusted host key persistence using redb
//!
//! Database: known_hosts.redb
//! Tables:
//!   - host_keys: "<user>|<host>|<port>|<key type>" -> TrustedHostKey (MessagePack)
//!   - host_keys_metadata: "version" -> u32

#![allow(clippy::result_large_err)]

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::ssh::known_hosts::TrustedHostKey;

/// Database version for migrations
pub const HOST_KEYS_DB_VERSION: u32 = 1;

const HOST_KEYS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("host_keys");

const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("host_keys_metadata");

#[derive(Debug, Error)]
pub enum HostKeyStoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rmp_serde::encode::Error> for HostKeyStoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HostKeyStoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HostKeyStoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HostKeyStoreError::Serialization(e.to_string())
    }
}

/// On-disk table of trusted host keys, all users
pub struct HostKeyDb {
    db: Arc<Database>,
}

impl HostKeyDb {
    pub fn open(path: &Path) -> Result<Self, HostKeyStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = match Database::create(path) {
            Ok(db) => {
                info!("Host key database opened at {:?}", path);
                db
            }
            Err(e) => {
                warn!("Failed to open host key database: {:?}, attempting recovery", e);

                let backup_path = path.with_extension("redb.backup");
                if let Err(e) = std::fs::rename(path, &backup_path) {
                    error!("Failed to backup corrupted host key database: {:?}", e);
                } else {
                    info!("Backed up corrupted host key database to {:?}", backup_path);
                }

                Database::create(path)?
            }
        };

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
                warn!("Failed to set host key database permissions: {}", e);
            }
        }

        let store = Self { db: Arc::new(db) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), HostKeyStoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(HOST_KEYS_TABLE)?;
            let mut meta = write_txn.open_table(METADATA_TABLE)?;
            let existing = meta
                .get("version")?
                .and_then(|v| rmp_serde::from_slice::<u32>(v.value()).ok());
            if existing.is_none() {
                let version_bytes = rmp_serde::to_vec(&HOST_KEYS_DB_VERSION)?;
                meta.insert("version", version_bytes.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn record_key(key: &TrustedHostKey) -> String {
        format!(
            "{}|{}|{}|{}",
            key.user_id, key.host, key.port, key.key_type
        )
    }

    /// Every stored key; unreadable rows are skipped
    pub fn load_all(&self) -> Result<Vec<TrustedHostKey>, HostKeyStoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HOST_KEYS_TABLE)?;

        let mut keys = Vec::new();
        for result in table.iter()? {
            let (id, value) = result?;
            match rmp_serde::from_slice::<TrustedHostKey>(value.value()) {
                Ok(key) => keys.push(key),
                Err(e) => warn!("Skipping unreadable host key {}: {}", id.value(), e),
            }
        }
        Ok(keys)
    }

    /// Insert or replace
    pub fn upsert(&self, key: &TrustedHostKey) -> Result<(), HostKeyStoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HOST_KEYS_TABLE)?;
            let bytes = rmp_serde::to_vec(key)?;
            table.insert(Self::record_key(key).as_str(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn remove(&self, keys: &[TrustedHostKey]) -> Result<usize, HostKeyStoreError> {
        let write_txn = self.db.begin_write()?;
        let mut removed = 0;
        {
            let mut table = write_txn.open_table(HOST_KEYS_TABLE)?;
            for key in keys {
                if table.remove(Self::record_key(key).as_str())?.is_some() {
                    removed += 1;
                }
            }
        }
        write_txn.commit()?;
        Ok(removed)
    }
}
