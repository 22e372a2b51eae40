//! Configuration Management Module
//!
//! Broker settings (token, metadata store, SSH and database sessions)
//! persisted as a single JSON file.

pub mod storage;
pub mod types;

pub use storage::{config_dir, config_file, validate, ConfigStorage, StorageError};
pub use types::{
    BrokerConfig, DbSettings, HostKeyPolicy, PoolConfig, SshSettings, StoreBackend, StoreConfig,
    TokenConfig, CONFIG_VERSION, TOKEN_SECRET_ENV,
};
