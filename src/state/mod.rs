//! State persistence using redb + MessagePack (rmp-serde)
//! Holds the trusted host keys consulted during SSH connection setup

pub mod host_keys;

pub use host_keys::{HostKeyDb, HostKeyStoreError, HOST_KEYS_DB_VERSION};
