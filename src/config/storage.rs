//! Configuration Storage
//!
//! Handles reading/writing the broker config file.
//! Default location: `<config dir>/session-broker/broker.json`,
//! falling back to `~/.session-broker/broker.json`.

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{BrokerConfig, CONFIG_VERSION};
use crate::session::MIN_SECRET_LEN;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Directory holding the broker's config and local state
pub fn config_dir() -> Result<PathBuf, StorageError> {
    if let Some(dir) = dirs::config_dir() {
        return Ok(dir.join("session-broker"));
    }
    dirs::home_dir()
        .map(|home| home.join(".session-broker"))
        .ok_or(StorageError::NoConfigDir)
}

/// Default config file path
pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("broker.json"))
}

/// Configuration storage manager
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at the default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    /// Storage at a custom path (`--config`, tests)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Load configuration from disk.
    ///
    /// A missing file yields defaults. A corrupted file is backed up and
    /// defaults are used.
    pub async fn load(&self) -> Result<BrokerConfig, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str::<BrokerConfig>(&contents) {
                Ok(config) => {
                    if config.version > CONFIG_VERSION {
                        return Err(StorageError::VersionTooNew {
                            found: config.version,
                            supported: CONFIG_VERSION,
                        });
                    }
                    Ok(config)
                }
                Err(e) => {
                    tracing::warn!("Config file corrupted: {}", e);

                    match self.backup().await {
                        Ok(backup_path) => {
                            tracing::warn!(
                                "Corrupted config backed up to {:?}, using defaults",
                                backup_path
                            );
                        }
                        Err(backup_err) => {
                            tracing::error!("Failed to backup corrupted config: {}", backup_err);
                        }
                    }

                    Ok(BrokerConfig::default())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {:?}, using defaults", self.path);
                Ok(BrokerConfig::default())
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save configuration to disk (temp file + rename)
    pub async fn save(&self, config: &BrokerConfig) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        Ok(())
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Copy the current file aside with a timestamp suffix
    async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

/// Reject configs the broker cannot run with
pub fn validate(config: &BrokerConfig) -> Result<(), StorageError> {
    match config.token.resolve_secret() {
        None => {
            return Err(StorageError::Invalid(
                "token secret is not configured".to_string(),
            ))
        }
        Some(secret) if secret.len() < MIN_SECRET_LEN => {
            return Err(StorageError::Invalid(format!(
                "token secret must be at least {} bytes",
                MIN_SECRET_LEN
            )))
        }
        Some(_) => {}
    }
    // JWT expiry has one-second resolution
    if config.token.expiration_ms < 1000 {
        return Err(StorageError::Invalid(
            "token.expiration_ms must be at least 1000".to_string(),
        ));
    }
    if config.db.pool.max_connections_per_session == 0 {
        return Err(StorageError::Invalid(
            "db.pool.max_connections_per_session must be at least 1".to_string(),
        ));
    }
    if config.ssh.idle_timeout_secs == 0 || config.db.idle_timeout_secs == 0 {
        return Err(StorageError::Invalid(
            "idle timeouts must be positive".to_string(),
        ));
    }
    Ok(())
}
