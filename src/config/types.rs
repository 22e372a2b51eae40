//! Broker configuration types
//!
//! Every field has a default so a partial (or missing) config file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Environment variable overriding `token.secret`
pub const TOKEN_SECRET_ENV: &str = "SESSION_BROKER_TOKEN_SECRET";

fn default_version() -> u32 {
    CONFIG_VERSION
}

/// Root of the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_version")]
    pub version: u32,

    /// Process identity recorded as the owner of sessions.
    /// Derived from the hostname when absent.
    #[serde(default)]
    pub instance_id: Option<String>,

    #[serde(default)]
    pub token: TokenConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ssh: SshSettings,

    #[serde(default)]
    pub db: DbSettings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            instance_id: None,
            token: TokenConfig::default(),
            store: StoreConfig::default(),
            ssh: SshSettings::default(),
            db: DbSettings::default(),
        }
    }
}

impl BrokerConfig {
    /// Explicit override, then the config value, then `<hostname>-<random>`
    pub fn resolve_instance_id(&self, cli_override: Option<&str>) -> String {
        if let Some(id) = cli_override.filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        if let Some(id) = self.instance_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "broker".to_string());
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", host, &suffix[..8])
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Token
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// HS256 signing secret (at least 32 bytes); `SESSION_BROKER_TOKEN_SECRET` wins when set
    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_token_expiration_ms")]
    pub expiration_ms: u64,
}

fn default_token_expiration_ms() -> u64 {
    30 * 60 * 1000
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            expiration_ms: default_token_expiration_ms(),
        }
    }
}

impl TokenConfig {
    pub fn expiration(&self) -> Duration {
        Duration::from_millis(self.expiration_ms)
    }

    /// Secret from the environment, falling back to the file
    pub fn resolve_secret(&self) -> Option<String> {
        std::env::var(TOKEN_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.secret.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Metadata store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process-local; only meaningful for a single-node deployment
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_store_timeout_ms")]
    pub operation_timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    2_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            operation_timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SSH
// ═══════════════════════════════════════════════════════════════════════════

/// What to do with a host key that is not in the trust store.
/// A changed key is rejected under every policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Reject unknown hosts
    #[default]
    Strict,
    /// Ask the installed prompt; reject when none is installed
    Prompt,
    /// Trust on first use and remember the key
    AutoAccept,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_ssh_connect_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_probe_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// redb file for trusted host keys; in-memory only when absent
    #[serde(default)]
    pub known_hosts_db: Option<PathBuf>,
}

fn default_session_idle_secs() -> u64 {
    30 * 60
}

fn default_ssh_connect_secs() -> u64 {
    20
}

fn default_probe_secs() -> u64 {
    5
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_secs(),
            connect_timeout_secs: default_ssh_connect_secs(),
            probe_timeout_secs: default_probe_secs(),
            host_key_policy: HostKeyPolicy::default(),
            known_hosts_db: None,
        }
    }
}

impl SshSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Database
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbSettings {
    #[serde(default = "default_session_idle_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_db_connect_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_probe_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_db_connect_secs() -> u64 {
    15
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_session_idle_secs(),
            connect_timeout_secs: default_db_connect_secs(),
            probe_timeout_secs: default_probe_secs(),
            pool: PoolConfig::default(),
        }
    }
}

impl DbSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Per-session connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_connections")]
    pub max_connections_per_session: usize,

    #[serde(default = "default_health_check_secs")]
    pub health_check_interval_secs: u64,

    /// Idle connections beyond `min_idle` are closed after this long
    #[serde(default = "default_pool_idle_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_probe_secs")]
    pub validation_timeout_secs: u64,

    #[serde(default = "default_min_idle")]
    pub min_idle: usize,
}

fn default_max_connections() -> usize {
    5
}

fn default_health_check_secs() -> u64 {
    60
}

fn default_pool_idle_secs() -> u64 {
    300
}

fn default_min_idle() -> usize {
    1
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_session: default_max_connections(),
            health_check_interval_secs: default_health_check_secs(),
            idle_timeout_secs: default_pool_idle_secs(),
            validation_timeout_secs: default_probe_secs(),
            min_idle: default_min_idle(),
        }
    }
}

impl PoolConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.token.expiration(), Duration::from_secs(1800));
        assert_eq!(config.store.operation_timeout(), Duration::from_secs(2));
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(config.ssh.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.db.connect_timeout(), Duration::from_secs(15));
        assert_eq!(config.db.pool.max_connections_per_session, 5);
        assert_eq!(config.db.pool.health_check_interval(), Duration::from_secs(60));
        assert_eq!(config.db.pool.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.db.pool.validation_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "ssh": { "host_key_policy": "auto_accept" }, "db": { "pool": { "max_connections_per_session": 2 } } }"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.ssh.host_key_policy, HostKeyPolicy::AutoAccept);
        assert_eq!(config.ssh.idle_timeout_secs, 1800);
        assert_eq!(config.db.pool.max_connections_per_session, 2);
        assert_eq!(config.db.pool.min_idle, 1);
        assert_eq!(config.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_instance_id_resolution() {
        let mut config = BrokerConfig::default();
        assert_eq!(config.resolve_instance_id(Some("cli-node")), "cli-node");

        config.instance_id = Some("file-node".into());
        assert_eq!(config.resolve_instance_id(None), "file-node");

        config.instance_id = None;
        let derived = config.resolve_instance_id(None);
        let (_, suffix) = derived.rsplit_once('-').unwrap();
        assert_eq!(suffix.len(), 8);
    }
}
