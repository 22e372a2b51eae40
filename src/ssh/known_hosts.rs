//! Host Trust Store
//!
//! Per-user registry of trusted remote host keys, consulted while an SSH
//! connection is being established. Entries are cached in memory and, when
//! a database path is configured, persisted through [`HostKeyDb`].
//!
//! Lookup key is `[host]:port`, or the bare host for port 22, always lowercase.

use std::collections::HashMap;
use std::path::Path;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::{HostKeyDb, HostKeyStoreError};

/// Result of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HostKeyStatus {
    /// Key matches the trusted entry
    Ok,
    /// No trusted key of this type for the host
    NotIncluded { fingerprint: String },
    /// A different key of the same type is trusted (possible MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// A host key as presented by a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostKey {
    pub key_type: String,
    pub key_base64: String,
}

impl HostKey {
    pub fn new(key_type: impl Into<String>, key_base64: impl Into<String>) -> Self {
        Self {
            key_type: key_type.into(),
            key_base64: key_base64.into(),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self {
            key_type: key.algorithm().as_str().to_string(),
            key_base64: BASE64.encode(key.public_key_bytes()),
        }
    }

    /// `SHA256:<base64>` fingerprint, OpenSSH style
    pub fn fingerprint(&self) -> String {
        fingerprint_from_b64(&self.key_base64)
    }
}

/// A key a user has chosen to trust
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedHostKey {
    pub user_id: Uuid,
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub key_base64: String,
    pub fingerprint: String,
    /// Unix ms
    pub first_seen: i64,
    /// Unix ms, refreshed on every successful check
    pub last_verified: i64,
}

/// Compute fingerprint from a base64 encoded key blob
fn fingerprint_from_b64(key_b64: &str) -> String {
    match BASE64.decode(key_b64) {
        Ok(bytes) => {
            let hash = Sha256::digest(&bytes);
            format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
        }
        Err(_) => "unknown".to_string(),
    }
}

/// Create lookup key for host:port
fn make_key(host: &str, port: u16) -> String {
    let host = host.to_lowercase();
    if port == 22 {
        host
    } else {
        format!("[{}]:{}", host, port)
    }
}

type EntryKey = (Uuid, String);

pub struct HostTrustStore {
    entries: RwLock<HashMap<EntryKey, Vec<TrustedHostKey>>>,
    db: Option<HostKeyDb>,
}

impl HostTrustStore {
    /// Memory-only store
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Store persisted at `path`, loading existing entries
    pub fn open(path: &Path) -> Result<Self, HostKeyStoreError> {
        let db = HostKeyDb::open(path)?;
        let mut entries: HashMap<EntryKey, Vec<TrustedHostKey>> = HashMap::new();
        let mut count = 0;
        for key in db.load_all()? {
            entries
                .entry((key.user_id, make_key(&key.host, key.port)))
                .or_default()
                .push(key);
            count += 1;
        }
        info!(
            "Loaded {} trusted host keys ({} user/host pairs)",
            count,
            entries.len()
        );
        Ok(Self {
            entries: RwLock::new(entries),
            db: Some(db),
        })
    }

    /// Check a presented key for `user` against the trusted set
    pub fn check(&self, user_id: Uuid, host: &str, port: u16, key: &HostKey) -> HostKeyStatus {
        let lookup = (user_id, make_key(host, port));
        let actual_fingerprint = key.fingerprint();

        let verified = {
            let mut entries = self.entries.write();
            let Some(trusted) = entries
                .get_mut(&lookup)
                .and_then(|list| list.iter_mut().find(|k| k.key_type == key.key_type))
            else {
                debug!("No {} key trusted for {}", key.key_type, lookup.1);
                return HostKeyStatus::NotIncluded {
                    fingerprint: actual_fingerprint,
                };
            };

            if trusted.key_base64 != key.key_base64 {
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup.1, key.key_type, trusted.fingerprint, actual_fingerprint
                );
                return HostKeyStatus::Changed {
                    expected_fingerprint: trusted.fingerprint.clone(),
                    actual_fingerprint,
                };
            }

            trusted.last_verified = Utc::now().timestamp_millis();
            trusted.clone()
        };

        debug!("Host key verified for {} (type: {})", lookup.1, key.key_type);
        self.persist(&verified);
        HostKeyStatus::Ok
    }

    /// Trust `key` for `user`, replacing any key of the same type
    pub fn add(&self, user_id: Uuid, host: &str, port: u16, key: &HostKey) -> TrustedHostKey {
        let now = Utc::now().timestamp_millis();
        let trusted = TrustedHostKey {
            user_id,
            host: host.to_lowercase(),
            port,
            key_type: key.key_type.clone(),
            key_base64: key.key_base64.clone(),
            fingerprint: key.fingerprint(),
            first_seen: now,
            last_verified: now,
        };

        {
            let mut entries = self.entries.write();
            let list = entries.entry((user_id, make_key(host, port))).or_default();
            list.retain(|k| k.key_type != key.key_type);
            list.push(trusted.clone());
        }

        self.persist(&trusted);
        info!(
            "Trusted {} key for {} ({})",
            trusted.key_type,
            make_key(host, port),
            trusted.fingerprint
        );
        trusted
    }

    /// Forget the key of `key_type` for a host
    pub fn remove(&self, user_id: Uuid, host: &str, port: u16, key_type: &str) -> usize {
        self.remove_where(user_id, host, port, |k| k.key_type == key_type)
    }

    /// Forget every key for a host (legitimate key rotation)
    pub fn remove_all(&self, user_id: Uuid, host: &str, port: u16) -> usize {
        self.remove_where(user_id, host, port, |_| true)
    }

    fn remove_where(
        &self,
        user_id: Uuid,
        host: &str,
        port: u16,
        pred: impl Fn(&TrustedHostKey) -> bool,
    ) -> usize {
        let lookup = (user_id, make_key(host, port));
        let removed: Vec<TrustedHostKey> = {
            let mut entries = self.entries.write();
            let Some(list) = entries.get_mut(&lookup) else {
                return 0;
            };
            let (gone, kept): (Vec<_>, Vec<_>) = list.drain(..).partition(|k| pred(k));
            *list = kept;
            if list.is_empty() {
                entries.remove(&lookup);
            }
            gone
        };

        if let Some(db) = &self.db {
            if let Err(e) = db.remove(&removed) {
                warn!("Failed to remove persisted host keys for {}: {}", lookup.1, e);
            }
        }
        if !removed.is_empty() {
            info!("Removed {} host key(s) for {}", removed.len(), lookup.1);
        }
        removed.len()
    }

    /// Every key trusted by `user`
    pub fn list(&self, user_id: Uuid) -> Vec<TrustedHostKey> {
        let mut keys: Vec<TrustedHostKey> = self
            .entries
            .read()
            .iter()
            .filter(|((user, _), _)| *user == user_id)
            .flat_map(|(_, list)| list.iter().cloned())
            .collect();
        keys.sort_by(|a, b| (&a.host, a.port, &a.key_type).cmp(&(&b.host, b.port, &b.key_type)));
        keys
    }

    pub fn list_for_host(&self, user_id: Uuid, host: &str, port: u16) -> Vec<TrustedHostKey> {
        self.entries
            .read()
            .get(&(user_id, make_key(host, port)))
            .cloned()
            .unwrap_or_default()
    }

    fn persist(&self, key: &TrustedHostKey) {
        if let Some(db) = &self.db {
            if let Err(e) = db.upsert(key) {
                warn!("Failed to persist host key for {}: {}", key.host, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key_a() -> HostKey {
        HostKey::new("ssh-ed25519", BASE64.encode(b"key-material-a"))
    }

    fn key_b() -> HostKey {
        HostKey::new("ssh-ed25519", BASE64.encode(b"key-material-b"))
    }

    #[test]
    fn test_make_key() {
        assert_eq!(make_key("GitHub.com", 22), "github.com");
        assert_eq!(make_key("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = key_a().fingerprint();
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(HostKey::new("ssh-rsa", "%%%").fingerprint(), "unknown");
    }

    #[test]
    fn test_check_states() {
        let store = HostTrustStore::in_memory();
        let user = Uuid::new_v4();

        assert!(matches!(
            store.check(user, "db1", 22, &key_a()),
            HostKeyStatus::NotIncluded { .. }
        ));

        store.add(user, "db1", 22, &key_a());
        assert_eq!(store.check(user, "db1", 22, &key_a()), HostKeyStatus::Ok);

        match store.check(user, "db1", 22, &key_b()) {
            HostKeyStatus::Changed {
                expected_fingerprint,
                actual_fingerprint,
            } => {
                assert_eq!(expected_fingerprint, key_a().fingerprint());
                assert_eq!(actual_fingerprint, key_b().fingerprint());
            }
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_scoped_per_user_and_port() {
        let store = HostTrustStore::in_memory();
        let user = Uuid::new_v4();
        store.add(user, "db1", 22, &key_a());

        assert!(matches!(
            store.check(Uuid::new_v4(), "db1", 22, &key_a()),
            HostKeyStatus::NotIncluded { .. }
        ));
        assert!(matches!(
            store.check(user, "db1", 2222, &key_a()),
            HostKeyStatus::NotIncluded { .. }
        ));
        assert_eq!(store.check(user, "DB1", 22, &key_a()), HostKeyStatus::Ok);
    }

    #[test]
    fn test_other_key_type_is_not_included() {
        let store = HostTrustStore::in_memory();
        let user = Uuid::new_v4();
        store.add(user, "db1", 22, &key_a());

        let rsa = HostKey::new("ssh-rsa", BASE64.encode(b"rsa-material"));
        assert!(matches!(
            store.check(user, "db1", 22, &rsa),
            HostKeyStatus::NotIncluded { .. }
        ));
    }

    #[test]
    fn test_remove_and_list() {
        let store = HostTrustStore::in_memory();
        let user = Uuid::new_v4();
        let rsa = HostKey::new("ssh-rsa", BASE64.encode(b"rsa-material"));
        store.add(user, "db1", 22, &key_a());
        store.add(user, "db1", 22, &rsa);
        store.add(user, "db2", 22, &key_a());

        assert_eq!(store.list(user).len(), 3);
        assert_eq!(store.list_for_host(user, "db1", 22).len(), 2);

        assert_eq!(store.remove(user, "db1", 22, "ssh-rsa"), 1);
        assert_eq!(store.list_for_host(user, "db1", 22).len(), 1);

        assert_eq!(store.remove_all(user, "db1", 22), 1);
        assert!(store.list_for_host(user, "db1", 22).is_empty());
        assert_eq!(store.remove_all(user, "db1", 22), 0);
        assert_eq!(store.list(user).len(), 1);
    }

    #[test]
    fn test_add_replaces_same_type() {
        let store = HostTrustStore::in_memory();
        let user = Uuid::new_v4();
        store.add(user, "db1", 22, &key_a());
        store.add(user, "db1", 22, &key_b());

        assert_eq!(store.list_for_host(user, "db1", 22).len(), 1);
        assert_eq!(store.check(user, "db1", 22, &key_b()), HostKeyStatus::Ok);
    }

    #[test]
    fn test_persisted_across_reopen() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("known_hosts.redb");
        let user = Uuid::new_v4();

        {
            let store = HostTrustStore::open(&path).unwrap();
            store.add(user, "db1", 2222, &key_a());
        }

        let store = HostTrustStore::open(&path).unwrap();
        assert_eq!(store.check(user, "db1", 2222, &key_a()), HostKeyStatus::Ok);
        let listed = store.list(user);
        assert_eq!(listed.len(), 1);
        assert!(listed[0].last_verified >= listed[0].first_seen);
    }
}
