//! Session metadata records and the typed, namespaced view over the store
//!
//! Layout (any process can recompute these from a token or a [`SessionKey`]):
//!
//! ```text
//! session:<ssh|db>:token:<token>                         -> SessionKey (json)
//! session:<ssh|db>:metadata:<user>:<resource>:<type>     -> SessionMetadata (json)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::key::{SessionKey, SessionKind};
use super::store::{MetadataStore, StoreError};
use super::token::token_hint;

/// Kind-specific connection attributes kept alongside the session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectionAttributes {
    Ssh {
        host: String,
        port: u16,
        username: String,
    },
    Db {
        engine: String,
        host: String,
        port: u16,
        database: String,
        username: String,
    },
}

/// Fleet-wide source of truth for "does this session exist and who last touched it"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub key: SessionKey,
    /// Identity of the connection this record describes
    pub session_id: Uuid,
    /// Unix ms
    pub created_at: i64,
    /// Unix ms
    pub last_accessed_at: i64,
    /// Expiry of `active_token` (unix ms)
    pub expires_at: i64,
    pub active_token: String,
    pub owning_process_id: String,
    pub attributes: ConnectionAttributes,
}

impl SessionMetadata {
    pub fn new(
        key: SessionKey,
        session_id: Uuid,
        active_token: String,
        expires_at: i64,
        owning_process_id: impl Into<String>,
        attributes: ConnectionAttributes,
    ) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            key,
            session_id,
            created_at: now,
            last_accessed_at: now,
            expires_at,
            active_token,
            owning_process_id: owning_process_id.into(),
            attributes,
        }
    }

    /// Record an access by `process_id`, taking ownership
    pub fn touch(&mut self, process_id: &str) {
        self.last_accessed_at = Utc::now().timestamp_millis();
        if self.owning_process_id != process_id {
            self.owning_process_id = process_id.to_string();
        }
    }
}

/// Typed access to one kind's namespace, with a per-operation timeout
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn MetadataStore>,
    kind: SessionKind,
    op_timeout: Duration,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn MetadataStore>, kind: SessionKind, op_timeout: Duration) -> Self {
        Self {
            backend,
            kind,
            op_timeout,
        }
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn token_entry_key(&self, token: &str) -> String {
        format!("session:{}:token:{}", self.kind.namespace(), token)
    }

    pub fn metadata_entry_key(&self, key: &SessionKey) -> String {
        format!(
            "session:{}:metadata:{}",
            self.kind.namespace(),
            key.storage_key()
        )
    }

    async fn timed<T>(
        &self,
        op: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .map_err(|_| StoreError::Timeout(self.op_timeout))?
    }

    // ─────────────────────────────────────────────────────────────────────
    // Token mappings
    // ─────────────────────────────────────────────────────────────────────

    pub async fn put_token(
        &self,
        token: &str,
        key: &SessionKey,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(key)?;
        let entry = self.token_entry_key(token);
        self.timed(self.backend.set(&entry, value, ttl)).await
    }

    /// Resolve a token mapping; unreadable entries count as absent
    pub async fn token_key(&self, token: &str) -> Result<Option<SessionKey>, StoreError> {
        let entry = self.token_entry_key(token);
        let Some(raw) = self.timed(self.backend.get(&entry)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(key) => Ok(Some(key)),
            Err(e) => {
                warn!("Unreadable token mapping {}: {}", token_hint(token), e);
                Ok(None)
            }
        }
    }

    pub async fn delete_token(&self, token: &str) -> Result<bool, StoreError> {
        let entry = self.token_entry_key(token);
        self.timed(self.backend.delete(&entry)).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Metadata records
    // ─────────────────────────────────────────────────────────────────────

    pub async fn put_metadata(
        &self,
        metadata: &SessionMetadata,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_string(metadata)?;
        let entry = self.metadata_entry_key(&metadata.key);
        self.timed(self.backend.set(&entry, value, ttl)).await
    }

    /// Read a metadata record; unreadable records count as absent
    pub async fn metadata(&self, key: &SessionKey) -> Result<Option<SessionMetadata>, StoreError> {
        let entry = self.metadata_entry_key(key);
        let Some(raw) = self.timed(self.backend.get(&entry)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                warn!("Unreadable session metadata for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn delete_metadata(&self, key: &SessionKey) -> Result<bool, StoreError> {
        let entry = self.metadata_entry_key(key);
        self.timed(self.backend.delete(&entry)).await
    }
}
