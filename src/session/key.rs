//! Session identity
//!
//! A [`SessionKey`] is the natural key of a brokered session: the same
//! `(user, resource, resource type)` triple always denotes the same logical
//! session, whichever process or token currently represents it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Resource type used for interactive shell sessions
pub const SSH_RESOURCE_TYPE: &str = "SSH";

/// Prefix of every database resource type (`DB:POSTGRESQL`, `DB:MYSQL`, ...)
pub const DB_RESOURCE_PREFIX: &str = "DB:";

/// Canonical addressing tuple for a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub user_id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: String,
}

impl SessionKey {
    pub fn new(user_id: Uuid, resource_id: Uuid, resource_type: impl Into<String>) -> Self {
        Self {
            user_id,
            resource_id,
            resource_type: resource_type.into(),
        }
    }

    /// Key for a shell session against a registered server
    pub fn ssh(user_id: Uuid, server_id: Uuid) -> Self {
        Self::new(user_id, server_id, SSH_RESOURCE_TYPE)
    }

    /// Key for a resource addressed by alias instead of id.
    ///
    /// The resource id is a name-based UUID over `(user, alias)`, so repeated
    /// `init` calls for the same alias land on the same key.
    pub fn from_alias(user_id: Uuid, alias: &str, resource_type: impl Into<String>) -> Self {
        Self::new(user_id, alias_resource_id(user_id, alias), resource_type)
    }

    /// Session kind encoded in the resource type, if recognised
    pub fn kind(&self) -> Option<SessionKind> {
        SessionKind::of(&self.resource_type)
    }

    /// Stable string form, used to build store keys on any process
    pub fn storage_key(&self) -> String {
        format!("{}:{}:{}", self.user_id, self.resource_id, self.resource_type)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.user_id, self.resource_id, self.resource_type
        )
    }
}

/// Derive the resource id for an aliased resource
pub fn alias_resource_id(user_id: Uuid, alias: &str) -> Uuid {
    let name = format!("{}:{}", user_id, alias);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
}

/// The two session families managed by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Ssh,
    Db,
}

impl SessionKind {
    /// Classify a resource type string
    pub fn of(resource_type: &str) -> Option<Self> {
        if resource_type == SSH_RESOURCE_TYPE {
            Some(Self::Ssh)
        } else if resource_type.starts_with(DB_RESOURCE_PREFIX)
            && resource_type.len() > DB_RESOURCE_PREFIX.len()
        {
            Some(Self::Db)
        } else {
            None
        }
    }

    /// Store namespace segment (`session:<ns>:...`)
    pub fn namespace(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Db => "db",
        }
    }

    pub fn accepts(self, key: &SessionKey) -> bool {
        key.kind() == Some(self)
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ssh => write!(f, "SSH"),
            Self::Db => write!(f, "DB"),
        }
    }
}
