//! Session Management Module
//!
//! Kind-agnostic building blocks of the session broker:
//! - Session identity and signed bearer tokens
//! - Shared metadata store (token mappings + session records, with TTL)
//! - Process-local registry of live handles, with liveness-gated access
//! - Lifecycle orchestration (init / keepalive / release / cleanup)
//! - Periodic single-flight background sweeps

pub mod cleanup;
mod error;
pub mod handle;
pub mod key;
pub mod lifecycle;
pub mod metadata;
mod registry;
pub mod store;
pub mod token;

pub use cleanup::{spawn_periodic, PeriodicTask};
pub use error::SessionError;
pub use handle::{Activity, LocalHandle};
pub use key::{alias_resource_id, SessionKey, SessionKind, DB_RESOURCE_PREFIX, SSH_RESOURCE_TYPE};
pub use lifecycle::{
    AccessGuard, AllowAll, CleanupReport, KeepaliveGrant, LifecycleCore, SessionGrant,
};
pub use metadata::{ConnectionAttributes, SessionMetadata, SessionStore};
pub use registry::{LocalRegistry, RegistryStats};
pub use store::{MemoryStore, MetadataStore, RedisStore, StoreError};
pub use token::{token_hint, IssuedToken, TokenCodec, TokenError, MIN_SECRET_LEN};
