//! Session Broker - distributed lifecycle manager for brokered sessions
//!
//! Live SSH and database connections stay on the process that opened them,
//! while tokens and session metadata live in a shared store, so any process
//! in the fleet can service keepalive and release calls.

// Many short-lived allocations on the request path (token encoding, store payloads)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod config;
pub mod db;
pub mod session;
pub mod ssh;
pub mod state;

pub use db::{DbEngine, DbError, DbSessionManager, DbTarget};
pub use session::{
    KeepaliveGrant, SessionError, SessionGrant, SessionKey, SessionKind, SessionMetadata,
    TokenCodec,
};
pub use ssh::{SshError, SshSessionManager, SshTarget};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging (`RUST_LOG`, default `info`)
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
