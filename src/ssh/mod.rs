//! SSH module - brokered shell sessions over russh
//!
//! # Features
//! - Per-user host trust store with strict / prompt / auto-accept policies
//! - Single-owner handle task per connection (see `handle_owner`)
//! - Exec-style command execution on fresh channels
//! - Session lifecycle through the shared `LifecycleCore`

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod manager;
mod shell;

pub use client::{ClientHandler, HostKeyGate, HostKeyPrompt, RusshConnector, SshConnector};
pub use config::{SshAuth, SshTarget};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController, PingResult};
pub use known_hosts::{HostKey, HostKeyStatus, HostTrustStore, TrustedHostKey};
pub use manager::SshSessionManager;
pub use shell::{ExecOutput, ShellSession, ShellTransport};
