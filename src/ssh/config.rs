//! SSH connection targets
//!
//! Credentials arrive already resolved and decrypted from the caller.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where and how to connect
#[derive(Clone, Serialize, Deserialize)]
pub struct SshTarget {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub auth: SshAuth,
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SshAuth {
    Password { password: String },

    /// OpenSSH/PEM private key content
    PrivateKey {
        key_pem: String,
        passphrase: Option<String>,
    },
}

fn default_port() -> u16 {
    22
}

impl SshTarget {
    pub fn with_password(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: SshAuth::Password {
                password: password.into(),
            },
        }
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .finish()
    }
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password { .. } => write!(f, "Password(***)"),
            SshAuth::PrivateKey { passphrase, .. } => write!(
                f,
                "PrivateKey(***, passphrase: {})",
                if passphrase.is_some() { "***" } else { "none" }
            ),
        }
    }
}
