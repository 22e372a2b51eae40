//! Database connection targets

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::DbError;
use crate::session::DB_RESOURCE_PREFIX;

/// Database engines the broker knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DbEngine {
    PostgreSql,
    MySql,
    MariaDb,
    /// Recognised, but no driver is wired up
    SqlServer,
}

impl DbEngine {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PostgreSql => "POSTGRESQL",
            Self::MySql => "MYSQL",
            Self::MariaDb => "MARIADB",
            Self::SqlServer => "SQLSERVER",
        }
    }

    /// `DB:<ENGINE>`
    pub fn resource_type(self) -> String {
        format!("{}{}", DB_RESOURCE_PREFIX, self.as_str())
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::PostgreSql => 5432,
            Self::MySql | Self::MariaDb => 3306,
            Self::SqlServer => 1433,
        }
    }

    pub fn ensure_supported(self) -> Result<(), DbError> {
        match self {
            Self::SqlServer => Err(DbError::UnsupportedEngine(self.as_str().to_string())),
            _ => Ok(()),
        }
    }
}

impl fmt::Display for DbEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbEngine {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "POSTGRESQL" | "POSTGRES" => Ok(Self::PostgreSql),
            "MYSQL" => Ok(Self::MySql),
            "MARIADB" => Ok(Self::MariaDb),
            "SQLSERVER" | "MSSQL" => Ok(Self::SqlServer),
            other => Err(DbError::UnsupportedEngine(other.to_string())),
        }
    }
}

/// Resolved credentials for one database
#[derive(Clone, Serialize, Deserialize)]
pub struct DbTarget {
    pub engine: DbEngine,
    pub host: String,
    /// Engine default when absent
    #[serde(default)]
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: String,
    /// Negotiate TLS when the server offers it
    #[serde(default)]
    pub ssl_enabled: bool,
}

impl DbTarget {
    pub fn new(
        engine: DbEngine,
        host: impl Into<String>,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            host: host.into(),
            port: None,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            ssl_enabled: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.engine.default_port())
    }
}

impl fmt::Debug for DbTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbTarget")
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port())
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"***")
            .field("ssl_enabled", &self.ssl_enabled)
            .finish()
    }
}
