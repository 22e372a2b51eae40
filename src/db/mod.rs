//! Database sessions
//!
//! Brokered database sessions over a per-session connection pool.

pub mod config;
pub mod connection;
mod error;
pub mod manager;
pub mod pool;
pub mod session;

pub use config::{DbEngine, DbTarget};
pub use connection::{DbConnection, DbConnector, DbLink, SqlxConnector, SqlxLink};
pub use error::DbError;
pub use manager::DbSessionManager;
pub use pool::{ConnectionPool, KeyPoolStats, PoolStats, PooledConnection, SweepReport};
pub use session::DbSession;
