//! # sqlx-sqlite-conn-pool
//!
//! A bounded SQLite connection pool built on SQLx, for applications where many
//! tasks share one local database file.
//!
//! ## Core Types
//!
//! - **[`ConnectionPool`]**: Bounded set of lazily opened connections
//! - **[`PooledConnection`]**: RAII guard returning its connection to the pool on drop
//! - **[`PoolConfig`]**: Pool bound, timeouts and sweep settings
//! - **[`Connector`]**: Seam through which every connection is opened
//! - **[`Error`]**: Error type for pool operations
//!
//! ## Architecture
//!
//! - **Exclusive slots**: A slot is claimed under the pool lock and handed to
//!   exactly one caller until its guard drops
//! - **Bounded waits**: Callers wait for a release up to the acquire timeout,
//!   never indefinitely
//! - **Self-healing**: Locked, busy and I/O failures trigger one close-and-reopen
//!   pass over the pool
//! - **Idle sweep**: A background task closes connections idle beyond the
//!   configured threshold

mod cleanup;
mod config;
mod connection;
mod error;
mod guard;
mod pool;
pub mod recovery;

// Re-export public types
pub use config::PoolConfig;
pub use connection::{ConnectFuture, Connector, DRIVER_NAME, SqliteConnector, open_connection};
pub use error::{Error, Result};
pub use guard::PooledConnection;
pub use pool::{ConnectionPool, PoolStatus, SlotInfo};
