//! # sqlite-db-service
//!
//! Pooled access to a single local SQLite database file, shared by many tasks
//! in one process.
//!
//! ## Core Types
//!
//! - **[`DatabaseService`]**: Lifecycle, queries, transactions and maintenance
//! - **[`DatabaseConfig`]**: Database path, pool settings and event buffering
//! - **[`DatabaseEvent`]**: Errors, transaction outcomes and maintenance results,
//!   published to every subscriber
//! - **[`DatabaseStats`]** / **[`ConnectionInfo`]**: Counters and pool introspection
//! - **[`Error`]**: Error type for service operations
//!
//! Connection pooling lives in `sqlx-sqlite-conn-pool`; statement binding,
//! row decoding and the transaction executor live in `sqlx-sqlite-toolkit`.
//! Their public types are re-exported here.

mod config;
mod error;
mod events;
mod maintenance;
mod schema;
mod service;
mod stats;

pub use config::{DEFAULT_DATABASE_FILE, DatabaseConfig, default_database_path};
pub use error::{Error, Result};
pub use events::{DatabaseEvent, EventStream, StreamEvent};
pub use schema::SCHEMA_VERSION;
pub use service::DatabaseService;
pub use stats::{ConnectionInfo, DatabaseStats};

pub use sqlx_sqlite_conn_pool::{PoolConfig, PoolStatus};
pub use sqlx_sqlite_toolkit::{Query, Row, Transaction, WriteQueryResult};
/// Error type of statements and results inside transaction work
pub use sqlx_sqlite_toolkit::Error as TransactionError;
