//! Service configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx_sqlite_conn_pool::PoolConfig;

/// File name of the database inside the application config directory
pub const DEFAULT_DATABASE_FILE: &str = "adb.db";

/// Configuration for a [`DatabaseService`](crate::DatabaseService)
///
/// # Examples
///
/// ```
/// use sqlite_db_service::DatabaseConfig;
///
/// let config = DatabaseConfig {
///     path: "/tmp/app/adb.db".into(),
///     ..Default::default()
/// };
/// assert_eq!(config.pool.max_connections, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
   /// Database file; parent directories are created on open
   ///
   /// Default: `<user config dir>/xfb/adb.db`
   pub path: PathBuf,

   /// Connection pool settings
   pub pool: PoolConfig,

   /// Events buffered per subscriber before it starts lagging
   ///
   /// Default: 64
   pub event_capacity: usize,
}

impl Default for DatabaseConfig {
   fn default() -> Self {
      Self {
         path: default_database_path(),
         pool: PoolConfig::default(),
         event_capacity: 64,
      }
   }
}

/// `<user config dir>/xfb/adb.db`, falling back to the working directory
/// when the platform has no config directory.
pub fn default_database_path() -> PathBuf {
   dirs::config_dir()
      .unwrap_or_else(|| PathBuf::from("."))
      .join("xfb")
      .join(DEFAULT_DATABASE_FILE)
}
