//! Configuration for the SQLite connection pool

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool)
///
/// # Examples
///
/// ```
/// use sqlx_sqlite_conn_pool::PoolConfig;
/// use std::time::Duration;
///
/// // Use defaults
/// let config = PoolConfig::default();
///
/// // Override just a few fields
/// let config = PoolConfig {
///     max_connections: 2,
///     acquire_timeout: Duration::from_secs(5),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
   /// Upper bound on the number of pooled connections
   ///
   /// Slots are opened lazily up to this bound. Must be at least 1.
   ///
   /// Default: 5
   pub max_connections: usize,

   /// How long `acquire` waits for a free slot before failing with
   /// [`Error::Timeout`](crate::Error::Timeout)
   ///
   /// Default: 30 seconds
   pub acquire_timeout: Duration,

   /// Busy timeout handed to every opened connection
   ///
   /// SQLite retries a locked database for this long before reporting
   /// `SQLITE_BUSY`.
   ///
   /// Default: 30 seconds
   pub busy_timeout: Duration,

   /// Period of the background idle sweep
   ///
   /// Default: 60 seconds
   pub cleanup_interval: Duration,

   /// Idle slots unused for longer than this are closed by the sweep
   ///
   /// Default: 5 minutes
   pub idle_timeout: Duration,

   /// Pause between closing and reopening connections during recovery
   ///
   /// Default: 100 milliseconds
   pub recovery_backoff: Duration,
}

impl Default for PoolConfig {
   fn default() -> Self {
      Self {
         max_connections: 5,
         acquire_timeout: Duration::from_secs(30),
         busy_timeout: Duration::from_secs(30),
         cleanup_interval: Duration::from_secs(60),
         idle_timeout: Duration::from_secs(300),
         recovery_backoff: Duration::from_millis(100),
      }
   }
}
