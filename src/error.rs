//! Error types for the database service

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by [`DatabaseService`](crate::DatabaseService).
///
/// None of these are fatal to the process. Each failure is also published as
/// a [`DatabaseEvent`](crate::DatabaseEvent).
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Invalid or unwritable database path, or a setting rejected at runtime.
   #[error("configuration error: {0}")]
   Configuration(String),

   /// Opening, acquiring or reopening a connection failed.
   #[error(transparent)]
   Connection(#[from] sqlx_sqlite_conn_pool::Error),

   /// Prepare or execute failed for `sql`.
   #[error("query failed: {source}")]
   Query {
      #[source]
      source: sqlx_sqlite_toolkit::Error,
      sql: String,
   },

   /// BEGIN, COMMIT or ROLLBACK failed, or the transaction work failed.
   #[error(transparent)]
   Transaction(#[from] sqlx_sqlite_toolkit::Error),

   /// Backup, restore, optimize or integrity check failed.
   #[error("maintenance failed: {0}")]
   Maintenance(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   pub(crate) fn query(source: sqlx_sqlite_toolkit::Error, sql: &str) -> Self {
      Error::Query {
         source,
         sql: sql.to_string(),
      }
   }

   /// Statement text attached to the error, if any
   pub fn sql(&self) -> Option<&str> {
      match self {
         Error::Query { sql, .. } => Some(sql),
         _ => None,
      }
   }

   /// Whether the failure is a transient storage error that warrants a
   /// recovery pass.
   pub fn is_recoverable(&self) -> bool {
      match self {
         Error::Connection(e) => e.is_recoverable(),
         Error::Query { source, .. } => source.is_recoverable(),
         Error::Transaction(e) => e.is_recoverable(),
         _ => false,
      }
   }

   /// Extract a structured error code from the error type.
   pub fn error_code(&self) -> String {
      match self {
         Error::Configuration(_) => "CONFIGURATION_ERROR".to_string(),
         Error::Connection(e) => e.error_code(),
         Error::Query { source, .. } => source.error_code(),
         Error::Transaction(e) => e.error_code(),
         Error::Maintenance(_) => "MAINTENANCE_ERROR".to_string(),
         Error::Io(_) => "IO_ERROR".to_string(),
      }
   }
}
