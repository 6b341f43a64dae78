//! Error types for sqlx-sqlite-conn-pool

use std::time::Duration;

use thiserror::Error;

use crate::recovery::{ErrorClass, classify};

/// Errors that may occur when working with sqlx-sqlite-conn-pool
#[derive(Error, Debug)]
pub enum Error {
   /// IO error when accessing database files. Standard library IO errors
   /// are converted to this variant.
   #[error("IO error: {0}")]
   Io(#[from] std::io::Error),

   /// Error from the sqlx library. Standard sqlx errors are converted to this variant
   #[error("Sqlx error: {0}")]
   Sqlx(#[from] sqlx::Error),

   /// No slot became free before the acquire deadline
   #[error("timed out after {0:?} waiting for a database connection")]
   Timeout(Duration),

   /// Pool has been shut down and cannot hand out connections
   #[error("database service unavailable")]
   Unavailable,

   /// A recovery pass failed to reopen the pool's connections
   #[error("connection pool degraded: {0}")]
   Degraded(String),

   /// The pool could not be taken offline: connections were still checked out
   #[error("{0} database connection(s) still in use")]
   StillInUse(usize),

   /// `max_connections` must be at least 1
   #[error("maximum connections must be at least 1 (got {0})")]
   InvalidMaxConnections(usize),
}

impl Error {
   /// Whether the Recovery Policy treats this failure as transient
   pub fn is_recoverable(&self) -> bool {
      match self {
         Error::Io(e) => classify(&e.to_string()) == ErrorClass::Recoverable,
         Error::Sqlx(e) => classify(&e.to_string()) == ErrorClass::Recoverable,
         _ => false,
      }
   }

   /// Machine-readable error code
   pub fn error_code(&self) -> String {
      match self {
         Error::Io(_) => "IO_ERROR".to_string(),
         Error::Sqlx(e) => {
            if let Some(code) = e.as_database_error().and_then(|db_err| db_err.code()) {
               return format!("SQLITE_{}", code);
            }
            "SQLX_ERROR".to_string()
         }
         Error::Timeout(_) => "POOL_TIMEOUT".to_string(),
         Error::Unavailable => "SERVICE_UNAVAILABLE".to_string(),
         Error::Degraded(_) => "POOL_DEGRADED".to_string(),
         Error::StillInUse(_) => "CONNECTIONS_IN_USE".to_string(),
         Error::InvalidMaxConnections(_) => "INVALID_MAX_CONNECTIONS".to_string(),
      }
   }
}

/// A type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;
