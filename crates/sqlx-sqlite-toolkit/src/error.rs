//! Error types for statements, queries and transactions

use sqlx_sqlite_conn_pool::recovery::{ErrorClass, classify};

pub type Result<T> = std::result::Result<T, Error>;

/// Failures of statements, queries and transactions
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Engine or driver failure while preparing or running a statement.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// Column type with no JSON representation.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// Query object cannot be executed (no open connection, nothing prepared).
   #[error("invalid query: {0}")]
   InvalidQuery(String),

   /// Transaction work asked for a rollback.
   #[error("transaction rolled back: {0}")]
   TransactionDeclined(String),

   /// Transaction work panicked; the transaction was rolled back.
   #[error("transaction work panicked: {0}")]
   TransactionPanicked(String),

   /// BEGIN failed; the work was never run.
   #[error("failed to start transaction: {0}")]
   TransactionBeginFailed(String),

   /// COMMIT failed; the transaction was rolled back.
   #[error("failed to commit transaction: {0}")]
   TransactionCommitFailed(String),

   /// A second transaction was started from inside a transaction's work.
   #[error("transaction {0} is already active on this task")]
   NestedTransaction(String),

   /// The unit failed and so did the ROLLBACK issued for it.
   #[error("transaction aborted ({transaction_error}) and rollback failed ({rollback_error})")]
   TransactionRollbackFailed {
      transaction_error: String,
      rollback_error: String,
   },
}

impl Error {
   /// Stable identifier for callers that branch on the kind of failure.
   ///
   /// Engine failures carry the SQLite result code, e.g. `SQLITE_2067`.
   pub fn error_code(&self) -> String {
      let code = match self {
         Error::Sqlx(e) => {
            return match e.as_database_error().and_then(|db| db.code()) {
               Some(code) => format!("SQLITE_{code}"),
               None => "SQLX_ERROR".to_string(),
            };
         }
         Error::UnsupportedDatatype(_) => "UNSUPPORTED_DATATYPE",
         Error::InvalidQuery(_) => "INVALID_QUERY",
         Error::TransactionDeclined(_) => "TRANSACTION_DECLINED",
         Error::TransactionPanicked(_) => "TRANSACTION_PANICKED",
         Error::TransactionBeginFailed(_) => "TRANSACTION_BEGIN_FAILED",
         Error::TransactionCommitFailed(_) => "TRANSACTION_COMMIT_FAILED",
         Error::NestedTransaction(_) => "TRANSACTION_NESTED",
         Error::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED",
      };
      code.to_string()
   }

   /// Whether this is a transient storage failure (locked, busy, I/O) that
   /// warrants a pool recovery pass.
   pub fn is_recoverable(&self) -> bool {
      match self {
         Error::Sqlx(_) | Error::TransactionBeginFailed(_) | Error::TransactionCommitFailed(_) => {
            classify(&self.to_string()) == ErrorClass::Recoverable
         }
         _ => false,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_transaction_codes() {
      let cases = [
         (Error::TransactionDeclined("work returned false".into()), "TRANSACTION_DECLINED"),
         (Error::TransactionPanicked("boom".into()), "TRANSACTION_PANICKED"),
         (Error::TransactionBeginFailed("locked".into()), "TRANSACTION_BEGIN_FAILED"),
         (Error::TransactionCommitFailed("disk full".into()), "TRANSACTION_COMMIT_FAILED"),
      ];
      for (err, code) in cases {
         assert_eq!(err.error_code(), code, "{err}");
      }
   }

   #[test]
   fn test_rollback_failure_names_both_errors() {
      let err = Error::TransactionRollbackFailed {
         transaction_error: "UNIQUE constraint failed".into(),
         rollback_error: "disk I/O error".into(),
      };
      assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
      let message = err.to_string();
      assert!(message.contains("UNIQUE constraint failed"));
      assert!(message.contains("disk I/O error"));
   }

   #[test]
   fn test_nested_transaction_is_not_recoverable() {
      let err = Error::NestedTransaction("tx-1".into());
      assert_eq!(err.error_code(), "TRANSACTION_NESTED");
      assert!(err.to_string().contains("tx-1"));
      assert!(!err.is_recoverable());
   }

   #[test]
   fn test_driver_error_without_engine_code() {
      assert_eq!(Error::Sqlx(sqlx::Error::PoolTimedOut).error_code(), "SQLX_ERROR");
   }

   #[test]
   fn test_recoverable_classification() {
      assert!(Error::TransactionBeginFailed("database is locked".into()).is_recoverable());
      assert!(Error::TransactionCommitFailed("database is busy".into()).is_recoverable());
      assert!(!Error::TransactionDeclined("database is locked".into()).is_recoverable());
      assert!(!Error::InvalidQuery("no statement prepared".into()).is_recoverable());
      assert!(!Error::UnsupportedDatatype("WEIRD".into()).is_recoverable());
   }
}
