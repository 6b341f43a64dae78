//! Transaction executor with flattened nesting
//!
//! [`run_transaction`] wraps a unit of work in `BEGIN IMMEDIATE` / `COMMIT` /
//! `ROLLBACK` on one connection:
//!
//! ```text
//! Idle -> Begun -> Committed
//!               -> RolledBack
//! ```
//!
//! The work is a closure receiving a [`Transaction`] and returning a boxed
//! future, the same shape `sqlx` uses for its own transaction helper. Returning
//! `Ok(true)` commits, unless a statement failed along the way; `Ok(false)`,
//! an error, a panic or any failed statement rolls back. Nested units started
//! with [`Transaction::execute_transaction`] join the outer transaction
//! instead of issuing a second BEGIN/COMMIT.
//!
//! While the work runs, the task is marked as inside a transaction. Code that
//! would open a second transaction on another connection from there can ask
//! [`reject_nested_transaction`] first, which fails fast and dooms the outer
//! unit to roll back.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::statement::{Row, WriteQueryResult, execute_on, fetch_all_on};
use crate::{Error, Result};

tokio::task_local! {
   static ACTIVE: Arc<ActiveTransaction>;
}

struct ActiveTransaction {
   id: String,
   nested_rejected: OnceLock<String>,
}

/// Refuse to start a transaction from inside another transaction's work.
///
/// Returns `Ok(())` outside any transaction. Inside one, the outer
/// transaction is marked rollback-only and [`Error::NestedTransaction`] is
/// returned; nested units belong on the [`Transaction`] handle instead.
pub fn reject_nested_transaction() -> Result<()> {
   match ACTIVE.try_with(|active| {
      let _ = active
         .nested_rejected
         .set("a nested transaction was started outside the transaction handle".into());
      active.id.clone()
   }) {
      Ok(id) => {
         warn!(transaction = %id, "Nested transaction rejected");
         Err(Error::NestedTransaction(id))
      }
      Err(_) => Ok(()),
   }
}

/// A statement that failed inside a transaction
#[derive(Debug, Clone)]
pub struct StatementFailure {
   pub message: String,
   pub sql: String,
   pub recoverable: bool,
}

/// Handle given to transaction work.
///
/// Every statement runs on the transaction's connection. The handle also
/// counts statements and remembers failures so the caller can account for
/// them once the transaction settles.
pub struct Transaction<'c> {
   conn: &'c mut SqliteConnection,
   id: String,
   depth: usize,
   rollback_only: Option<String>,
   statements: u64,
   failures: Vec<StatementFailure>,
}

impl<'c> Transaction<'c> {
   fn new(conn: &'c mut SqliteConnection) -> Self {
      Self {
         conn,
         id: Uuid::new_v4().to_string(),
         depth: 0,
         rollback_only: None,
         statements: 0,
         failures: Vec::new(),
      }
   }

   /// Identifier used in log output
   pub fn id(&self) -> &str {
      &self.id
   }

   /// Nesting depth: 0 for the outer unit
   pub fn depth(&self) -> usize {
      self.depth
   }

   /// Whether a nested unit failed, so the transaction can only roll back
   pub fn is_rollback_only(&self) -> bool {
      self.rollback_only.is_some()
   }

   /// Execute a write statement within this transaction
   pub async fn execute(&mut self, query: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      self.statements += 1;
      let result = execute_on(&mut *self.conn, query, values).await;
      if let Err(e) = &result {
         self.record_failure(e, query);
      }
      result
   }

   /// Execute a read statement within this transaction and return decoded rows
   pub async fn select(&mut self, query: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      self.statements += 1;
      let result = fetch_all_on(&mut *self.conn, query, values).await;
      if let Err(e) = &result {
         self.record_failure(e, query);
      }
      result
   }

   /// Run a nested unit of work as part of this transaction.
   ///
   /// No BEGIN or COMMIT is issued. If the nested work declines, errors or
   /// panics, the whole transaction becomes rollback-only and the failure is
   /// returned so the outer work can stop early.
   pub async fn execute_transaction<F>(&mut self, work: F) -> Result<()>
   where
      F: for<'t> FnOnce(&'t mut Transaction<'c>) -> BoxFuture<'t, Result<bool>> + Send,
   {
      self.depth += 1;
      debug!(transaction = %self.id, depth = self.depth, "Joining outer transaction");

      let settled = AssertUnwindSafe(work(&mut *self)).catch_unwind().await;
      self.depth -= 1;

      match settle(settled) {
         None => Ok(()),
         Some(cause) => {
            warn!(transaction = %self.id, error = %cause, "Nested transaction failed; outer transaction will roll back");
            if self.rollback_only.is_none() {
               self.rollback_only = Some(cause.to_string());
            }
            Err(cause)
         }
      }
   }

   fn record_failure(&mut self, e: &Error, query: &str) {
      error!(transaction = %self.id, error = %e, query, "SQL error in transaction");
      self.failures.push(StatementFailure {
         message: e.to_string(),
         sql: query.to_string(),
         recoverable: e.is_recoverable(),
      });
   }

   async fn finish_statement(&mut self, sql: &'static str) -> Result<()> {
      sqlx::query(sql).execute(&mut *self.conn).await?;
      Ok(())
   }
}

/// How a transaction ended
#[derive(Debug)]
pub enum TransactionOutcome {
   /// Work succeeded and COMMIT went through
   Committed,
   /// BEGIN failed; the work never ran
   BeginFailed(Error),
   /// Work declined, failed or panicked; ROLLBACK went through
   RolledBack(Error),
   /// COMMIT failed; ROLLBACK went through
   CommitFailed(Error),
   /// ROLLBACK itself failed; the connection is in an unknown state
   RollbackFailed(Error),
}

impl TransactionOutcome {
   pub fn is_committed(&self) -> bool {
      matches!(self, TransactionOutcome::Committed)
   }

   /// Whether a ROLLBACK was successfully applied
   pub fn is_rolled_back(&self) -> bool {
      matches!(
         self,
         TransactionOutcome::RolledBack(_) | TransactionOutcome::CommitFailed(_)
      )
   }

   /// A failed rollback leaves the connection unfit for reuse
   pub fn connection_unhealthy(&self) -> bool {
      matches!(self, TransactionOutcome::RollbackFailed(_))
   }

   pub fn error(&self) -> Option<&Error> {
      match self {
         TransactionOutcome::Committed => None,
         TransactionOutcome::BeginFailed(e)
         | TransactionOutcome::RolledBack(e)
         | TransactionOutcome::CommitFailed(e)
         | TransactionOutcome::RollbackFailed(e) => Some(e),
      }
   }

   pub fn into_result(self) -> Result<()> {
      match self {
         TransactionOutcome::Committed => Ok(()),
         TransactionOutcome::BeginFailed(e)
         | TransactionOutcome::RolledBack(e)
         | TransactionOutcome::CommitFailed(e)
         | TransactionOutcome::RollbackFailed(e) => Err(e),
      }
   }
}

/// Everything known about a finished transaction
#[derive(Debug)]
pub struct TransactionReport {
   pub id: String,
   pub outcome: TransactionOutcome,
   /// Statements issued by the work (nested units included)
   pub statements: u64,
   pub failures: Vec<StatementFailure>,
}

/// Run `work` inside one transaction on `conn`.
///
/// The work is never called when BEGIN fails. Whatever the work does, the
/// transaction is either committed or rolled back before this returns; a
/// failed COMMIT is followed by a ROLLBACK. A statement that failed inside the
/// work forces a rollback even when the work swallowed the error and returned
/// `Ok(true)`.
pub async fn run_transaction<F>(conn: &mut SqliteConnection, work: F) -> TransactionReport
where
   F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, Result<bool>> + Send,
{
   let mut tx = Transaction::new(conn);

   if let Err(e) = tx.finish_statement("BEGIN IMMEDIATE").await {
      error!(transaction = %tx.id, error = %e, "Failed to start transaction");
      let outcome = TransactionOutcome::BeginFailed(Error::TransactionBeginFailed(e.to_string()));
      return tx.into_report(outcome);
   }
   debug!(transaction = %tx.id, "Transaction started");

   let active = Arc::new(ActiveTransaction {
      id: tx.id.clone(),
      nested_rejected: OnceLock::new(),
   });
   let settled = ACTIVE
      .scope(Arc::clone(&active), AssertUnwindSafe(work(&mut tx)).catch_unwind())
      .await;

   let cause = match settle(settled) {
      None => tx
         .rollback_only
         .take()
         .or_else(|| active.nested_rejected.get().cloned())
         .or_else(|| {
            tx.failures
               .first()
               .map(|failure| format!("statement failed: {}", failure.message))
         })
         .map(Error::TransactionDeclined),
      Some(cause) => Some(cause),
   };

   let outcome = match cause {
      None => match tx.finish_statement("COMMIT").await {
         Ok(()) => {
            debug!(transaction = %tx.id, "Transaction committed");
            TransactionOutcome::Committed
         }
         Err(commit_err) => {
            error!(transaction = %tx.id, error = %commit_err, "Failed to commit transaction");
            match tx.finish_statement("ROLLBACK").await {
               Ok(()) => TransactionOutcome::CommitFailed(Error::TransactionCommitFailed(
                  commit_err.to_string(),
               )),
               Err(rollback_err) => rollback_failed(&tx, commit_err, rollback_err),
            }
         }
      },
      Some(cause) => match tx.finish_statement("ROLLBACK").await {
         Ok(()) => {
            debug!(transaction = %tx.id, reason = %cause, "Transaction rolled back");
            TransactionOutcome::RolledBack(cause)
         }
         Err(rollback_err) => rollback_failed(&tx, cause, rollback_err),
      },
   };

   tx.into_report(outcome)
}

impl Transaction<'_> {
   fn into_report(self, outcome: TransactionOutcome) -> TransactionReport {
      TransactionReport {
         id: self.id,
         outcome,
         statements: self.statements,
         failures: self.failures,
      }
   }
}

fn rollback_failed(tx: &Transaction<'_>, cause: Error, rollback_err: Error) -> TransactionOutcome {
   error!(
      transaction = %tx.id,
      error = %cause,
      rollback_error = %rollback_err,
      "Failed to rollback transaction"
   );
   TransactionOutcome::RollbackFailed(Error::TransactionRollbackFailed {
      transaction_error: cause.to_string(),
      rollback_error: rollback_err.to_string(),
   })
}

/// Map the settled work to the reason it failed, if it did
fn settle(settled: std::result::Result<Result<bool>, Box<dyn Any + Send>>) -> Option<Error> {
   match settled {
      Ok(Ok(true)) => None,
      Ok(Ok(false)) => Some(Error::TransactionDeclined(
         "transaction work returned false".into(),
      )),
      Ok(Err(e)) => Some(e),
      Err(panic) => Some(Error::TransactionPanicked(panic_message(panic.as_ref()))),
   }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
   if let Some(s) = panic.downcast_ref::<&str>() {
      s.to_string()
   } else if let Some(s) = panic.downcast_ref::<String>() {
      s.clone()
   } else {
      "unknown panic".to_string()
   }
}
