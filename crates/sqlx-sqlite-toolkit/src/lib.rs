//! # sqlx-sqlite-toolkit
//!
//! Query and transaction helpers for SQLite on SQLx.
//!
//! Values cross the API as [`serde_json::Value`]: parameters are bound
//! positionally from JSON and result rows decode to ordered JSON maps, with
//! BLOBs as base64 strings.
//!
//! ## Core Types
//!
//! - **[`Query`]**: Prepared statement on a shared [`DefaultConnection`]
//! - **[`run_transaction`]**: Runs a unit of work in one `BEGIN IMMEDIATE` transaction
//! - **[`Transaction`]**: Handle given to transaction work; supports flattened nesting
//! - **[`TransactionReport`]**: Outcome, statement count and failures of a finished transaction
//! - **[`Error`]**: Error type for toolkit operations

mod decode;
mod error;
mod query;
mod statement;
mod transactions;

pub use error::{Error, Result};
pub use query::{DefaultConnection, Query};
pub use statement::{Row, WriteQueryResult, bind_value, decode_rows, execute_on, fetch_all_on};
pub use transactions::{
   StatementFailure, Transaction, TransactionOutcome, TransactionReport, reject_nested_transaction,
   run_transaction,
};
