//! Binding, executing and decoding single statements

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnection, SqliteRow};
use sqlx::{Column, Row as _, Sqlite};

use crate::Result;
use crate::decode::to_json;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A decoded result row: column name to value, in column order.
pub type Row = IndexMap<String, JsonValue>;

/// Outcome of a write statement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueryResult {
   pub rows_affected: u64,
   /// ROWID of the last successful INSERT on this connection; 0 if none
   /// (including `WITHOUT ROWID` tables).
   pub last_insert_id: i64,
}

/// Prepare `sql`, bind `values` positionally and execute it on `conn`.
pub async fn execute_on(
   conn: &mut SqliteConnection,
   sql: &str,
   values: Vec<JsonValue>,
) -> Result<WriteQueryResult> {
   let done = prepare(sql, values).execute(&mut *conn).await?;
   Ok(WriteQueryResult {
      rows_affected: done.rows_affected(),
      last_insert_id: done.last_insert_rowid(),
   })
}

/// Prepare `sql`, bind `values` positionally and return every decoded row.
///
/// Zero matching rows is an empty vector, not an error.
pub async fn fetch_all_on(
   conn: &mut SqliteConnection,
   sql: &str,
   values: Vec<JsonValue>,
) -> Result<Vec<Row>> {
   let rows = prepare(sql, values).fetch_all(&mut *conn).await?;
   decode_rows(rows)
}

fn prepare(sql: &str, values: Vec<JsonValue>) -> SqliteQuery<'_> {
   values.into_iter().fold(sqlx::query(sql), bind_value)
}

/// Bind one JSON value as the next positional parameter.
///
/// Integers keep i64 precision; unsigned values beyond `i64::MAX` fall back
/// to REAL. Arrays and objects are bound as JSON text.
pub fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::Bool(flag) => query.bind(flag),
      JsonValue::String(text) => query.bind(text),
      JsonValue::Number(n) => match (n.as_i64(), n.as_u64()) {
         (Some(i), _) => query.bind(i),
         (None, Some(u)) => query.bind(u as f64),
         (None, None) => query.bind(n.as_f64().unwrap_or_default()),
      },
      nested => query.bind(nested),
   }
}

/// Decode rows into column-ordered JSON maps.
pub fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>> {
   rows
      .iter()
      .map(|row| {
         row.columns()
            .iter()
            .map(|column| {
               let raw = row.try_get_raw(column.ordinal())?;
               Ok((column.name().to_string(), to_json(raw)?))
            })
            .collect::<Result<Row>>()
      })
      .collect()
}
