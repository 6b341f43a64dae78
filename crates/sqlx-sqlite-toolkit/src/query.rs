//! Ad-hoc queries on a shared default connection

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value as JsonValue;
use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use tokio::sync::Mutex;
use tracing::debug;

use crate::statement::{Row, WriteQueryResult, execute_on, fetch_all_on};
use crate::{Error, Result};

/// A single connection shared by fire-and-forget queries.
///
/// Kept apart from the pool so simple queries never compete with pooled
/// work for a slot. Statements on it run one at a time.
#[derive(Debug)]
pub struct DefaultConnection {
   conn: Mutex<Option<SqliteConnection>>,
   open: AtomicBool,
}

impl DefaultConnection {
   pub fn new(conn: SqliteConnection) -> Arc<Self> {
      Arc::new(Self {
         conn: Mutex::new(Some(conn)),
         open: AtomicBool::new(true),
      })
   }

   /// A default connection that has not been opened yet.
   pub fn closed() -> Arc<Self> {
      Arc::new(Self {
         conn: Mutex::new(None),
         open: AtomicBool::new(false),
      })
   }

   pub fn is_open(&self) -> bool {
      self.open.load(Ordering::Acquire)
   }

   /// Close the connection; queries fail until [`replace`](Self::replace).
   pub async fn close(&self) -> Result<()> {
      let mut guard = self.conn.lock().await;
      self.open.store(false, Ordering::Release);
      if let Some(conn) = guard.take() {
         conn.close().await?;
         debug!("Default connection closed");
      }
      Ok(())
   }

   /// Install a freshly opened connection, closing any previous one.
   pub async fn replace(&self, conn: SqliteConnection) -> Result<()> {
      let mut guard = self.conn.lock().await;
      let previous = guard.replace(conn);
      self.open.store(true, Ordering::Release);
      drop(guard);

      if let Some(previous) = previous {
         previous.close().await?;
      }
      Ok(())
   }
}

/// A statement bound to the default connection.
///
/// Obtained from [`Query::new`] (or a service's `create_query`). A query
/// created while no connection is open is *invalid*: it can still be built,
/// but executing it fails. Check [`is_valid`](Self::is_valid) first.
///
/// ```no_run
/// # async fn demo(conn: std::sync::Arc<sqlx_sqlite_toolkit::DefaultConnection>) -> sqlx_sqlite_toolkit::Result<()> {
/// use sqlx_sqlite_toolkit::Query;
///
/// let query = Query::new(&conn)
///    .prepare("INSERT INTO music (title, artist) VALUES (?, ?)")
///    .bind("Song Title")
///    .bind("Artist Name");
///
/// if query.is_valid() {
///    query.execute().await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Query {
   conn: Option<Arc<DefaultConnection>>,
   sql: Option<String>,
   values: Vec<JsonValue>,
}

impl Query {
   /// Query on `conn`; invalid when `conn` is not open.
   pub fn new(conn: &Arc<DefaultConnection>) -> Self {
      Self {
         conn: conn.is_open().then(|| Arc::clone(conn)),
         sql: None,
         values: Vec::new(),
      }
   }

   pub fn is_valid(&self) -> bool {
      self.conn.as_ref().is_some_and(|conn| conn.is_open())
   }

   /// Set the statement text, clearing previously bound values.
   pub fn prepare(mut self, sql: impl Into<String>) -> Self {
      self.sql = Some(sql.into());
      self.values.clear();
      self
   }

   /// Bind the next positional value
   pub fn bind(mut self, value: impl Into<JsonValue>) -> Self {
      self.values.push(value.into());
      self
   }

   /// Bind several positional values at once
   pub fn bind_all(mut self, values: impl IntoIterator<Item = JsonValue>) -> Self {
      self.values.extend(values);
      self
   }

   pub fn sql(&self) -> Option<&str> {
      self.sql.as_deref()
   }

   /// Execute the prepared statement
   pub async fn execute(&self) -> Result<WriteQueryResult> {
      let (conn, sql) = self.parts()?;
      let mut guard = conn.conn.lock().await;
      let c = guard.as_mut().ok_or_else(closed_error)?;
      execute_on(c, sql, self.values.clone()).await
   }

   /// Execute the prepared statement and return every row
   pub async fn fetch_all(&self) -> Result<Vec<Row>> {
      let (conn, sql) = self.parts()?;
      let mut guard = conn.conn.lock().await;
      let c = guard.as_mut().ok_or_else(closed_error)?;
      fetch_all_on(c, sql, self.values.clone()).await
   }

   fn parts(&self) -> Result<(&Arc<DefaultConnection>, &str)> {
      let conn = self
         .conn
         .as_ref()
         .ok_or_else(|| Error::InvalidQuery("no open database connection".into()))?;
      let sql = self
         .sql
         .as_deref()
         .ok_or_else(|| Error::InvalidQuery("no statement prepared".into()))?;
      Ok((conn, sql))
   }
}

fn closed_error() -> Error {
   Error::InvalidQuery("default database connection is closed".into())
}
