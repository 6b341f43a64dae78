//! Opening individual SQLite connections

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use sqlx::ConnectOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode};
use tracing::trace;

use crate::Result;

/// Engine identifier reported for every pooled connection.
pub const DRIVER_NAME: &str = "sqlite";

/// Boxed future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<SqliteConnection>> + Send + 'a>>;

/// Opens connections for the pool.
///
/// The pool never opens a connection any other way, so a custom connector is
/// the seam for instrumenting or faulting connection establishment.
pub trait Connector: Send + Sync + 'static {
   /// Open a new connection to `path`.
   fn connect<'a>(&'a self, path: &'a Path) -> ConnectFuture<'a>;
}

/// Default connector: a plain file-backed SQLite connection
#[derive(Debug, Clone)]
pub struct SqliteConnector {
   busy_timeout: Duration,
}

impl SqliteConnector {
   pub fn new(busy_timeout: Duration) -> Self {
      Self { busy_timeout }
   }

   /// Connection options used for every connection this connector opens.
   ///
   /// The rollback journal is kept (no WAL) so that a copy of a quiescent
   /// database file is a complete snapshot.
   pub fn options(&self, path: &Path) -> SqliteConnectOptions {
      SqliteConnectOptions::new()
         .filename(path)
         .create_if_missing(true)
         .busy_timeout(self.busy_timeout)
         .journal_mode(SqliteJournalMode::Delete)
   }
}

impl Connector for SqliteConnector {
   fn connect<'a>(&'a self, path: &'a Path) -> ConnectFuture<'a> {
      Box::pin(async move {
         let conn = self.options(path).connect().await?;
         trace!(path = %path.display(), "Opened SQLite connection");
         Ok(conn)
      })
   }
}

/// Open a standalone connection outside of any pool.
///
/// Used for the validation and default connections, which must not count
/// against `max_connections`.
pub async fn open_connection(path: impl Into<PathBuf>, busy_timeout: Duration) -> Result<SqliteConnection> {
   let path = path.into();
   SqliteConnector::new(busy_timeout).connect(&path).await
}

#[cfg(test)]
mod tests {
   use super::*;
   use sqlx::Row;
   use tempfile::TempDir;

   #[tokio::test]
   async fn test_open_creates_file_with_rollback_journal() {
      let temp = TempDir::new().unwrap();
      let path = temp.path().join("conn.db");

      let mut conn = open_connection(&path, Duration::from_secs(1)).await.unwrap();
      assert!(path.exists());

      let row = sqlx::query("PRAGMA journal_mode")
         .fetch_one(&mut conn)
         .await
         .unwrap();
      let mode: String = row.get(0);
      assert_eq!(mode.to_lowercase(), "delete");
   }
}
