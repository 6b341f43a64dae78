//! Backup, restore, optimization and integrity checks

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value as JsonValue;
use sqlx::Connection;
use sqlx_sqlite_conn_pool::open_connection;
use sqlx_sqlite_toolkit::{execute_on, fetch_all_on};
use tokio::fs;
use tracing::{debug, error, warn};

use crate::events::DatabaseEvent;
use crate::service::DatabaseService;
use crate::{Error, Result};

/// Suffix of the copy kept while a restore is in progress
const SAFETY_COPY_SUFFIX: &str = ".restore_backup";

impl DatabaseService {
   /// Copy the database file to `destination`.
   ///
   /// Missing parent directories are created and an existing file at
   /// `destination` is replaced. The copy is file-level: quiesce writers first
   /// if you need a consistent snapshot.
   pub async fn backup(&self, destination: impl AsRef<Path>) -> Result<()> {
      let destination = destination.as_ref().to_path_buf();
      let _exclusive = self.inner.exclusive.lock().await;

      let result = copy_database(&self.database_path(), &destination).await;
      self.finish_maintenance("backup", result, |success| DatabaseEvent::BackupCompleted {
         success,
         path: destination.clone(),
      })
   }

   /// Replace the database file with `source`.
   ///
   /// The pool is taken offline for the swap: `acquire` waits, and the
   /// restore waits (up to the acquire timeout) for connections already
   /// checked out to be released. If any are still out after that, the
   /// restore fails and nothing is touched. The default connection is closed
   /// for the swap too. The current file is kept as a safety copy until the
   /// restored file has been opened and read successfully; otherwise it is
   /// put back.
   pub async fn restore(&self, source: impl AsRef<Path>) -> Result<()> {
      let source = source.as_ref().to_path_buf();
      let _exclusive = self.inner.exclusive.lock().await;

      let result = self.restore_from(&source).await;
      self.finish_maintenance("restore", result, |success| DatabaseEvent::RestoreCompleted {
         success,
         path: source.clone(),
      })
   }

   /// Compact the database and refresh query planner statistics.
   ///
   /// `VACUUM` cannot run inside a transaction, so compaction runs first on
   /// its own; `ANALYZE` and `PRAGMA optimize` then run as one transaction.
   pub async fn optimize(&self) -> Result<()> {
      let _exclusive = self.inner.exclusive.lock().await;

      let result = self.run_optimization().await;
      if result.is_ok() {
         self.inner.stats.record_optimization();
      }
      self.finish_maintenance("optimize", result, |success| {
         DatabaseEvent::OptimizationCompleted { success }
      })
   }

   /// Rebuild every index.
   pub async fn reindex(&self) -> Result<()> {
      self
         .execute_transaction(|tx| {
            Box::pin(async move { tx.execute("REINDEX", vec![]).await.map(|_| true) })
         })
         .await
   }

   /// Run SQLite's consistency check.
   ///
   /// Returns `Ok(false)` when the check reports any problem; the findings are
   /// logged and published as a database error event.
   pub async fn check_integrity(&self) -> Result<bool> {
      debug!("Checking database integrity");
      let rows = self.select("PRAGMA integrity_check", vec![]).await?;
      if rows.is_empty() {
         error!("Integrity check returned no result");
         return Err(Error::Maintenance(
            "integrity check returned no result".into(),
         ));
      }

      let problems: Vec<&str> = rows
         .iter()
         .filter_map(|row| row.get("integrity_check").and_then(JsonValue::as_str))
         .filter(|result| *result != "ok")
         .collect();

      if problems.is_empty() {
         debug!("Database integrity check passed");
         return Ok(true);
      }

      let message = format!("integrity check failed: {}", problems.join("; "));
      error!(problems = problems.len(), "{message}");
      self.inner.events.emit(DatabaseEvent::DatabaseError {
         message,
         sql: Some("PRAGMA integrity_check".into()),
      });
      Ok(false)
   }

   async fn restore_from(&self, source: &Path) -> Result<()> {
      if !fs::try_exists(source).await? {
         return Err(Error::Maintenance(format!(
            "backup file does not exist: {}",
            source.display()
         )));
      }

      let pool = self.pool()?;
      let path = pool.path().to_path_buf();
      let busy_timeout = pool.config().busy_timeout;

      // Every pooled connection must be back before the file is touched
      pool.suspend(pool.config().acquire_timeout).await?;
      if let Err(e) = self.inner.default_conn.close().await {
         warn!(error = %e, "Error closing default connection before restore");
      }

      let swapped = swap_database_file(&path, source, busy_timeout).await;

      // Whatever happened, the file at `path` is now the one to serve
      let reopened = match open_connection(&path, busy_timeout).await {
         Ok(conn) => self
            .inner
            .default_conn
            .replace(conn)
            .await
            .map_err(Error::Transaction),
         Err(e) => Err(e.into()),
      };
      pool.resume();

      swapped?;
      reopened
   }

   async fn run_optimization(&self) -> Result<()> {
      debug!("Starting database optimization");
      {
         let (_pool, mut conn) = self.checkout().await?;
         execute_on(&mut conn, "VACUUM", vec![])
            .await
            .map_err(|e| Error::query(e, "VACUUM"))?;
      }

      self
         .execute_transaction(|tx| {
            Box::pin(async move {
               tx.execute("ANALYZE", vec![]).await?;
               tx.execute("PRAGMA optimize", vec![]).await.map(|_| true)
            })
         })
         .await
   }

   /// Log the outcome of a maintenance operation and publish its completion
   /// event.
   fn finish_maintenance(
      &self,
      operation: &str,
      result: Result<()>,
      event: impl FnOnce(bool) -> DatabaseEvent,
   ) -> Result<()> {
      match &result {
         Ok(()) => debug!(operation, "Database maintenance completed"),
         Err(e) => error!(operation, error = %e, "Database maintenance failed"),
      }
      self.inner.events.emit(event(result.is_ok()));
      result
   }
}

/// `<db>.restore_backup`
fn safety_copy_path(path: &Path) -> PathBuf {
   let mut name = OsString::from(path.as_os_str());
   name.push(SAFETY_COPY_SUFFIX);
   PathBuf::from(name)
}

async fn copy_database(source: &Path, destination: &Path) -> Result<()> {
   if !fs::try_exists(source).await? {
      return Err(Error::Maintenance(format!(
         "database file does not exist: {}",
         source.display()
      )));
   }

   if let Some(parent) = destination.parent()
      && !parent.as_os_str().is_empty()
   {
      fs::create_dir_all(parent).await?;
   }
   remove_if_exists(destination).await?;

   let bytes = fs::copy(source, destination).await?;
   debug!(
      destination = %destination.display(),
      bytes,
      "Database file copied"
   );
   Ok(())
}

/// Put `source` in place of the database at `path`, keeping the current file
/// as a safety copy until the new one validates.
async fn swap_database_file(path: &Path, source: &Path, busy_timeout: Duration) -> Result<()> {
   let safety = safety_copy_path(path);
   remove_if_exists(&safety).await?;

   let had_current = fs::try_exists(path).await?;
   if had_current {
      fs::copy(path, &safety).await?;
      fs::remove_file(path).await?;
   }

   let installed = match fs::copy(source, path).await {
      Ok(_) => validate_database(path, busy_timeout).await,
      Err(e) => Err(e.into()),
   };

   match installed {
      Ok(()) => {
         remove_if_exists(&safety).await?;
         debug!(source = %source.display(), "Database restored");
         Ok(())
      }
      Err(e) => {
         warn!(error = %e, "Restored database is unusable; reverting");
         revert(path, &safety, had_current).await;
         Err(e)
      }
   }
}

async fn revert(path: &Path, safety: &Path, had_current: bool) {
   if let Err(e) = remove_if_exists(path).await {
      error!(error = %e, "Failed to remove restored database file");
   }
   if !had_current {
      return;
   }

   match fs::copy(safety, path).await {
      Ok(_) => {
         if let Err(e) = remove_if_exists(safety).await {
            warn!(error = %e, "Failed to remove restore safety copy");
         }
      }
      Err(e) => error!(
         error = %e,
         safety = %safety.display(),
         "Failed to revert to safety copy"
      ),
   }
}

/// Open `path` and read its schema.
async fn validate_database(path: &Path, busy_timeout: Duration) -> Result<()> {
   let mut conn = open_connection(path, busy_timeout)
      .await
      .map_err(|e| Error::Maintenance(format!("restored file cannot be opened: {e}")))?;

   let checked = fetch_all_on(&mut conn, "SELECT COUNT(*) FROM sqlite_master", vec![]).await;
   if let Err(e) = conn.close().await {
      warn!(error = %e, "Error closing validation connection");
   }

   checked
      .map(|_| ())
      .map_err(|e| Error::Maintenance(format!("restored file is not a valid database: {e}")))
}

async fn remove_if_exists(path: &Path) -> Result<()> {
   match fs::remove_file(path).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
   }
}
