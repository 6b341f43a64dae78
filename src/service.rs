//! The database service: lifecycle, queries and transactions

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::Value as JsonValue;
use sqlx_sqlite_conn_pool::{ConnectionPool, DRIVER_NAME, PooledConnection, open_connection};
use sqlx_sqlite_toolkit::{
   DefaultConnection, Query, Row, Transaction, TransactionOutcome, WriteQueryResult, execute_on,
   fetch_all_on, reject_nested_transaction, run_transaction,
};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::config::DatabaseConfig;
use crate::events::{DatabaseEvent, EventBus, EventStream};
use crate::schema;
use crate::stats::{ConnectionInfo, DatabaseStats, Statistics};
use crate::{Error, Result};

pub(crate) struct ServiceInner {
   pub(crate) config: Mutex<DatabaseConfig>,
   pub(crate) pool: RwLock<Option<ConnectionPool>>,
   pub(crate) default_conn: Arc<DefaultConnection>,
   pub(crate) events: EventBus,
   pub(crate) stats: Statistics,
   /// Serializes start, shutdown and file-level maintenance
   pub(crate) exclusive: tokio::sync::Mutex<()>,
}

/// Pooled access to one SQLite database file.
///
/// Cheap to clone; clones share the pool, statistics and event channel.
///
/// ```no_run
/// # async fn demo() -> sqlite_db_service::Result<()> {
/// use serde_json::json;
/// use sqlite_db_service::{DatabaseConfig, DatabaseService};
///
/// let db = DatabaseService::open(DatabaseConfig::default()).await?;
///
/// db.execute("CREATE TABLE IF NOT EXISTS music (title TEXT)", vec![]).await?;
/// db.execute_transaction(|tx| {
///    Box::pin(async move {
///       tx.execute("INSERT INTO music (title) VALUES (?)", vec![json!("Intro")])
///          .await
///          .map(|_| true)
///    })
/// })
/// .await?;
///
/// let rows = db.select("SELECT title FROM music", vec![]).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DatabaseService {
   pub(crate) inner: Arc<ServiceInner>,
}

impl DatabaseService {
   /// Create a stopped service. Call [`start`](Self::start) to open the database.
   pub fn new(config: DatabaseConfig) -> Self {
      let events = EventBus::new(config.event_capacity);
      Self {
         inner: Arc::new(ServiceInner {
            config: Mutex::new(config),
            pool: RwLock::new(None),
            default_conn: DefaultConnection::closed(),
            events,
            stats: Statistics::default(),
            exclusive: tokio::sync::Mutex::new(()),
         }),
      }
   }

   /// Create and start a service.
   pub async fn open(config: DatabaseConfig) -> Result<Self> {
      let service = Self::new(config);
      service.start().await?;
      Ok(service)
   }

   /// Open the database.
   ///
   /// Creates missing parent directories, validates the file with a test
   /// connection, bootstraps the schema marker on an empty database, then
   /// brings up the pool, the default connection and the idle sweep. Starting
   /// a running service does nothing.
   pub async fn start(&self) -> Result<()> {
      let _exclusive = self.inner.exclusive.lock().await;
      if self.is_running() {
         debug!("Database service already running");
         return Ok(());
      }

      let config = self.inner.config.lock().clone();
      let path = config.path.clone();
      prepare_path(&path).await?;
      debug!(path = %path.display(), "Starting database service");

      let mut test_conn = open_connection(&path, config.pool.busy_timeout)
         .await
         .inspect_err(|e| error!(error = %e, path = %path.display(), "Failed to open database"))?;

      schema::bootstrap(&mut test_conn).await.map_err(|e| {
         error!(error = %e, "Failed to initialize database schema");
         Error::Configuration(format!("failed to initialize database schema: {e}"))
      })?;

      let pool = ConnectionPool::new(&path, config.pool.clone());
      pool.adopt(test_conn).await?;

      let default_conn = match open_connection(&path, config.pool.busy_timeout).await {
         Ok(conn) => conn,
         Err(e) => {
            error!(error = %e, "Failed to open default connection");
            pool.shutdown().await;
            return Err(e.into());
         }
      };
      if let Err(e) = self.inner.default_conn.replace(default_conn).await {
         warn!(error = %e, "Error closing previous default connection");
      }

      pool.start_cleanup();
      *self.inner.pool.write() = Some(pool);
      debug!(path = %path.display(), "Database service started");
      Ok(())
   }

   /// Stop the service.
   ///
   /// Pending and future operations fail with a "service unavailable"
   /// connection error. Idle connections close now; connections in use close
   /// when released.
   pub async fn shutdown(&self) {
      let _exclusive = self.inner.exclusive.lock().await;
      let pool = self.inner.pool.write().take();
      if let Some(pool) = pool {
         pool.shutdown().await;
      }
      if let Err(e) = self.inner.default_conn.close().await {
         warn!(error = %e, "Error closing default connection");
      }
      debug!("Database service stopped");
   }

   pub fn is_running(&self) -> bool {
      self.inner.pool.read().as_ref().is_some_and(|pool| !pool.is_closed())
   }

   pub fn database_path(&self) -> PathBuf {
      self.inner.config.lock().path.clone()
   }

   /// Point the service at another database file.
   ///
   /// Only allowed while the service is stopped.
   pub fn set_database_path(&self, path: impl Into<PathBuf>) -> Result<()> {
      let busy = self.inner.exclusive.try_lock().is_err();
      if busy || self.is_running() {
         warn!("Cannot change database path while service is running");
         return Err(Error::Configuration(
            "cannot change database path while service is running".into(),
         ));
      }
      self.inner.config.lock().path = path.into();
      Ok(())
   }

   pub fn max_connections(&self) -> usize {
      self.inner.config.lock().pool.max_connections
   }

   /// Change the pool bound. Values below 1 are rejected and the current
   /// bound is kept. Shrinking closes idle connections only.
   pub async fn set_max_connections(&self, max_connections: usize) -> Result<()> {
      if max_connections < 1 {
         warn!(max_connections, "Maximum connections must be at least 1");
         return Err(sqlx_sqlite_conn_pool::Error::InvalidMaxConnections(max_connections).into());
      }

      self.inner.config.lock().pool.max_connections = max_connections;
      let pool = self.inner.pool.read().clone();
      if let Some(pool) = pool {
         pool.set_max_connections(max_connections).await?;
      }
      debug!(max_connections, "Maximum connections set");
      Ok(())
   }

   /// Receive every event published from now on.
   pub fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
      self.inner.events.subscribe()
   }

   /// Like [`subscribe`](Self::subscribe), as a `Stream`.
   pub fn subscribe_stream(&self) -> EventStream {
      EventStream::new(self.inner.events.subscribe())
   }

   /// A query on the service's default connection.
   ///
   /// Never fails: while the service is stopped the returned query is
   /// invalid, so check [`Query::is_valid`] before relying on it.
   pub fn create_query(&self) -> Query {
      Query::new(&self.inner.default_conn)
   }

   /// Execute a write statement on a pooled connection.
   pub async fn execute(&self, sql: &str, values: Vec<JsonValue>) -> Result<WriteQueryResult> {
      let (pool, mut conn) = self
         .checkout()
         .await
         .map_err(|e| self.query_failed("execute", sql, e))?;
      let result = execute_on(&mut conn, sql, values).await;
      drop(conn);
      self.settle_query(&pool, "execute", sql, result).await
   }

   /// Run a query on a pooled connection and return every row, in column
   /// order. No matching rows is an empty vector.
   pub async fn select(&self, sql: &str, values: Vec<JsonValue>) -> Result<Vec<Row>> {
      let (pool, mut conn) = self
         .checkout()
         .await
         .map_err(|e| self.query_failed("select", sql, e))?;
      let result = fetch_all_on(&mut conn, sql, values).await;
      drop(conn);
      self.settle_query(&pool, "select", sql, result).await
   }

   /// Run `work` as one atomic transaction on a pooled connection.
   ///
   /// `Ok(true)` from the work commits. `Ok(false)`, an error, a panic or any
   /// failed statement rolls everything back, even one whose error the work
   /// ignored; the reason is returned as [`Error::Transaction`]. The
   /// connection is held for the whole unit, so keep the work short.
   ///
   /// Nested units go through [`Transaction::execute_transaction`] on the
   /// handle passed to `work` and become part of this transaction. Calling
   /// this method again from inside `work` fails at once with
   /// `TRANSACTION_NESTED` and the outer transaction rolls back.
   pub async fn execute_transaction<F>(&self, work: F) -> Result<()>
   where
      F: for<'t> FnOnce(&'t mut Transaction<'_>) -> BoxFuture<'t, sqlx_sqlite_toolkit::Result<bool>>
         + Send,
   {
      if let Err(e) = reject_nested_transaction() {
         let e = Error::Transaction(e);
         self.report(&e, None);
         return Err(e);
      }

      let (pool, mut conn) = match self.checkout().await {
         Ok(checked_out) => checked_out,
         Err(e) => {
            error!(error = %e, "Failed to get database connection for transaction");
            self.report(&e, None);
            return Err(e);
         }
      };

      self.inner.events.emit(DatabaseEvent::TransactionStarted);
      let report = run_transaction(&mut conn, work).await;
      if report.outcome.connection_unhealthy() {
         conn.mark_broken();
      }
      drop(conn);

      let stats = &self.inner.stats;
      stats.record_statements(report.statements, report.failures.len() as u64);
      stats.record_transaction(report.outcome.is_committed());
      for failure in &report.failures {
         self.inner.events.emit(DatabaseEvent::DatabaseError {
            message: failure.message.clone(),
            sql: Some(failure.sql.clone()),
         });
      }

      match &report.outcome {
         TransactionOutcome::Committed => {
            self.inner.events.emit(DatabaseEvent::TransactionCommitted);
         }
         TransactionOutcome::RolledBack(e) | TransactionOutcome::CommitFailed(e) => {
            self.inner.events.emit(DatabaseEvent::TransactionRolledBack {
               reason: e.to_string(),
            });
         }
         TransactionOutcome::BeginFailed(_) | TransactionOutcome::RollbackFailed(_) => {}
      }

      let recoverable = report.failures.iter().any(|f| f.recoverable)
         || report.outcome.error().is_some_and(|e| e.is_recoverable());

      let result = report.outcome.into_result().map_err(Error::Transaction);
      if let Err(e) = &result {
         error!(transaction = %report.id, error = %e, "Transaction failed");
         self.report(e, None);
         if recoverable {
            // Failure already reported by `recover`
            let _ = self.recover(&pool).await;
         }
      }
      result
   }

   /// Close and reopen every pooled connection once.
   ///
   /// Also the way out of a degraded pool after the underlying problem has
   /// been fixed.
   pub async fn reconnect(&self) -> Result<()> {
      let pool = self.pool()?;
      self.recover(&pool).await
   }

   /// Version recorded in the `schema_version` marker table
   pub async fn schema_version(&self) -> Result<Option<i64>> {
      let rows = self
         .select("SELECT MAX(version) AS version FROM schema_version", vec![])
         .await?;
      Ok(rows
         .first()
         .and_then(|row| row.get("version"))
         .and_then(JsonValue::as_i64))
   }

   /// Counters, pool occupancy and database file details
   pub async fn get_stats(&self) -> DatabaseStats {
      let mut stats = DatabaseStats::default();
      self.inner.stats.fill(&mut stats);

      let (path, max_connections) = {
         let config = self.inner.config.lock();
         (config.path.clone(), config.pool.max_connections)
      };
      stats.max_connections = max_connections;

      let pool = self.inner.pool.read().clone();
      if let Some(pool) = pool {
         stats.recoveries = pool.recoveries();
         stats.active_connections = pool.size();
         stats.connections_in_use = pool.in_use();
      }

      if let Ok(metadata) = tokio::fs::metadata(&path).await {
         stats.database_size = metadata.len();
         stats.last_modified = metadata.modified().ok().map(OffsetDateTime::from);
      }
      stats.database_path = path;
      stats
   }

   /// One entry per pooled connection; empty while stopped.
   pub fn get_connection_info(&self) -> Vec<ConnectionInfo> {
      let Some(pool) = self.inner.pool.read().clone() else {
         return Vec::new();
      };

      pool
         .slots()
         .into_iter()
         .map(|slot| ConnectionInfo {
            name: slot.name,
            database_path: pool.path().to_path_buf(),
            driver_name: DRIVER_NAME.to_string(),
            is_valid: slot.is_open,
            in_use: slot.in_use,
            last_used: slot.last_used,
            use_count: slot.use_count,
         })
         .collect()
   }

   pub(crate) fn pool(&self) -> Result<ConnectionPool> {
      self
         .inner
         .pool
         .read()
         .clone()
         .ok_or(Error::Connection(sqlx_sqlite_conn_pool::Error::Unavailable))
   }

   pub(crate) async fn checkout(&self) -> Result<(ConnectionPool, PooledConnection)> {
      let pool = self.pool()?;
      let conn = pool.acquire().await?;
      Ok((pool, conn))
   }

   /// Run a recovery pass and publish its outcome.
   pub(crate) async fn recover(&self, pool: &ConnectionPool) -> Result<()> {
      warn!("Attempting database connection recovery");
      let result = pool.recover().await;
      if let Err(e) = &result {
         error!(error = %e, "Database connection recovery failed");
      }
      self.inner.events.emit(DatabaseEvent::RecoveryCompleted {
         success: result.is_ok(),
      });
      result.map_err(Error::from)
   }

   /// Publish `error` as a [`DatabaseEvent::DatabaseError`].
   pub(crate) fn report(&self, error: &Error, sql: Option<&str>) {
      self.inner.events.emit(DatabaseEvent::DatabaseError {
         message: error.to_string(),
         sql: sql.or(error.sql()).map(str::to_string),
      });
   }

   fn query_failed(&self, operation: &str, sql: &str, error: Error) -> Error {
      self.inner.stats.record_query(false);
      error!(operation, error = %error, sql, "SQL error");
      self.report(&error, Some(sql));
      error
   }

   async fn settle_query<T>(
      &self,
      pool: &ConnectionPool,
      operation: &str,
      sql: &str,
      result: sqlx_sqlite_toolkit::Result<T>,
   ) -> Result<T> {
      match result {
         Ok(value) => {
            self.inner.stats.record_query(true);
            Ok(value)
         }
         Err(e) => {
            let error = self.query_failed(operation, sql, Error::query(e, sql));
            if error.is_recoverable() {
               // Failure already reported by `recover`
               let _ = self.recover(pool).await;
            }
            Err(error)
         }
      }
   }
}

impl std::fmt::Debug for DatabaseService {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("DatabaseService")
         .field("path", &self.database_path())
         .field("running", &self.is_running())
         .finish()
   }
}

/// Reject unusable paths and create missing parent directories.
async fn prepare_path(path: &Path) -> Result<()> {
   if path.as_os_str().is_empty() {
      return Err(Error::Configuration("database path is empty".into()));
   }
   if tokio::fs::metadata(path).await.is_ok_and(|m| m.is_dir()) {
      return Err(Error::Configuration(format!(
         "database path is a directory: {}",
         path.display()
      )));
   }

   if let Some(parent) = path.parent()
      && !parent.as_os_str().is_empty()
   {
      tokio::fs::create_dir_all(parent).await.map_err(|e| {
         Error::Configuration(format!(
            "cannot create database directory {}: {e}",
            parent.display()
         ))
      })?;
   }
   Ok(())
}
