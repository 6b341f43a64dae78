//! Minimal bootstrap schema

use sqlx::sqlite::SqliteConnection;
use sqlx_sqlite_toolkit::{execute_on, fetch_all_on};
use tracing::debug;

/// Version recorded in `schema_version` on first open
pub const SCHEMA_VERSION: i64 = 1;

/// Create the `schema_version` marker in a database that has no tables yet.
///
/// Databases that already contain any table are left alone; everything
/// beyond the marker belongs to the application. Returns whether the marker
/// was created.
pub(crate) async fn bootstrap(conn: &mut SqliteConnection) -> sqlx_sqlite_toolkit::Result<bool> {
   let tables = fetch_all_on(
      conn,
      "SELECT name FROM sqlite_master WHERE type = 'table' LIMIT 1",
      vec![],
   )
   .await?;

   if !tables.is_empty() {
      debug!("Database schema already exists");
      return Ok(false);
   }

   debug!("Creating initial database schema");
   execute_on(
      conn,
      "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY, applied_at DATETIME DEFAULT CURRENT_TIMESTAMP)",
      vec![],
   )
   .await?;
   execute_on(
      conn,
      "INSERT OR IGNORE INTO schema_version (version) VALUES (?)",
      vec![SCHEMA_VERSION.into()],
   )
   .await?;
   Ok(true)
}
