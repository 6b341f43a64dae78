//! RAII guard for a connection checked out of the pool

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use sqlx::sqlite::SqliteConnection;

use crate::pool::PoolInner;

/// Exclusive handle to one pooled connection.
///
/// Derefs to [`SqliteConnection`], so it can be passed straight to sqlx
/// executors with `&mut *conn`. Dropping the guard hands the connection back
/// to its slot and wakes one task waiting in `acquire`, on every exit path.
///
/// A guard marked with [`mark_broken`](Self::mark_broken) is discarded on drop
/// instead of being returned, and its slot is removed from the pool.
#[must_use = "if unused, the connection is immediately returned to the pool"]
pub struct PooledConnection {
   conn: Option<SqliteConnection>,
   slot_id: u64,
   name: String,
   broken: bool,
   pool: Arc<PoolInner>,
}

impl PooledConnection {
   pub(crate) fn new(conn: SqliteConnection, slot_id: u64, name: String, pool: Arc<PoolInner>) -> Self {
      Self {
         conn: Some(conn),
         slot_id,
         name,
         broken: false,
         pool,
      }
   }

   /// Diagnostic name of the slot this connection belongs to
   pub fn name(&self) -> &str {
      &self.name
   }

   /// Do not return this connection to the pool when the guard drops.
   ///
   /// Used when the connection is left in an unknown state, for example after
   /// a failed ROLLBACK.
   pub fn mark_broken(&mut self) {
      self.broken = true;
   }

   pub fn is_broken(&self) -> bool {
      self.broken
   }
}

impl Deref for PooledConnection {
   type Target = SqliteConnection;

   fn deref(&self) -> &Self::Target {
      self.conn.as_ref().expect("connection already returned")
   }
}

impl DerefMut for PooledConnection {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.conn.as_mut().expect("connection already returned")
   }
}

impl Drop for PooledConnection {
   fn drop(&mut self) {
      if let Some(conn) = self.conn.take() {
         self.pool.release(self.slot_id, conn, self.broken);
      }
   }
}

impl std::fmt::Debug for PooledConnection {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("PooledConnection")
         .field("name", &self.name)
         .field("broken", &self.broken)
         .finish_non_exhaustive()
   }
}
