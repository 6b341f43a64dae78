//! Usage statistics and connection introspection

use std::path::PathBuf;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;

/// Counters kept by the service.
///
/// Guarded by their own lock so updating them never contends with the pool.
#[derive(Debug, Default)]
pub(crate) struct Statistics {
   counters: Mutex<Counters>,
}

#[derive(Debug, Default, Clone)]
struct Counters {
   total_queries: u64,
   failed_queries: u64,
   total_transactions: u64,
   failed_transactions: u64,
   last_optimization: Option<OffsetDateTime>,
}

impl Statistics {
   pub(crate) fn record_query(&self, success: bool) {
      let mut counters = self.counters.lock();
      counters.total_queries += 1;
      if !success {
         counters.failed_queries += 1;
      }
   }

   /// Account for statements issued inside a transaction
   pub(crate) fn record_statements(&self, total: u64, failed: u64) {
      let mut counters = self.counters.lock();
      counters.total_queries += total;
      counters.failed_queries += failed;
   }

   pub(crate) fn record_transaction(&self, success: bool) {
      let mut counters = self.counters.lock();
      counters.total_transactions += 1;
      if !success {
         counters.failed_transactions += 1;
      }
   }

   pub(crate) fn record_optimization(&self) {
      self.counters.lock().last_optimization = Some(OffsetDateTime::now_utc());
   }

   /// Copy the counters into `stats`
   pub(crate) fn fill(&self, stats: &mut DatabaseStats) {
      let counters = self.counters.lock().clone();
      stats.total_queries = counters.total_queries;
      stats.failed_queries = counters.failed_queries;
      stats.total_transactions = counters.total_transactions;
      stats.failed_transactions = counters.failed_transactions;
      stats.last_optimization = counters.last_optimization;
   }
}

/// Snapshot returned by [`DatabaseService::get_stats`](crate::DatabaseService::get_stats)
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
   pub total_queries: u64,
   pub failed_queries: u64,
   pub total_transactions: u64,
   pub failed_transactions: u64,
   /// Recovery passes run against the pool
   pub recoveries: u64,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_optimization: Option<OffsetDateTime>,
   pub database_path: PathBuf,
   /// Size of the database file in bytes; 0 when it cannot be read
   pub database_size: u64,
   #[serde(with = "time::serde::rfc3339::option")]
   pub last_modified: Option<OffsetDateTime>,
   pub max_connections: usize,
   /// Open slots in the pool
   pub active_connections: usize,
   pub connections_in_use: usize,
}

/// Diagnostic view of one pooled connection
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
   pub name: String,
   pub database_path: PathBuf,
   pub driver_name: String,
   pub is_valid: bool,
   pub in_use: bool,
   #[serde(with = "time::serde::rfc3339")]
   pub last_used: OffsetDateTime,
   pub use_count: u64,
}
