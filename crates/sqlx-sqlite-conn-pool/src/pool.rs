//! Bounded pool of SQLite connections

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::Connection;
use sqlx::sqlite::SqliteConnection;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::cleanup;
use crate::config::PoolConfig;
use crate::connection::{Connector, SqliteConnector};
use crate::guard::PooledConnection;
use crate::{Error, Result};

/// Lifecycle state of the pool as seen by `acquire`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "camelCase")]
pub enum PoolStatus {
   /// Handing out connections normally
   Open,
   /// Temporarily withdrawn (database file being replaced); `acquire` waits
   Offline,
   /// A recovery pass failed; `acquire` fails fast with the stored reason
   Degraded(String),
   /// Shut down; `acquire` fails immediately
   Closed,
}

/// Snapshot of one slot, for diagnostics
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotInfo {
   pub name: String,
   pub in_use: bool,
   /// False while the slot's connection is closed for reopening
   pub is_open: bool,
   #[serde(with = "time::serde::rfc3339")]
   pub last_used: OffsetDateTime,
   pub use_count: u64,
}

/// A pool-managed wrapper around one connection.
///
/// While the slot is in use its connection lives in the caller's
/// [`PooledConnection`] guard and `conn` is `None`.
struct Slot {
   id: u64,
   name: String,
   conn: Option<SqliteConnection>,
   in_use: bool,
   generation: u64,
   last_used: Instant,
   last_used_at: OffsetDateTime,
   use_count: u64,
}

impl Slot {
   fn new(id: u64, conn: Option<SqliteConnection>, in_use: bool, generation: u64) -> Self {
      Self {
         id,
         name: format!("sqlite_pool_{id}"),
         conn,
         in_use,
         generation,
         last_used: Instant::now(),
         last_used_at: OffsetDateTime::now_utc(),
         use_count: 0,
      }
   }

   fn touch(&mut self) {
      self.last_used = Instant::now();
      self.last_used_at = OffsetDateTime::now_utc();
   }

   fn is_claimable(&self) -> bool {
      !self.in_use && self.conn.is_some()
   }

   fn info(&self) -> SlotInfo {
      SlotInfo {
         name: self.name.clone(),
         in_use: self.in_use,
         is_open: self.in_use || self.conn.is_some(),
         last_used: self.last_used_at,
         use_count: self.use_count,
      }
   }
}

struct PoolState {
   slots: Vec<Slot>,
   /// Slots reserved by tasks currently opening a connection
   pending: usize,
   max_connections: usize,
   /// Bumped whenever every outstanding connection must be considered stale
   generation: u64,
   status: PoolStatus,
}

pub(crate) struct PoolInner {
   path: PathBuf,
   config: PoolConfig,
   connector: Box<dyn Connector>,
   state: Mutex<PoolState>,
   available: Notify,
   next_id: AtomicU64,
   recoveries: AtomicU64,
   recovery_lock: tokio::sync::Mutex<()>,
   cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
   /// Return a connection to its slot. Called from the guard's `Drop`.
   pub(crate) fn release(&self, slot_id: u64, conn: SqliteConnection, broken: bool) {
      let (discarded, offline) = {
         let mut state = self.state.lock();
         let offline = state.status == PoolStatus::Offline;
         let generation = state.generation;
         let closed = state.status == PoolStatus::Closed;
         let over_limit = state.slots.len() > state.max_connections;

         let discarded = match state.slots.iter().position(|s| s.id == slot_id) {
            Some(pos) if broken || closed || over_limit || state.slots[pos].generation != generation => {
               let slot = state.slots.remove(pos);
               debug!(slot = %slot.name, broken, "Discarding released connection");
               Some(conn)
            }
            Some(pos) => {
               let slot = &mut state.slots[pos];
               slot.conn = Some(conn);
               slot.in_use = false;
               slot.touch();
               None
            }
            None => Some(conn),
         };
         (discarded, offline)
      };

      // SqliteConnection closes its handle when dropped
      drop(discarded);
      self.wake(offline);
   }

   /// Wake after capacity came back. While offline, `suspend` may be draining
   /// alongside waiting acquirers, so everyone rechecks.
   fn wake(&self, offline: bool) {
      if offline {
         self.available.notify_waiters();
      } else {
         self.available.notify_one();
      }
   }
}

impl Drop for PoolInner {
   fn drop(&mut self) {
      if let Some(handle) = self.cleanup.get_mut().take() {
         handle.abort();
      }
   }
}

/// Capacity held for a connection that is still being opened.
///
/// Dropped unsettled (the opening future was cancelled), it gives the capacity
/// back and wakes a waiter.
struct Reservation {
   inner: Arc<PoolInner>,
   generation: u64,
   settled: bool,
}

impl Reservation {
   /// Reserve one slot of capacity. Caller holds the state lock.
   fn take(inner: &Arc<PoolInner>, state: &mut PoolState) -> Self {
      state.pending += 1;
      Self {
         inner: Arc::clone(inner),
         generation: state.generation,
         settled: false,
      }
   }

   /// Release the capacity under a lock the caller already holds.
   fn settle(&mut self, state: &mut PoolState) {
      if !self.settled {
         state.pending -= 1;
         self.settled = true;
      }
   }
}

impl Drop for Reservation {
   fn drop(&mut self) {
      if !self.settled {
         let offline = {
            let mut state = self.inner.state.lock();
            state.pending -= 1;
            state.status == PoolStatus::Offline
         };
         self.inner.wake(offline);
      }
   }
}

enum Claim {
   Ready(PooledConnection),
   Open(Reservation),
   Wait,
}

/// Bounded pool of SQLite connections to a single database file.
///
/// ## Slots
///
/// Connections are opened lazily, one slot at a time, up to
/// `max_connections`. Each slot tracks whether it is in use, when it was last
/// used and how many times it has been handed out.
///
/// ## Acquiring
///
/// [`acquire`](Self::acquire) claims an idle slot, opens a new one while under
/// the bound, or waits until a slot is released. The scan-and-claim step runs
/// under one lock, so a slot can never be claimed twice. Waiting is bounded by
/// the acquire timeout.
///
/// ## Recovery
///
/// When opening a connection fails with a transient error (locked, busy, I/O),
/// the pool closes and reopens its idle connections once before surfacing the
/// error. If reopening fails the pool is marked degraded and `acquire` fails
/// fast until [`recover`](Self::recover) succeeds.
#[derive(Clone)]
pub struct ConnectionPool {
   inner: Arc<PoolInner>,
}

impl ConnectionPool {
   /// Create an empty pool for the database at `path`.
   pub fn new(path: impl Into<PathBuf>, config: PoolConfig) -> Self {
      let connector = SqliteConnector::new(config.busy_timeout);
      Self::with_connector(path, config, connector)
   }

   /// Create an empty pool that opens its connections through `connector`.
   pub fn with_connector(path: impl Into<PathBuf>, config: PoolConfig, connector: impl Connector) -> Self {
      let max_connections = config.max_connections.max(1);
      Self {
         inner: Arc::new(PoolInner {
            path: path.into(),
            state: Mutex::new(PoolState {
               slots: Vec::with_capacity(max_connections),
               pending: 0,
               max_connections,
               generation: 0,
               status: PoolStatus::Open,
            }),
            config,
            connector: Box::new(connector),
            available: Notify::new(),
            next_id: AtomicU64::new(1),
            recoveries: AtomicU64::new(0),
            recovery_lock: tokio::sync::Mutex::new(()),
            cleanup: Mutex::new(None),
         }),
      }
   }

   pub(crate) fn from_inner(inner: Arc<PoolInner>) -> Self {
      Self { inner }
   }

   /// Start the periodic idle sweep. Calling this more than once is a no-op.
   ///
   /// Must be called from within a Tokio runtime.
   pub fn start_cleanup(&self) {
      let mut handle = self.inner.cleanup.lock();
      if handle.is_none() {
         *handle = Some(cleanup::spawn(
            Arc::downgrade(&self.inner),
            self.inner.config.cleanup_interval,
            self.inner.config.idle_timeout,
         ));
      }
   }

   /// Path of the database file this pool connects to
   pub fn path(&self) -> &Path {
      &self.inner.path
   }

   pub fn config(&self) -> &PoolConfig {
      &self.inner.config
   }

   pub fn status(&self) -> PoolStatus {
      self.inner.state.lock().status.clone()
   }

   pub fn max_connections(&self) -> usize {
      self.inner.state.lock().max_connections
   }

   /// Number of slots currently in the pool
   pub fn size(&self) -> usize {
      self.inner.state.lock().slots.len()
   }

   /// Number of slots currently checked out
   pub fn in_use(&self) -> usize {
      self.inner.state.lock().slots.iter().filter(|s| s.in_use).count()
   }

   /// Number of recovery passes run so far
   pub fn recoveries(&self) -> u64 {
      self.inner.recoveries.load(Ordering::Relaxed)
   }

   pub fn slots(&self) -> Vec<SlotInfo> {
      self.inner.state.lock().slots.iter().map(Slot::info).collect()
   }

   /// Acquire a connection, waiting up to the configured acquire timeout.
   pub async fn acquire(&self) -> Result<PooledConnection> {
      self.acquire_timeout(self.inner.config.acquire_timeout).await
   }

   /// Acquire a connection, waiting at most `timeout` for a slot to free up.
   pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection> {
      let deadline = tokio::time::Instant::now() + timeout;

      loop {
         // Register for wakeups before inspecting the slots so a release that
         // lands in between is not missed
         let notified = self.inner.available.notified();
         tokio::pin!(notified);
         notified.as_mut().enable();

         match self.try_claim()? {
            Claim::Ready(conn) => return Ok(conn),
            Claim::Open(reservation) => {
               if let Some(conn) = self.open_reserved(reservation).await? {
                  return Ok(conn);
               }
               continue;
            }
            Claim::Wait => {}
         }

         if tokio::time::timeout_at(deadline, notified).await.is_err() {
            warn!(timeout = ?timeout, "Timed out waiting for a database connection");
            return Err(Error::Timeout(timeout));
         }
      }
   }

   fn try_claim(&self) -> Result<Claim> {
      let mut state = self.inner.state.lock();

      match &state.status {
         PoolStatus::Open => {}
         PoolStatus::Offline => return Ok(Claim::Wait),
         PoolStatus::Degraded(reason) => return Err(Error::Degraded(reason.clone())),
         PoolStatus::Closed => return Err(Error::Unavailable),
      }

      if let Some(slot) = state.slots.iter_mut().find(|s| s.is_claimable())
         && let Some(conn) = slot.conn.take()
      {
         slot.in_use = true;
         slot.use_count += 1;
         slot.touch();
         return Ok(Claim::Ready(PooledConnection::new(
            conn,
            slot.id,
            slot.name.clone(),
            Arc::clone(&self.inner),
         )));
      }

      if state.slots.len() + state.pending < state.max_connections {
         return Ok(Claim::Open(Reservation::take(&self.inner, &mut state)));
      }

      Ok(Claim::Wait)
   }

   /// Open a connection for a slot reserved in `try_claim`.
   ///
   /// Returns `Ok(None)` when the pool changed underneath us and the caller
   /// should go back to claiming.
   async fn open_reserved(&self, mut reservation: Reservation) -> Result<Option<PooledConnection>> {
      let generation = reservation.generation;
      let opened = self.inner.connector.connect(&self.inner.path).await;

      let (outcome, offline) = {
         let mut state = self.inner.state.lock();
         reservation.settle(&mut state);
         let offline = state.status == PoolStatus::Offline;

         let outcome = match opened {
            Ok(conn) if state.status == PoolStatus::Closed => {
               drop(conn);
               Err(Error::Unavailable)
            }
            Ok(conn) if state.status != PoolStatus::Open || state.generation != generation => {
               drop(conn);
               Ok(None)
            }
            Ok(conn) => {
               let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
               let mut slot = Slot::new(id, None, true, state.generation);
               slot.use_count = 1;
               let name = slot.name.clone();
               state.slots.push(slot);
               debug!(slot = %name, size = state.slots.len(), "Opened pooled connection");
               Ok(Some(PooledConnection::new(conn, id, name, Arc::clone(&self.inner))))
            }
            Err(e) => Err(e),
         };
         (outcome, offline)
      };

      match outcome {
         Ok(Some(conn)) => Ok(Some(conn)),
         other => {
            // The reservation is gone; let a waiter try in our place
            self.inner.wake(offline);

            if let Err(e) = &other {
               error!(error = %e, "Failed to open pooled connection");
               if e.is_recoverable() {
                  if let Err(recovery_err) = self.recover().await {
                     error!(error = %recovery_err, "Connection recovery failed");
                  }
               }
            }
            other
         }
      }
   }

   /// Add an already-open connection to the pool as an idle slot.
   ///
   /// The connection is closed instead when the pool is full.
   pub async fn adopt(&self, conn: SqliteConnection) -> Result<()> {
      let rejected = {
         let mut state = self.inner.state.lock();
         if state.status == PoolStatus::Closed {
            Some(conn)
         } else if state.slots.len() + state.pending >= state.max_connections {
            debug!("Pool is full; closing adopted connection");
            Some(conn)
         } else {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let generation = state.generation;
            state.slots.push(Slot::new(id, Some(conn), false, generation));
            None
         }
      };

      match rejected {
         None => {
            self.inner.available.notify_one();
            Ok(())
         }
         Some(conn) => {
            let closed = self.status() == PoolStatus::Closed;
            conn.close().await?;
            if closed { Err(Error::Unavailable) } else { Ok(()) }
         }
      }
   }

   /// Change the slot bound.
   ///
   /// Rejects values below 1 and leaves the current bound unchanged. When
   /// shrinking, only idle slots are closed; slots in use are retired as they
   /// are released.
   pub async fn set_max_connections(&self, max_connections: usize) -> Result<()> {
      if max_connections < 1 {
         warn!(max_connections, "Maximum connections must be at least 1");
         return Err(Error::InvalidMaxConnections(max_connections));
      }

      let evicted = {
         let mut state = self.inner.state.lock();
         state.max_connections = max_connections;

         let mut evicted = Vec::new();
         while state.slots.len() > max_connections {
            let Some(pos) = state.slots.iter().rposition(Slot::is_claimable) else {
               break;
            };
            evicted.push(state.slots.remove(pos));
         }
         evicted
      };

      debug!(max_connections, evicted = evicted.len(), "Maximum connections updated");
      close_slots(evicted).await;

      // A larger bound may let waiters open new slots
      self.inner.available.notify_waiters();
      Ok(())
   }

   /// Close every idle slot unused for longer than `idle_timeout`.
   ///
   /// Returns the number of slots evicted. Slots in use are never touched.
   pub async fn evict_idle(&self, idle_timeout: Duration) -> usize {
      let evicted = {
         let mut state = self.inner.state.lock();
         let (evicted, kept): (Vec<Slot>, Vec<Slot>) = std::mem::take(&mut state.slots)
            .into_iter()
            .partition(|s| s.is_claimable() && s.last_used.elapsed() > idle_timeout);
         state.slots = kept;
         evicted
      };

      let count = evicted.len();
      for slot in &evicted {
         debug!(slot = %slot.name, "Cleaning up unused connection");
      }
      close_slots(evicted).await;
      count
   }

   /// Take the pool offline and wait until no connection is checked out.
   ///
   /// Idle slots are closed at once and `acquire` waits from now on.
   /// Connections still in use are closed as they are released. If some are
   /// still out when `timeout` elapses, the pool goes back to its previous
   /// state and [`Error::StillInUse`] is returned. On success the caller owns
   /// the database file until [`resume`](Self::resume).
   pub async fn suspend(&self, timeout: Duration) -> Result<usize> {
      let deadline = tokio::time::Instant::now() + timeout;
      let (idle, previous) = {
         let mut state = self.inner.state.lock();
         if state.status == PoolStatus::Closed {
            return Err(Error::Unavailable);
         }
         let previous = std::mem::replace(&mut state.status, PoolStatus::Offline);
         state.generation += 1;

         let (idle, busy): (Vec<Slot>, Vec<Slot>) =
            std::mem::take(&mut state.slots).into_iter().partition(|s| !s.in_use);
         state.slots = busy;
         (idle, previous)
      };

      let count = idle.len();
      close_slots(idle).await;

      loop {
         let notified = self.inner.available.notified();
         tokio::pin!(notified);
         notified.as_mut().enable();

         let in_use = {
            let mut state = self.inner.state.lock();
            let in_use = state.slots.iter().filter(|s| s.in_use).count() + state.pending;
            if in_use > 0 && tokio::time::Instant::now() >= deadline {
               if state.status == PoolStatus::Offline {
                  state.status = previous.clone();
               }
               drop(state);
               self.inner.available.notify_waiters();
               warn!(in_use, "Connections still in use; pool stays online");
               return Err(Error::StillInUse(in_use));
            }
            in_use
         };
         if in_use == 0 {
            break;
         }

         debug!(in_use, "Waiting for connections to be released");
         // Woken by a release or by the deadline; both are rechecked above
         let _ = tokio::time::timeout_at(deadline, notified).await;
      }

      debug!(closed = count, "Connection pool taken offline");
      Ok(count)
   }

   /// Bring the pool back online after [`suspend`](Self::suspend).
   ///
   /// Also clears a degraded state, since the database underneath has been
   /// replaced or verified by the caller.
   pub fn resume(&self) {
      {
         let mut state = self.inner.state.lock();
         if state.status != PoolStatus::Closed {
            state.status = PoolStatus::Open;
         }
      }
      debug!("Connection pool back online");
      self.inner.available.notify_waiters();
   }

   /// Close and reopen the pool's connections once.
   ///
   /// Idle connections are closed, the pool pauses for the recovery backoff,
   /// then each slot is reopened. Connections checked out at the time are
   /// discarded when released. If a slot cannot be reopened the pool becomes
   /// [`PoolStatus::Degraded`] and the failure is returned; a successful pass
   /// clears a previous degraded state.
   pub async fn recover(&self) -> Result<()> {
      let _serial = self.inner.recovery_lock.lock().await;
      self.inner.recoveries.fetch_add(1, Ordering::Relaxed);
      debug!("Attempting connection recovery");

      let (stale, slot_ids) = {
         let mut state = self.inner.state.lock();
         if state.status == PoolStatus::Closed {
            return Err(Error::Unavailable);
         }
         state.generation += 1;
         let generation = state.generation;

         let mut stale = Vec::new();
         let mut slot_ids = Vec::new();
         for slot in state.slots.iter_mut().filter(|s| !s.in_use) {
            if let Some(conn) = slot.conn.take() {
               stale.push(conn);
            }
            slot.generation = generation;
            slot_ids.push(slot.id);
         }
         (stale, slot_ids)
      };

      close_connections(stale).await;
      tokio::time::sleep(self.inner.config.recovery_backoff).await;

      let reopened = if slot_ids.is_empty() {
         self.open_spare().await
      } else {
         self.reopen(&slot_ids).await
      };

      match reopened {
         Ok(()) => {
            {
               let mut state = self.inner.state.lock();
               if matches!(state.status, PoolStatus::Degraded(_)) {
                  state.status = PoolStatus::Open;
               }
            }
            self.inner.available.notify_waiters();
            debug!("Database connection recovery completed");
            Ok(())
         }
         Err(e) => {
            let reason = e.to_string();
            {
               let mut state = self.inner.state.lock();
               state.slots.retain(|s| s.in_use || s.conn.is_some());
               if state.status == PoolStatus::Open {
                  state.status = PoolStatus::Degraded(reason.clone());
               }
            }
            self.inner.available.notify_waiters();
            error!(error = %reason, "Failed to reopen connection after recovery attempt");
            Err(Error::Degraded(reason))
         }
      }
   }

   async fn reopen(&self, slot_ids: &[u64]) -> Result<()> {
      for &id in slot_ids {
         let conn = self.inner.connector.connect(&self.inner.path).await?;

         let leftover = {
            let mut state = self.inner.state.lock();
            match state.slots.iter_mut().find(|s| s.id == id && s.is_reopenable()) {
               Some(slot) => {
                  slot.conn = Some(conn);
                  None
               }
               // Evicted or shrunk away while we were reopening
               None => Some(conn),
            }
         };
         if let Some(conn) = leftover {
            conn.close().await?;
         }
         self.inner.available.notify_one();
      }
      Ok(())
   }

   /// With no idle slots to reopen, prove the database can still be opened
   /// by adding one fresh idle slot (capacity permitting).
   async fn open_spare(&self) -> Result<()> {
      let reservation = {
         let mut state = self.inner.state.lock();
         (state.slots.len() + state.pending < state.max_connections)
            .then(|| Reservation::take(&self.inner, &mut state))
      };
      let Some(mut reservation) = reservation else {
         return Ok(());
      };

      let opened = self.inner.connector.connect(&self.inner.path).await;
      reservation.settle(&mut self.inner.state.lock());
      self.adopt(opened?).await
   }

   /// Shut the pool down.
   ///
   /// Pending and future `acquire` calls fail with [`Error::Unavailable`].
   /// Idle connections are closed now; connections in use are closed when
   /// their guards drop.
   pub async fn shutdown(&self) {
      if let Some(handle) = self.inner.cleanup.lock().take() {
         handle.abort();
      }

      let idle = {
         let mut state = self.inner.state.lock();
         state.status = PoolStatus::Closed;
         let (idle, busy): (Vec<Slot>, Vec<Slot>) =
            std::mem::take(&mut state.slots).into_iter().partition(|s| !s.in_use);
         state.slots = busy;
         idle
      };

      self.inner.available.notify_waiters();
      let count = idle.len();
      close_slots(idle).await;
      debug!(closed = count, "Connection pool shut down");
   }

   pub fn is_closed(&self) -> bool {
      self.status() == PoolStatus::Closed
   }
}

impl Slot {
   fn is_reopenable(&self) -> bool {
      !self.in_use && self.conn.is_none()
   }
}

impl std::fmt::Debug for ConnectionPool {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let state = self.inner.state.lock();
      f.debug_struct("ConnectionPool")
         .field("path", &self.inner.path)
         .field("size", &state.slots.len())
         .field("max_connections", &state.max_connections)
         .field("status", &state.status)
         .finish()
   }
}

async fn close_slots(slots: Vec<Slot>) {
   close_connections(slots.into_iter().filter_map(|s| s.conn).collect()).await;
}

async fn close_connections(conns: Vec<SqliteConnection>) {
   for conn in conns {
      if let Err(e) = conn.close().await {
         warn!(error = %e, "Error closing connection");
      }
   }
}
