//! Periodic eviction of idle connections

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::pool::{ConnectionPool, PoolInner};

/// Spawn the idle sweep.
///
/// Every `interval`, slots idle for longer than `idle_timeout` are closed.
/// The task holds only a weak reference and exits once the pool is dropped or
/// shut down.
pub(crate) fn spawn(weak: Weak<PoolInner>, interval: Duration, idle_timeout: Duration) -> JoinHandle<()> {
   tokio::spawn(async move {
      let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
         ticker.tick().await;

         let Some(inner) = weak.upgrade() else {
            break;
         };
         let pool = ConnectionPool::from_inner(inner);
         if pool.is_closed() {
            break;
         }

         let evicted = pool.evict_idle(idle_timeout).await;
         if evicted > 0 {
            debug!(evicted, remaining = pool.size(), "Idle connection sweep");
         }
      }
   })
}
