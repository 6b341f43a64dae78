//! Events published by the database service

use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

/// Something observable happened in the service.
///
/// Delivered to every subscriber; see
/// [`DatabaseService::subscribe`](crate::DatabaseService::subscribe).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DatabaseEvent {
   /// A statement or connection failed
   DatabaseError { message: String, sql: Option<String> },
   BackupCompleted { success: bool, path: PathBuf },
   RestoreCompleted { success: bool, path: PathBuf },
   OptimizationCompleted { success: bool },
   TransactionStarted,
   TransactionCommitted,
   TransactionRolledBack { reason: String },
   /// A recovery pass over the pool finished
   RecoveryCompleted { success: bool },
}

/// Item yielded by an [`EventStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
   Event(DatabaseEvent),
   /// The subscriber fell behind and this many events were dropped
   Lagged(u64),
}

/// Fan-out of [`DatabaseEvent`]s to any number of subscribers
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
   tx: broadcast::Sender<DatabaseEvent>,
}

impl EventBus {
   pub(crate) fn new(capacity: usize) -> Self {
      let (tx, _) = broadcast::channel(capacity.max(1));
      Self { tx }
   }

   /// Publish `event`. Having no subscribers is fine.
   pub(crate) fn emit(&self, event: DatabaseEvent) {
      let _ = self.tx.send(event);
   }

   pub(crate) fn subscribe(&self) -> broadcast::Receiver<DatabaseEvent> {
      self.tx.subscribe()
   }
}

/// A stream of service events.
///
/// Wraps a `BroadcastStream` and surfaces lag as [`StreamEvent::Lagged`]
/// instead of an error. Ends when the service is dropped.
pub struct EventStream {
   inner: BroadcastStream<DatabaseEvent>,
}

impl EventStream {
   pub fn new(rx: broadcast::Receiver<DatabaseEvent>) -> Self {
      Self {
         inner: BroadcastStream::new(rx),
      }
   }
}

impl Stream for EventStream {
   type Item = StreamEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      // BroadcastStream is Unpin
      match Pin::new(&mut self.inner).poll_next(cx) {
         Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(StreamEvent::Event(event))),
         Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(count)))) => {
            warn!(
               missed = count,
               "Event stream lagged; consider increasing event_capacity"
            );
            Poll::Ready(Some(StreamEvent::Lagged(count)))
         }
         Poll::Ready(None) => Poll::Ready(None),
         Poll::Pending => Poll::Pending,
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use futures::StreamExt;

   #[tokio::test]
   async fn test_emit_without_subscribers_is_ok() {
      let bus = EventBus::new(4);
      bus.emit(DatabaseEvent::TransactionStarted);
   }

   #[tokio::test]
   async fn test_stream_reports_lag() {
      let bus = EventBus::new(2);
      let mut stream = EventStream::new(bus.subscribe());

      for _ in 0..4 {
         bus.emit(DatabaseEvent::TransactionStarted);
      }
      bus.emit(DatabaseEvent::TransactionCommitted);

      assert_eq!(stream.next().await, Some(StreamEvent::Lagged(3)));
      assert_eq!(
         stream.next().await,
         Some(StreamEvent::Event(DatabaseEvent::TransactionStarted))
      );
      assert_eq!(
         stream.next().await,
         Some(StreamEvent::Event(DatabaseEvent::TransactionCommitted))
      );

      drop(bus);
      assert_eq!(stream.next().await, None);
   }

   #[test]
   fn test_event_serializes_with_type_tag() {
      let event = DatabaseEvent::DatabaseError {
         message: "no such table: t".into(),
         sql: Some("SELECT * FROM t".into()),
      };
      let json = serde_json::to_value(&event).unwrap();
      assert_eq!(json["type"], "databaseError");
      assert_eq!(json["sql"], "SELECT * FROM t");
   }
}
