use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use sqlite_db_service::{
   DatabaseConfig, DatabaseEvent, DatabaseService, Error, PoolConfig, SCHEMA_VERSION,
   StreamEvent, TransactionError,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn test_config(temp: &TempDir) -> DatabaseConfig {
   DatabaseConfig {
      path: temp.path().join("config").join("adb.db"),
      pool: PoolConfig {
         acquire_timeout: Duration::from_secs(5),
         busy_timeout: Duration::from_secs(2),
         recovery_backoff: Duration::from_millis(10),
         ..Default::default()
      },
      ..Default::default()
   }
}

async fn create_test_db() -> (DatabaseService, TempDir) {
   let temp = TempDir::new().expect("Failed to create temp directory");
   let db = DatabaseService::open(test_config(&temp))
      .await
      .expect("Failed to open test database");

   db.execute(
      "CREATE TABLE songs (id INTEGER PRIMARY KEY, title TEXT NOT NULL UNIQUE, artist TEXT)",
      vec![],
   )
   .await
   .unwrap();

   (db, temp)
}

async fn song_titles(db: &DatabaseService) -> Vec<String> {
   db.select("SELECT title FROM songs ORDER BY id", vec![])
      .await
      .unwrap()
      .into_iter()
      .map(|row| row["title"].as_str().unwrap().to_string())
      .collect()
}

fn drain(rx: &mut broadcast::Receiver<DatabaseEvent>) -> Vec<DatabaseEvent> {
   let mut events = Vec::new();
   while let Ok(event) = rx.try_recv() {
      events.push(event);
   }
   events
}

// ─── Lifecycle ───

#[tokio::test]
async fn open_creates_directory_and_schema_marker() {
   let (db, temp) = create_test_db().await;

   assert!(db.is_running());
   assert!(temp.path().join("config").join("adb.db").exists());
   assert_eq!(db.schema_version().await.unwrap(), Some(SCHEMA_VERSION));

   let info = db.get_connection_info();
   assert!(!info.is_empty());
   assert!(info.iter().all(|c| c.driver_name == "sqlite" && c.is_valid));
   assert_eq!(info[0].database_path, db.database_path());
}

#[tokio::test]
async fn reopening_existing_database_keeps_data() {
   let (db, temp) = create_test_db().await;
   db.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("Intro")])
      .await
      .unwrap();
   db.shutdown().await;
   assert!(!db.is_running());

   let reopened = DatabaseService::open(test_config(&temp)).await.unwrap();
   assert_eq!(song_titles(&reopened).await, vec!["Intro"]);
   assert_eq!(reopened.schema_version().await.unwrap(), Some(SCHEMA_VERSION));
}

#[tokio::test]
async fn database_path_changes_only_while_stopped() {
   let (db, temp) = create_test_db().await;
   let original = db.database_path();

   let err = db.set_database_path(temp.path().join("other.db")).unwrap_err();
   assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
   assert_eq!(db.database_path(), original);

   db.shutdown().await;
   db.set_database_path(temp.path().join("other.db")).unwrap();
   db.start().await.unwrap();
   assert_eq!(db.database_path(), temp.path().join("other.db"));
   assert!(temp.path().join("other.db").exists());
}

#[tokio::test]
async fn directory_as_database_path_is_a_configuration_error() {
   let temp = TempDir::new().unwrap();
   let config = DatabaseConfig {
      path: temp.path().to_path_buf(),
      ..Default::default()
   };

   let err = DatabaseService::open(config).await.unwrap_err();
   assert!(matches!(err, Error::Configuration(_)));
}

#[tokio::test]
async fn operations_after_shutdown_fail_as_unavailable() {
   let (db, _temp) = create_test_db().await;
   db.shutdown().await;

   let err = db.select("SELECT 1", vec![]).await.unwrap_err();
   assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");

   let err = db
      .execute_transaction(|_tx| Box::pin(async move { Ok::<_, TransactionError>(true) }))
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "SERVICE_UNAVAILABLE");
   assert!(db.get_connection_info().is_empty());
}

// ─── Queries ───

#[tokio::test]
async fn execute_and_select_round_trip() {
   let (db, _temp) = create_test_db().await;

   let result = db
      .execute(
         "INSERT INTO songs (title, artist) VALUES ($1, $2)",
         vec![json!("Song Title"), json!("Artist Name")],
      )
      .await
      .unwrap();
   assert_eq!((result.rows_affected, result.last_insert_id), (1, 1));

   let rows = db
      .select("SELECT artist, title, id FROM songs WHERE title = ?", vec![json!("Song Title")])
      .await
      .unwrap();
   assert_eq!(rows.len(), 1);
   let columns: Vec<&String> = rows[0].keys().collect();
   assert_eq!(columns, vec!["artist", "title", "id"]);
   assert_eq!(rows[0]["id"], json!(1));

   let none = db
      .select("SELECT * FROM songs WHERE title = ?", vec![json!("missing")])
      .await
      .unwrap();
   assert!(none.is_empty());
}

#[tokio::test]
async fn failed_query_is_counted_and_reported() {
   let (db, _temp) = create_test_db().await;
   let mut rx = db.subscribe();
   let before = db.get_stats().await;

   let err = db
      .execute("INSERT INTO missing_table VALUES (1)", vec![])
      .await
      .unwrap_err();
   assert!(matches!(err, Error::Query { .. }));
   assert_eq!(err.sql(), Some("INSERT INTO missing_table VALUES (1)"));
   assert!(!err.is_recoverable());

   let after = db.get_stats().await;
   assert_eq!(after.total_queries, before.total_queries + 1);
   assert_eq!(after.failed_queries, before.failed_queries + 1);

   let events = drain(&mut rx);
   assert!(events.iter().any(|e| matches!(
      e,
      DatabaseEvent::DatabaseError { message, sql: Some(sql) }
         if message.contains("no such table") && sql == "INSERT INTO missing_table VALUES (1)"
   )));
}

#[tokio::test]
async fn create_query_uses_default_connection() {
   let (db, _temp) = create_test_db().await;

   let query = db
      .create_query()
      .prepare("INSERT INTO songs (title) VALUES (?)")
      .bind("From default connection");
   assert!(query.is_valid());
   query.execute().await.unwrap();

   assert_eq!(song_titles(&db).await, vec!["From default connection"]);

   db.shutdown().await;
   let query = db.create_query().prepare("SELECT 1");
   assert!(!query.is_valid());
   assert!(query.fetch_all().await.is_err());
}

// ─── Transactions ───

#[tokio::test]
async fn committed_transaction_is_visible() {
   let (db, _temp) = create_test_db().await;
   let mut rx = db.subscribe();

   db.execute_transaction(|tx| {
      Box::pin(async move {
         tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
            .await?;
         tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("B")])
            .await?;
         Ok::<_, TransactionError>(true)
      })
   })
   .await
   .unwrap();

   assert_eq!(song_titles(&db).await, vec!["A", "B"]);
   assert_eq!(
      drain(&mut rx),
      vec![DatabaseEvent::TransactionStarted, DatabaseEvent::TransactionCommitted]
   );

   let stats = db.get_stats().await;
   assert_eq!((stats.total_transactions, stats.failed_transactions), (1, 0));
}

#[tokio::test]
async fn declined_transaction_leaves_no_rows() {
   let (db, _temp) = create_test_db().await;
   let mut rx = db.subscribe();

   let err = db
      .execute_transaction(|tx| {
         Box::pin(async move {
            tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
               .await?;
            Ok::<_, TransactionError>(false)
         })
      })
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "TRANSACTION_DECLINED");

   let rows = db
      .select("SELECT * FROM songs WHERE title = ?", vec![json!("A")])
      .await
      .unwrap();
   assert!(rows.is_empty());

   let events = drain(&mut rx);
   assert_eq!(events[0], DatabaseEvent::TransactionStarted);
   assert!(matches!(events[1], DatabaseEvent::TransactionRolledBack { .. }));

   let stats = db.get_stats().await;
   assert_eq!((stats.total_transactions, stats.failed_transactions), (1, 1));
}

#[tokio::test]
async fn failing_statement_rolls_back_whole_transaction() {
   let (db, _temp) = create_test_db().await;

   let err = db
      .execute_transaction(|tx| {
         Box::pin(async move {
            tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
               .await?;
            tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
               .await?;
            Ok::<_, TransactionError>(true)
         })
      })
      .await
      .unwrap_err();

   assert!(matches!(err, Error::Transaction(_)));
   assert!(song_titles(&db).await.is_empty());
}

#[tokio::test]
async fn panicking_work_rolls_back() {
   let (db, _temp) = create_test_db().await;

   let err = db
      .execute_transaction(|tx| {
         Box::pin(async move {
            tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
               .await?;
            if tx.depth() == 0 {
               panic!("work exploded");
            }
            Ok::<_, TransactionError>(true)
         })
      })
      .await
      .unwrap_err();

   assert_eq!(err.error_code(), "TRANSACTION_PANICKED");
   assert!(song_titles(&db).await.is_empty());

   // The pool keeps working after the panic
   db.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("B")])
      .await
      .unwrap();
   assert_eq!(song_titles(&db).await, vec!["B"]);
}

#[tokio::test]
async fn nested_units_are_flattened_into_outer_transaction() {
   let (db, _temp) = create_test_db().await;
   let mut rx = db.subscribe();

   db.execute_transaction(|tx| {
      Box::pin(async move {
         tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("outer")])
            .await?;
         tx.execute_transaction(|inner| {
            Box::pin(async move {
               inner
                  .execute("INSERT INTO songs (title) VALUES (?)", vec![json!("inner")])
                  .await
                  .map(|_| true)
            })
         })
         .await?;
         Ok::<_, TransactionError>(true)
      })
   })
   .await
   .unwrap();

   assert_eq!(song_titles(&db).await, vec!["outer", "inner"]);
   // One physical transaction
   assert_eq!(
      drain(&mut rx),
      vec![DatabaseEvent::TransactionStarted, DatabaseEvent::TransactionCommitted]
   );

   let err = db
      .execute_transaction(|tx| {
         Box::pin(async move {
            tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("outer 2")])
               .await?;
            let _ = tx
               .execute_transaction(|inner| {
                  Box::pin(async move { Ok::<_, TransactionError>(inner.depth() == 0) })
               })
               .await;
            Ok::<_, TransactionError>(true)
         })
      })
      .await
      .unwrap_err();

   assert_eq!(err.error_code(), "TRANSACTION_DECLINED");
   assert_eq!(song_titles(&db).await, vec!["outer", "inner"]);
}

#[tokio::test]
async fn service_transaction_inside_work_fails_fast_and_rolls_back_outer() {
   let (db, _temp) = create_test_db().await;
   let (inner_tx, inner_rx) = tokio::sync::oneshot::channel();
   let started = std::time::Instant::now();

   let err = db
      .execute_transaction({
         let db = db.clone();
         move |tx| {
            Box::pin(async move {
               tx.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("outer")])
                  .await?;
               let inner = db
                  .execute_transaction(|inner| {
                     Box::pin(async move {
                        inner
                           .execute("INSERT INTO songs (title) VALUES (?)", vec![json!("inner")])
                           .await
                           .map(|_| true)
                     })
                  })
                  .await;
               let _ = inner_tx.send(inner.map_err(|e| e.error_code()));
               Ok::<_, TransactionError>(true)
            })
         }
      })
      .await
      .unwrap_err();

   assert_eq!(inner_rx.await.unwrap(), Err("TRANSACTION_NESTED".to_string()));
   assert_eq!(err.error_code(), "TRANSACTION_DECLINED");
   // No second connection waited out the busy timeout
   assert!(started.elapsed() < Duration::from_secs(1));
   assert!(song_titles(&db).await.is_empty());

   let stats = db.get_stats().await;
   assert_eq!(stats.recoveries, 0);
   assert_eq!(stats.connections_in_use, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transactions_from_spawned_tasks() {
   let (db, _temp) = create_test_db().await;
   db.set_max_connections(2).await.unwrap();

   let mut handles = Vec::new();
   for i in 0..6 {
      let db = db.clone();
      handles.push(tokio::spawn(async move {
         db.execute_transaction(move |tx| {
            Box::pin(async move {
               tx.execute(
                  "INSERT INTO songs (title) VALUES (?)",
                  vec![json!(format!("song {i}"))],
               )
               .await
               .map(|_| true)
            })
         })
         .await
      }));
   }

   for handle in handles {
      handle.await.unwrap().unwrap();
   }

   assert_eq!(song_titles(&db).await.len(), 6);
   let stats = db.get_stats().await;
   assert!(stats.active_connections <= 2);
   assert_eq!(stats.connections_in_use, 0);
}

// ─── Pool Settings and Statistics ───

#[tokio::test]
async fn max_connections_rejects_zero() {
   let (db, _temp) = create_test_db().await;
   assert_eq!(db.max_connections(), 5);

   let err = db.set_max_connections(0).await.unwrap_err();
   assert_eq!(err.error_code(), "INVALID_MAX_CONNECTIONS");
   assert_eq!(db.max_connections(), 5);

   db.set_max_connections(2).await.unwrap();
   assert_eq!(db.max_connections(), 2);
   assert_eq!(db.get_stats().await.max_connections, 2);
}

#[tokio::test]
async fn stats_report_counters_and_file_details() {
   let (db, _temp) = create_test_db().await;
   db.execute("INSERT INTO songs (title) VALUES (?)", vec![json!("A")])
      .await
      .unwrap();
   db.select("SELECT * FROM songs", vec![]).await.unwrap();

   let stats = db.get_stats().await;
   // CREATE TABLE, INSERT and SELECT
   assert_eq!(stats.total_queries, 3);
   assert_eq!(stats.failed_queries, 0);
   assert!(stats.database_size > 0);
   assert!(stats.last_modified.is_some());
   assert!(stats.last_optimization.is_none());
   assert_eq!(stats.database_path, db.database_path());

   let json = serde_json::to_value(&stats).unwrap();
   assert_eq!(json["totalQueries"], 3);
}

#[tokio::test]
async fn reconnect_runs_one_recovery_pass() {
   let (db, _temp) = create_test_db().await;
   let mut events = db.subscribe_stream();

   db.reconnect().await.unwrap();
   assert_eq!(db.get_stats().await.recoveries, 1);

   assert_eq!(
      events.next().await,
      Some(StreamEvent::Event(DatabaseEvent::RecoveryCompleted { success: true }))
   );

   // Connections were reopened and still work
   assert!(song_titles(&db).await.is_empty());
}
