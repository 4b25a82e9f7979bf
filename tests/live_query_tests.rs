//! Integration tests for dependency-tracked live queries.
//!
//! Tests verify:
//! - Lazy activation: no store work and no registry slot without listeners
//! - Dependency matching: wildcard vs. enumerated record sets, per table
//! - Subscription lifecycle: idempotent teardown, re-activation, RAII guards
//! - Reconfiguration: update coalescing and equality no-ops
//! - Write gateway: notify-after-write ordering, spawned mutations,
//!   refresh-error propagation

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use sqlx_sqlite_live::{
   ChangeSet, Dependencies, Error, LiveDatabase, LiveQuery, QuerySpec, QueryUpdate,
};

async fn setup_db() -> LiveDatabase {
   let db = LiveDatabase::open_in_memory().await.unwrap();

   db.mutate(
      "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT NOT NULL)",
      vec![],
   )
   .await
   .unwrap();

   db.mutate(
      "CREATE TABLE posts (id INTEGER PRIMARY KEY, user_id INTEGER NOT NULL, title TEXT NOT NULL)",
      vec![],
   )
   .await
   .unwrap();

   db
}

fn users_query(db: &LiveDatabase) -> LiveQuery {
   db.query(
      QuerySpec::new("SELECT * FROM users").with_dependencies(Dependencies::new().all("users")),
   )
}

async fn insert_user(db: &LiveDatabase, id: i64, name: &str) {
   db.mutate(
      "INSERT INTO users (id, name) VALUES (?, ?)",
      vec![json!(id), json!(name)],
   )
   .changes(ChangeSet::new().rows("users", [id]))
   .await
   .unwrap();
}

/// Listener that records the length of every delivered snapshot.
fn length_recorder() -> (Arc<Mutex<Vec<usize>>>, impl Fn(sqlx_sqlite_live::Rows)) {
   let lengths = Arc::new(Mutex::new(Vec::new()));
   let recorder = {
      let lengths = Arc::clone(&lengths);
      move |rows: sqlx_sqlite_live::Rows| lengths.lock().push(rows.len())
   };
   (lengths, recorder)
}

// ============================================================================
// Lazy activation
// ============================================================================

#[tokio::test]
async fn test_inert_query_holds_no_registry_slot() {
   let db = setup_db().await;
   let _query = users_query(&db);

   assert!(db.registry().is_empty());

   insert_user(&db, 1, "John").await;
   assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_inert_query_never_touches_the_store() {
   let db = setup_db().await;

   // A statement this broken would error the moment it ran
   let query = db.query(
      QuerySpec::new("SELECT * FROM no_such_table")
         .with_dependencies(Dependencies::new().all("no_such_table")),
   );

   // Writes touching its declared table must not run it either
   db.mutate("INSERT INTO users (id, name) VALUES (1, 'John')", vec![])
      .changes(ChangeSet::new().all("no_such_table"))
      .await
      .unwrap();

   // Only the first subscribe executes the statement; the failure is proof
   let result = query.subscribe(|_| {}).await;
   assert!(result.is_err());
   assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_first_subscribe_executes_once_and_registers() {
   let db = setup_db().await;
   let query = users_query(&db);

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   assert_eq!(count.load(Ordering::SeqCst), 1);
   assert_eq!(db.registry().len(), 1);
   assert!(query.is_observing());

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_second_listener_reuses_cached_snapshot() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;

   let query = users_query(&db);

   let (first_lengths, first_recorder) = length_recorder();
   let (second_lengths, second_recorder) = length_recorder();

   let first = query.subscribe(first_recorder).await.unwrap();
   let second = query.subscribe(second_recorder).await.unwrap();

   // One execution total: the second listener was served from cache
   assert_eq!(*first_lengths.lock(), vec![1]);
   assert_eq!(*second_lengths.lock(), vec![1]);
   assert_eq!(db.registry().len(), 1);
   assert_eq!(query.listener_count(), 2);

   // A matching write reaches both
   insert_user(&db, 2, "Jane").await;
   assert_eq!(*first_lengths.lock(), vec![1, 2]);
   assert_eq!(*second_lengths.lock(), vec![1, 2]);

   first.unsubscribe();
   second.unsubscribe();
}

// ============================================================================
// End-to-end delivery
// ============================================================================

#[tokio::test]
async fn test_insert_refreshes_subscribed_query() {
   let db = setup_db().await;
   let query = users_query(&db);

   let (lengths, recorder) = length_recorder();
   let subscription = query.subscribe(recorder).await.unwrap();

   insert_user(&db, 1, "John").await;
   insert_user(&db, 2, "Jane").await;

   // Initial empty result plus one delivery per insert
   assert_eq!(*lengths.lock(), vec![0, 1, 2]);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_delivered_rows_carry_column_values() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;

   let query = users_query(&db);
   let rows_seen = Arc::new(Mutex::new(Vec::new()));
   let subscription = {
      let rows_seen = Arc::clone(&rows_seen);
      query
         .subscribe(move |rows| rows_seen.lock().push(rows))
         .await
         .unwrap()
   };

   let snapshots = rows_seen.lock();
   assert_eq!(snapshots.len(), 1);
   assert_eq!(snapshots[0][0]["id"], json!(1));
   assert_eq!(snapshots[0][0]["name"], json!("John"));
   drop(snapshots);

   subscription.unsubscribe();
}

// ============================================================================
// Dependency matching
// ============================================================================

#[tokio::test]
async fn test_row_targeted_dependencies() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;
   insert_user(&db, 2, "Jane").await;

   let first = db.query(
      QuerySpec::new("SELECT * FROM users WHERE id = ?")
         .with_parameters(vec![json!(1)])
         .with_dependencies(Dependencies::new().rows("users", [1])),
   );
   let second = db.query(
      QuerySpec::new("SELECT * FROM users WHERE id = ?")
         .with_parameters(vec![json!(2)])
         .with_dependencies(Dependencies::new().rows("users", [2])),
   );

   let first_count = Arc::new(AtomicUsize::new(0));
   let second_count = Arc::new(AtomicUsize::new(0));

   let first_sub = {
      let count = Arc::clone(&first_count);
      first
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };
   let second_sub = {
      let count = Arc::clone(&second_count);
      second
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   db.mutate("UPDATE users SET name = 'Johnny' WHERE id = 1", vec![])
      .changes(ChangeSet::new().rows("users", [1]))
      .await
      .unwrap();

   // Only the query depending on row 1 recomputed
   assert_eq!(first_count.load(Ordering::SeqCst), 2);
   assert_eq!(second_count.load(Ordering::SeqCst), 1);

   first_sub.unsubscribe();
   second_sub.unsubscribe();
}

#[tokio::test]
async fn test_wildcard_change_refreshes_enumerated_dependency() {
   let db = setup_db().await;
   insert_user(&db, 5, "Eve").await;

   let query = db.query(
      QuerySpec::new("SELECT * FROM users WHERE id = 5")
         .with_dependencies(Dependencies::new().rows("users", [5])),
   );

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   db.mutate("UPDATE users SET name = 'Eva'", vec![])
      .changes(ChangeSet::new().all("users"))
      .await
      .unwrap();

   assert_eq!(count.load(Ordering::SeqCst), 2);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_unrelated_change_does_not_refresh() {
   let db = setup_db().await;
   let query = users_query(&db);

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   // Disjoint row set on a declared table
   let disjoint = db.query(
      QuerySpec::new("SELECT * FROM users WHERE id = 1")
         .with_dependencies(Dependencies::new().rows("users", [1])),
   );
   let disjoint_count = Arc::new(AtomicUsize::new(0));
   let disjoint_sub = {
      let count = Arc::clone(&disjoint_count);
      disjoint
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   db.mutate(
      "INSERT INTO posts (id, user_id, title) VALUES (1, 9, 'hi')",
      vec![],
   )
   .changes(ChangeSet::new().rows("posts", [1]))
   .await
   .unwrap();

   db.mutate("INSERT INTO users (id, name) VALUES (3, 'Kim')", vec![])
      .changes(ChangeSet::new().rows("users", [3]))
      .await
      .unwrap();

   // The wildcard query saw the users insert only; the row-1 query saw nothing
   assert_eq!(count.load(Ordering::SeqCst), 2);
   assert_eq!(disjoint_count.load(Ordering::SeqCst), 1);

   subscription.unsubscribe();
   disjoint_sub.unsubscribe();
}

#[tokio::test]
async fn test_multi_table_match_fires_once() {
   let db = setup_db().await;

   let query = db.query(
      QuerySpec::new(
         "SELECT users.name, posts.title FROM users JOIN posts ON posts.user_id = users.id",
      )
      .with_dependencies(Dependencies::new().all("users").all("posts")),
   );

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   // One write touching both declared tables: exactly one refresh
   db.mutate("INSERT INTO users (id, name) VALUES (1, 'John')", vec![])
      .changes(ChangeSet::new().rows("users", [1]).rows("posts", [1]))
      .await
      .unwrap();

   assert_eq!(count.load(Ordering::SeqCst), 2);

   subscription.unsubscribe();
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
   let db = setup_db().await;
   let query = users_query(&db);

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   subscription.unsubscribe();
   subscription.unsubscribe();

   assert!(db.registry().is_empty());
   assert!(!query.is_observing());

   insert_user(&db, 1, "John").await;
   assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropping_guard_unsubscribes() {
   let db = setup_db().await;
   let query = users_query(&db);

   {
      let _subscription = query.subscribe(|_| {}).await.unwrap();
      assert_eq!(db.registry().len(), 1);
   }

   assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_partial_unsubscribe_keeps_registry_slot() {
   let db = setup_db().await;
   let query = users_query(&db);

   let first = query.subscribe(|_| {}).await.unwrap();
   let second = query.subscribe(|_| {}).await.unwrap();

   first.unsubscribe();
   assert_eq!(db.registry().len(), 1);
   assert!(query.is_observing());

   second.unsubscribe();
   assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_resubscribe_after_teardown() {
   let db = setup_db().await;
   let query = users_query(&db);

   let (lengths, recorder) = length_recorder();

   let first = query.subscribe(recorder).await.unwrap();
   first.unsubscribe();
   assert!(db.registry().is_empty());

   insert_user(&db, 1, "John").await;
   // Torn down: the write was not delivered
   assert_eq!(*lengths.lock(), vec![0]);

   // Subscribing again re-enters the inert path: fresh execution
   let (lengths_again, recorder_again) = length_recorder();
   let second = query.subscribe(recorder_again).await.unwrap();
   assert_eq!(*lengths_again.lock(), vec![1]);
   assert_eq!(db.registry().len(), 1);

   insert_user(&db, 2, "Jane").await;
   assert_eq!(*lengths_again.lock(), vec![1, 2]);

   second.unsubscribe();
}

// ============================================================================
// Reconfiguration
// ============================================================================

#[tokio::test]
async fn test_update_coalesces_multiple_changed_fields() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;
   insert_user(&db, 2, "Jane").await;

   let query = db.query(
      QuerySpec::new("SELECT * FROM users WHERE id = ?")
         .with_parameters(vec![json!(1)])
         .with_dependencies(Dependencies::new().all("users")),
   );

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };
   assert_eq!(count.load(Ordering::SeqCst), 1);

   // SQL and parameters both change: exactly one re-execution
   query
      .update(
         QueryUpdate::new()
            .sql("SELECT * FROM users WHERE id = ? OR id = 0")
            .parameters(vec![json!(2)]),
      )
      .await
      .unwrap();

   assert_eq!(count.load(Ordering::SeqCst), 2);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_update_with_equal_values_is_a_no_op() {
   let db = setup_db().await;

   let query = db.query(
      QuerySpec::new("SELECT * FROM users WHERE name = ?")
         .with_parameters(vec![json!("John")])
         .with_dependencies(Dependencies::new().rows("users", [1, 2])),
   );

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   query
      .update(
         QueryUpdate::new()
            .sql("SELECT * FROM users WHERE name = ?")
            .parameters(vec![json!("John")])
            // Same membership, different declaration order
            .dependencies(Dependencies::new().rows("users", [2, 1])),
      )
      .await
      .unwrap();

   assert_eq!(count.load(Ordering::SeqCst), 1);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_update_sql_runs_the_new_statement() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;

   let query = users_query(&db);
   let rows_seen = Arc::new(Mutex::new(Vec::new()));
   let subscription = {
      let rows_seen = Arc::clone(&rows_seen);
      query
         .subscribe(move |rows| rows_seen.lock().push(rows))
         .await
         .unwrap()
   };

   query
      .update(QueryUpdate::new().sql("SELECT name FROM users"))
      .await
      .unwrap();

   let snapshots = rows_seen.lock();
   assert_eq!(snapshots.len(), 2);
   // The re-execution used the new text: the id column is gone
   assert!(snapshots[1][0].contains_key("name"));
   assert!(!snapshots[1][0].contains_key("id"));
   drop(snapshots);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_update_dependencies_retargets_notifications() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;
   insert_user(&db, 2, "Jane").await;

   let query = db.query(
      QuerySpec::new("SELECT * FROM users")
         .with_dependencies(Dependencies::new().rows("users", [1])),
   );

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   query
      .update(QueryUpdate::new().dependencies(Dependencies::new().rows("users", [2])))
      .await
      .unwrap();
   // The dependency change itself re-executed the observing query
   assert_eq!(count.load(Ordering::SeqCst), 2);

   db.mutate("UPDATE users SET name = 'J' WHERE id = 1", vec![])
      .changes(ChangeSet::new().rows("users", [1]))
      .await
      .unwrap();
   assert_eq!(count.load(Ordering::SeqCst), 2);

   db.mutate("UPDATE users SET name = 'J' WHERE id = 2", vec![])
      .changes(ChangeSet::new().rows("users", [2]))
      .await
      .unwrap();
   assert_eq!(count.load(Ordering::SeqCst), 3);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_update_while_inert_takes_effect_on_subscribe() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;
   insert_user(&db, 2, "Jane").await;

   let query = db.query(
      QuerySpec::new("SELECT * FROM users WHERE name = ?")
         .with_parameters(vec![json!("John")])
         .with_dependencies(Dependencies::new().all("users")),
   );

   // No listeners: the update only replaces state
   query
      .update(QueryUpdate::new().parameters(vec![json!("Jane")]))
      .await
      .unwrap();

   let rows_seen = Arc::new(Mutex::new(Vec::new()));
   let subscription = {
      let rows_seen = Arc::clone(&rows_seen);
      query
         .subscribe(move |rows| rows_seen.lock().push(rows))
         .await
         .unwrap()
   };

   let snapshots = rows_seen.lock();
   assert_eq!(snapshots.len(), 1);
   assert_eq!(snapshots[0][0]["name"], json!("Jane"));
   drop(snapshots);

   subscription.unsubscribe();
}

// ============================================================================
// Write gateway
// ============================================================================

#[tokio::test]
async fn test_spawned_mutation_notifies_after_write() {
   let db = setup_db().await;
   let query = users_query(&db);

   let (lengths, recorder) = length_recorder();
   let subscription = query.subscribe(recorder).await.unwrap();

   let handle = db
      .mutate(
         "INSERT INTO users (id, name) VALUES (?, ?)",
         vec![json!(1), json!("John")],
      )
      .changes(ChangeSet::new().rows("users", [1]))
      .spawn();

   let result = handle.await.unwrap().unwrap();
   assert_eq!(result.rows_affected, 1);

   // The handle resolved only after the notification pass completed
   assert_eq!(*lengths.lock(), vec![0, 1]);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_mutation_without_changes_notifies_nobody() {
   let db = setup_db().await;
   let query = users_query(&db);

   let count = Arc::new(AtomicUsize::new(0));
   let subscription = {
      let count = Arc::clone(&count);
      query
         .subscribe(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
         })
         .await
         .unwrap()
   };

   db.mutate("INSERT INTO users (id, name) VALUES (1, 'John')", vec![])
      .await
      .unwrap();

   assert_eq!(count.load(Ordering::SeqCst), 1);

   subscription.unsubscribe();
}

#[tokio::test]
async fn test_failed_refresh_surfaces_from_the_mutation() {
   let db = setup_db().await;
   insert_user(&db, 1, "John").await;

   let query = users_query(&db);
   let (lengths, recorder) = length_recorder();
   let subscription = query.subscribe(recorder).await.unwrap();
   assert_eq!(*lengths.lock(), vec![1]);

   // The write itself succeeds; the triggered refresh then fails
   let result = db
      .mutate("DROP TABLE users", vec![])
      .changes(ChangeSet::new().all("users"))
      .await;

   assert!(matches!(result, Err(Error::Sqlx(_))));
   // The previously cached snapshot was left in place: no new delivery
   assert_eq!(*lengths.lock(), vec![1]);

   subscription.unsubscribe();
}

// ============================================================================
// Streams
// ============================================================================

#[tokio::test]
async fn test_watch_streams_snapshots() {
   let db = setup_db().await;
   let query = users_query(&db);

   let mut stream = query.watch().await.unwrap();

   let initial = stream.next().await.unwrap();
   assert_eq!(initial.len(), 0);

   insert_user(&db, 1, "John").await;
   let updated = stream.next().await.unwrap();
   assert_eq!(updated.len(), 1);
   assert_eq!(updated[0]["name"], json!("John"));

   drop(stream);
   assert!(db.registry().is_empty());
}

#[tokio::test]
async fn test_watch_unsubscribe_ends_the_stream() {
   let db = setup_db().await;
   let query = users_query(&db);

   let mut stream = query.watch().await.unwrap();
   let _ = stream.next().await.unwrap();

   stream.unsubscribe();
   assert!(db.registry().is_empty());

   // Writes after detachment produce no items; the stream is drained
   insert_user(&db, 1, "John").await;
   assert!(stream.next().await.is_none());
}
