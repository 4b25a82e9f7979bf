//! The database wrapper: connection pools, pragma policy, and the write
//! gateway.
//!
//! A [`LiveDatabase`] owns a read-only pool for query execution, a
//! single-connection write pool for serialized mutations, and the change
//! registry shared by every live query it creates: one registry per
//! database, constructed explicitly rather than hidden in a global.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{ConnectOptions as _, Pool, Sqlite};
use tracing::debug;

use crate::deps::ChangeSet;
use crate::error::{Error, Result};
use crate::query::{LiveQuery, QuerySpec};
use crate::registry::ChangeRegistry;
use crate::statement::PreparedQuery;

/// Configuration for the connection pools.
#[derive(Debug, Clone)]
pub struct LiveDatabaseConfig {
   /// Maximum number of read-only connections. Default: 6.
   pub max_read_connections: u32,

   /// Seconds an idle pooled connection is kept open. Default: 30.
   pub idle_timeout_secs: u64,
}

impl Default for LiveDatabaseConfig {
   fn default() -> Self {
      Self {
         max_read_connections: 6,
         idle_timeout_secs: 30,
      }
   }
}

/// Result returned from a mutation (INSERT, UPDATE, DELETE, DDL).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueryResult {
   /// The number of rows affected by the statement.
   pub rows_affected: u64,

   /// The last inserted ROWID; 0 when the statement did not insert into a
   /// rowid table.
   pub last_insert_id: i64,
}

pub(crate) struct DatabaseInner {
   read_pool: Pool<Sqlite>,
   write_conn: Pool<Sqlite>,
   registry: Arc<ChangeRegistry>,

   /// Set on first write (file databases get WAL lazily, like a store that
   /// may never be written to).
   wal_initialized: AtomicBool,

   /// In-memory databases share one connection for reads and writes.
   in_memory: bool,

   /// Marks the database as closed to fail further operations.
   closed: AtomicBool,
}

impl DatabaseInner {
   pub(crate) fn read_pool(&self) -> Result<&Pool<Sqlite>> {
      if self.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }
      Ok(&self.read_pool)
   }
}

/// A SQLite database with dependency-tracked live queries.
///
/// Cloning is cheap; clones share the pools, the registry, and the closed
/// flag.
///
/// # Example
///
/// ```no_run
/// use serde_json::json;
/// use sqlx_sqlite_live::{ChangeSet, Dependencies, LiveDatabase, QuerySpec};
///
/// # async fn example() -> sqlx_sqlite_live::Result<()> {
/// let db = LiveDatabase::open_in_memory().await?;
/// db.mutate("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", vec![]).await?;
///
/// let users = db.query(
///    QuerySpec::new("SELECT * FROM users")
///       .with_dependencies(Dependencies::new().all("users")),
/// );
/// let subscription = users.subscribe(|rows| println!("{} users", rows.len())).await?;
///
/// db.mutate("INSERT INTO users (name) VALUES (?)", vec![json!("Alice")])
///    .changes(ChangeSet::new().rows("users", [1]))
///    .await?;
///
/// subscription.unsubscribe();
/// db.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LiveDatabase {
   inner: Arc<DatabaseInner>,
}

impl LiveDatabase {
   /// Opens (creating if missing) a SQLite database file.
   ///
   /// Pass `None` to use the default pool configuration. WAL mode is
   /// enabled lazily on the first mutation.
   pub async fn connect(
      path: impl AsRef<Path>,
      custom_config: Option<LiveDatabaseConfig>,
   ) -> Result<Self> {
      let config = custom_config.unwrap_or_default();
      let path = path.as_ref();

      if path.as_os_str().is_empty() {
         return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "database path cannot be empty",
         )));
      }

      // The read pool is read-only and cannot create the file, so a missing
      // database is created with a short-lived read-write connection first.
      if !path.exists() {
         let conn = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .connect()
            .await?;
         drop(conn);
      }

      let read_options = SqliteConnectOptions::new().filename(path).read_only(true);
      let read_pool = SqlitePoolOptions::new()
         .max_connections(config.max_read_connections)
         .min_connections(0)
         .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
         .connect_with(read_options)
         .await?;

      let write_options = SqliteConnectOptions::new().filename(path);
      let write_conn = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(0)
         .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
         .connect_with(write_options)
         .await?;

      debug!(path = %path.display(), "opened live database");

      Ok(Self {
         inner: Arc::new(DatabaseInner {
            read_pool,
            write_conn,
            registry: ChangeRegistry::new(),
            wal_initialized: AtomicBool::new(false),
            in_memory: false,
            closed: AtomicBool::new(false),
         }),
      })
   }

   /// Opens an in-memory database.
   ///
   /// Separate `:memory:` connections see separate databases, so a single
   /// connection, never reclaimed by the pool, serves both reads and
   /// writes here. The WAL pragma does not apply to in-memory databases
   /// and is skipped.
   pub async fn open_in_memory() -> Result<Self> {
      let pool = SqlitePoolOptions::new()
         .max_connections(1)
         .min_connections(1)
         .idle_timeout(None)
         .max_lifetime(None)
         .connect("sqlite::memory:")
         .await?;

      debug!("opened in-memory live database");

      Ok(Self {
         inner: Arc::new(DatabaseInner {
            read_pool: pool.clone(),
            write_conn: pool,
            registry: ChangeRegistry::new(),
            wal_initialized: AtomicBool::new(false),
            in_memory: true,
            closed: AtomicBool::new(false),
         }),
      })
   }

   /// Creates an inert live query from `spec`.
   ///
   /// No statement runs and no registry slot is taken until the first
   /// listener subscribes.
   pub fn query(&self, spec: QuerySpec) -> LiveQuery {
      LiveQuery::new(
         Arc::clone(&self.inner),
         Arc::clone(&self.inner.registry),
         spec,
      )
   }

   /// Starts building a mutation.
   ///
   /// Await the builder (or call [`MutationBuilder::execute`]) to run it;
   /// declare the touched rows with [`MutationBuilder::changes`] so
   /// dependent queries refresh.
   pub fn mutate(&self, sql: impl Into<String>, parameters: Vec<JsonValue>) -> MutationBuilder {
      MutationBuilder {
         db: self.clone(),
         sql: sql.into(),
         parameters,
         changes: ChangeSet::new(),
      }
   }

   /// The change-notification registry owned by this database.
   pub fn registry(&self) -> &Arc<ChangeRegistry> {
      &self.inner.registry
   }

   /// Closes the database.
   ///
   /// Checkpoints the WAL when it was initialized, then closes both pools.
   /// Clones observe [`Error::DatabaseClosed`] afterwards.
   pub async fn close(self) -> Result<()> {
      self.inner.closed.store(true, Ordering::SeqCst);

      self.inner.read_pool.close().await;

      // Flush and truncate the WAL so the main file is complete on disk
      if self.inner.wal_initialized.load(Ordering::SeqCst)
         && let Ok(mut conn) = self.inner.write_conn.acquire().await
      {
         let _ = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&mut *conn)
            .await;
      }

      self.inner.write_conn.close().await;

      debug!("closed live database");
      Ok(())
   }

   async fn run_mutation(
      &self,
      sql: String,
      parameters: Vec<JsonValue>,
      changes: ChangeSet,
   ) -> Result<WriteQueryResult> {
      if self.inner.closed.load(Ordering::SeqCst) {
         return Err(Error::DatabaseClosed);
      }

      let mut statement = PreparedQuery::new(sql);
      statement.bind(parameters);

      // The connection must go back to the pool before notifications run:
      // on an in-memory database the refreshing queries need it.
      let result = {
         let mut conn = self.inner.write_conn.acquire().await?;

         if !self.inner.in_memory && !self.inner.wal_initialized.load(Ordering::SeqCst) {
            sqlx::query("PRAGMA journal_mode = WAL")
               .execute(&mut *conn)
               .await?;

            // https://www.sqlite.org/wal.html#performance_considerations
            sqlx::query("PRAGMA synchronous = NORMAL")
               .execute(&mut *conn)
               .await?;

            self.inner.wal_initialized.store(true, Ordering::SeqCst);
         }

         statement.execute(&mut *conn).await?
      };

      // The write has been applied; only now may dependents recompute.
      self.inner.registry.notify(&changes).await?;

      Ok(WriteQueryResult {
         rows_affected: result.rows_affected(),
         last_insert_id: result.last_insert_rowid(),
      })
   }
}

/// Builder for a write statement with its declared change set.
///
/// Awaiting the builder executes the statement on the write connection and
/// then fires the refresh of every query whose dependencies the change set
/// touches; the await completes only after those refreshes have run.
#[must_use = "the mutation does not run until awaited or spawned"]
pub struct MutationBuilder {
   db: LiveDatabase,
   sql: String,
   parameters: Vec<JsonValue>,
   changes: ChangeSet,
}

impl MutationBuilder {
   /// Declares which tables and rows this write touches.
   ///
   /// Defaults to an empty change set, which notifies nobody.
   pub fn changes(mut self, changes: ChangeSet) -> Self {
      self.changes = changes;
      self
   }

   /// Executes the statement, then drives the notifications to completion.
   ///
   /// A refresh failure surfaces here, after the write itself has been
   /// applied.
   pub async fn execute(self) -> Result<WriteQueryResult> {
      let MutationBuilder {
         db,
         sql,
         parameters,
         changes,
      } = self;
      db.run_mutation(sql, parameters, changes).await
   }

   /// Runs the mutation on a spawned task.
   ///
   /// The returned handle resolves after the write has been applied and all
   /// resulting notifications have been delivered; notification never
   /// precedes the write.
   pub fn spawn(self) -> tokio::task::JoinHandle<Result<WriteQueryResult>> {
      tokio::spawn(self.execute())
   }
}

impl std::future::IntoFuture for MutationBuilder {
   type Output = Result<WriteQueryResult>;
   type IntoFuture = std::pin::Pin<Box<dyn std::future::Future<Output = Self::Output> + Send>>;

   fn into_future(self) -> Self::IntoFuture {
      Box::pin(self.execute())
   }
}
