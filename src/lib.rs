//! Dependency-tracked live queries for SQLite using sqlx.
//!
//! A live query couples a SQL statement with a declaration of the tables and
//! rows its result depends on. Mutations declare which tables and rows they
//! touched; the database's change-notification registry matches the two and
//! re-executes exactly the affected queries, pushing fresh result snapshots
//! to their listeners.
//!
//! Declarations are supplied by the caller: nothing here parses SQL, and
//! nothing verifies a change set against what a write actually modified.
//! A wildcard on either side of a matching table is enough to refresh; two
//! enumerations refresh when they share at least one record id.
//!
//! Queries are lazy. A [`LiveQuery`] does no work and holds no registry slot
//! until its first listener subscribes, and it tears its registry entry down
//! when the last listener leaves.
//!
//! # Example
//!
//! ```no_run
//! use serde_json::json;
//! use sqlx_sqlite_live::{ChangeSet, Dependencies, LiveDatabase, QuerySpec};
//!
//! # async fn example() -> sqlx_sqlite_live::Result<()> {
//! let db = LiveDatabase::open_in_memory().await?;
//!
//! db.mutate("CREATE TABLE todos (id INTEGER PRIMARY KEY, title TEXT, done INTEGER)", vec![])
//!    .await?;
//!
//! let open_todos = db.query(
//!    QuerySpec::new("SELECT * FROM todos WHERE done = ?")
//!       .with_parameters(vec![json!(0)])
//!       .with_dependencies(Dependencies::new().all("todos")),
//! );
//!
//! // The first subscriber runs the query and receives the current rows
//! let subscription = open_todos
//!    .subscribe(|rows| println!("{} open todos", rows.len()))
//!    .await?;
//!
//! // The declared change set refreshes the query; the listener fires again
//! db.mutate("INSERT INTO todos (title, done) VALUES (?, 0)", vec![json!("water plants")])
//!    .changes(ChangeSet::new().rows("todos", [1]))
//!    .await?;
//!
//! subscription.unsubscribe();
//! db.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod decode;
pub mod deps;
pub mod error;
pub mod query;
pub mod registry;
mod statement;
pub mod stream;
pub mod value;

pub use database::{LiveDatabase, LiveDatabaseConfig, MutationBuilder, WriteQueryResult};
pub use decode::{Row, Rows};
pub use deps::{ChangeSet, ChangedRows, Dependencies, DependencyRows, RecordId};
pub use error::{Error, Result};
pub use query::{LiveQuery, QuerySpec, QuerySubscription, QueryUpdate};
pub use registry::{ChangeRegistry, RefreshFn, RegistrySubscription, SubscriptionId};
pub use stream::RowStream;
pub use value::{bind_value, params_equal};
