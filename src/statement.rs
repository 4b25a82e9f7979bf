//! Prepared query execution at the store boundary.

use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteConnection, SqliteQueryResult};
use sqlx::{Pool, Sqlite};

use crate::decode::{Row, decode_row};
use crate::error::Result;
use crate::value::bind_value;

/// A parameterized SQL statement together with its current positional
/// bindings.
///
/// sqlx keeps prepared statements in a per-connection cache keyed by the SQL
/// text, so running a `PreparedQuery` prepares on first use and reuses the
/// compiled statement afterwards. Replacing the text replaces the statement:
/// the next run compiles and caches the new text.
#[derive(Debug, Clone)]
pub(crate) struct PreparedQuery {
   sql: String,
   parameters: Vec<JsonValue>,
}

impl PreparedQuery {
   pub(crate) fn new(sql: impl Into<String>) -> Self {
      Self {
         sql: sql.into(),
         parameters: Vec::new(),
      }
   }

   /// Replaces the positional bindings.
   pub(crate) fn bind(&mut self, parameters: Vec<JsonValue>) {
      self.parameters = parameters;
   }

   pub(crate) fn sql(&self) -> &str {
      &self.sql
   }

   pub(crate) fn parameters(&self) -> &[JsonValue] {
      &self.parameters
   }

   /// Runs as a read query on the pool and decodes every row.
   pub(crate) async fn fetch_all(&self, pool: &Pool<Sqlite>) -> Result<Vec<Row>> {
      let mut query = sqlx::query(&self.sql);
      for value in &self.parameters {
         query = bind_value(query, value.clone());
      }

      let rows = query.fetch_all(pool).await?;
      rows.iter().map(decode_row).collect()
   }

   /// Runs as a write statement on the given connection.
   pub(crate) async fn execute(&self, conn: &mut SqliteConnection) -> Result<SqliteQueryResult> {
      let mut query = sqlx::query(&self.sql);
      for value in &self.parameters {
         query = bind_value(query, value.clone());
      }

      Ok(query.execute(conn).await?)
   }
}
