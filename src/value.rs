//! Positional parameter values and binding.
//!
//! Parameters are plain `serde_json::Value`s bound positionally to a
//! statement. [`params_equal`] is the equality rule deciding whether a
//! parameter update actually changes anything; redundant re-binds and
//! re-executions are skipped when it holds.

use serde_json::Value as JsonValue;

/// A sqlx query against SQLite, as built up while binding parameters.
pub type SqliteQuery<'a> = sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>;

/// Binds a JSON value to the next positional slot of a query.
///
/// Numbers are bound as `i64` whenever they fit, so integer ids survive the
/// round trip without becoming floats. Values SQLite has no native type for
/// fall through to sqlx's JSON encoding.
pub fn bind_value(query: SqliteQuery<'_>, value: JsonValue) -> SqliteQuery<'_> {
   match value {
      JsonValue::Null => query.bind(None::<JsonValue>),
      JsonValue::Bool(b) => query.bind(b),
      JsonValue::String(s) => query.bind(s),
      JsonValue::Number(n) => {
         if let Some(int_val) = n.as_i64() {
            query.bind(int_val)
         } else {
            // u64 beyond i64::MAX or a fraction: f64 is the best SQLite offers
            query.bind(n.as_f64().unwrap_or_default())
         }
      }
      other => query.bind(other),
   }
}

/// Structural equality for positional parameter lists.
///
/// True iff both lists have the same length and every position holds an
/// equal value.
pub fn params_equal(a: &[JsonValue], b: &[JsonValue]) -> bool {
   a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x == y)
}
