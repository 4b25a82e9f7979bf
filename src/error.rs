//! Error types for the sqlx-sqlite-live crate.

/// Result type alias for live-query operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running live queries and mutations.
///
/// Statement failures from the store are not caught anywhere in the crate:
/// they surface from the first `subscribe` call, from `update`, or from the
/// mutation whose notification pass triggered the failing refresh.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// The database has been closed and can no longer be used.
   #[error("database is closed")]
   DatabaseClosed,

   /// SQLite type that cannot be mapped to JSON.
   #[error("unsupported datatype: {0}")]
   UnsupportedDatatype(String),

   /// I/O error when accessing database files.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}
