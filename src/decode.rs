//! Row and value decoding from SQLite to JSON.
//!
//! Query results are delivered as JSON-typed rows so listeners never touch
//! sqlx types directly. Decoding follows SQLite's declared type affinity;
//! BLOB values are base64-encoded strings since JSON has no binary type, and
//! booleans come back as INTEGER-backed `true`/`false`.

use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column as _, Row as _, TypeInfo as _, Value as _, ValueRef as _};
use time::PrimitiveDateTime;

use crate::error::Error;

/// A decoded result row: column name to JSON value, in column order.
pub type Row = IndexMap<String, JsonValue>;

/// A shared snapshot of a query result, delivered to every listener without
/// copying the rows.
pub type Rows = Arc<Vec<Row>>;

/// Decodes a full sqlx row into the JSON row shape.
pub(crate) fn decode_row(row: &SqliteRow) -> Result<Row, Error> {
   let mut decoded = Row::with_capacity(row.columns().len());

   for (i, column) in row.columns().iter().enumerate() {
      let value = to_json(row.try_get_raw(i)?)?;
      decoded.insert(column.name().to_string(), value);
   }

   Ok(decoded)
}

/// Converts a single SQLite value to a JSON value.
///
/// Values that fail to decode under their declared affinity come back as
/// `Null` rather than erroring; only a type this crate has no mapping for at
/// all is an error.
pub fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue, Error> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();
   let owned = value.to_owned();

   let decoded = match type_name.as_str() {
      // DATE and TIME are stored as ISO 8601 / HH:MM:SS text
      "TEXT" | "DATE" | "TIME" => owned.try_decode::<String>().ok().map(JsonValue::String),

      "REAL" => owned.try_decode::<f64>().ok().map(JsonValue::from),

      "INTEGER" | "NUMERIC" => owned
         .try_decode::<i64>()
         .ok()
         .map(|v| JsonValue::Number(v.into())),

      "BOOLEAN" => owned.try_decode::<bool>().ok().map(JsonValue::Bool),

      "DATETIME" => owned
         .try_decode::<PrimitiveDateTime>()
         .map(|dt| dt.to_string())
         .or_else(|_| owned.try_decode::<String>())
         .ok()
         .map(JsonValue::String),

      "BLOB" => owned
         .try_decode::<Vec<u8>>()
         .ok()
         .map(|blob| JsonValue::String(base64_encode(&blob))),

      "NULL" => Some(JsonValue::Null),

      other => match owned.try_decode::<String>() {
         Ok(text) => Some(JsonValue::String(text)),
         Err(_) => return Err(Error::UnsupportedDatatype(other.to_string())),
      },
   };

   Ok(decoded.unwrap_or(JsonValue::Null))
}

fn base64_encode(data: &[u8]) -> String {
   use base64::Engine;
   base64::engine::general_purpose::STANDARD.encode(data)
}
