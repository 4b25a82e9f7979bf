//! Dependency declarations and change sets.
//!
//! A live query declares which tables (and optionally which rows) its
//! result is computed from ([`Dependencies`]). A mutation declares which
//! tables and rows it touched ([`ChangeSet`]). The registry matches the two:
//! a query must recompute when some changed table appears in its
//! declaration and either side is the wildcard, or the two id sets
//! intersect.
//!
//! Declarations are caller-supplied. Nothing here parses SQL or verifies a
//! change set against what the write actually modified.

use std::collections::HashSet;

use indexmap::IndexMap;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Wire marker for "every row of the table".
const WILDCARD: &str = "*";

/// Identifier of a single row within a table.
///
/// Serialized untagged: a JSON number or a JSON string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
   Integer(i64),
   Text(String),
}

impl From<i64> for RecordId {
   fn from(id: i64) -> Self {
      RecordId::Integer(id)
   }
}

impl From<i32> for RecordId {
   fn from(id: i32) -> Self {
      RecordId::Integer(id.into())
   }
}

impl From<&str> for RecordId {
   fn from(id: &str) -> Self {
      RecordId::Text(id.to_string())
   }
}

impl From<String> for RecordId {
   fn from(id: String) -> Self {
      RecordId::Text(id)
   }
}

/// The rows of one table that a query result depends on.
///
/// Membership is what matters on this side: ids are a set, unordered and
/// deduplicated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyRows {
   /// Any change to the table is relevant.
   All,
   /// Only changes to these rows are relevant.
   Ids(HashSet<RecordId>),
}

impl Serialize for DependencyRows {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      match self {
         DependencyRows::All => serializer.serialize_str(WILDCARD),
         DependencyRows::Ids(ids) => ids.serialize(serializer),
      }
   }
}

impl<'de> Deserialize<'de> for DependencyRows {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      #[derive(Deserialize)]
      #[serde(untagged)]
      enum Repr {
         Marker(String),
         Ids(HashSet<RecordId>),
      }

      match Repr::deserialize(deserializer)? {
         Repr::Marker(s) if s == WILDCARD => Ok(DependencyRows::All),
         Repr::Marker(s) => Err(D::Error::custom(format!(
            "expected \"*\" or a list of record ids, got string {s:?}"
         ))),
         Repr::Ids(ids) => Ok(DependencyRows::Ids(ids)),
      }
   }
}

/// The rows of one table that a mutation touched.
///
/// The write side keeps the caller's ordered list as declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangedRows {
   /// The whole table may have changed.
   All,
   /// Exactly these rows changed.
   Ids(Vec<RecordId>),
}

impl Serialize for ChangedRows {
   fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
      match self {
         ChangedRows::All => serializer.serialize_str(WILDCARD),
         ChangedRows::Ids(ids) => ids.serialize(serializer),
      }
   }
}

impl<'de> Deserialize<'de> for ChangedRows {
   fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
      #[derive(Deserialize)]
      #[serde(untagged)]
      enum Repr {
         Marker(String),
         Ids(Vec<RecordId>),
      }

      match Repr::deserialize(deserializer)? {
         Repr::Marker(s) if s == WILDCARD => Ok(ChangedRows::All),
         Repr::Marker(s) => Err(D::Error::custom(format!(
            "expected \"*\" or a list of record ids, got string {s:?}"
         ))),
         Repr::Ids(ids) => Ok(ChangedRows::Ids(ids)),
      }
   }
}

/// What a query's result depends on: at most one entry per table.
///
/// Equality is wildcard-aware set equality: same table keys, and per table
/// either both sides are the wildcard or both enumerate the same id
/// membership (order irrelevant on both levels). This is the rule deciding
/// whether a dependency update has to re-subscribe with the registry.
///
/// ```
/// use sqlx_sqlite_live::Dependencies;
///
/// let deps = Dependencies::new().all("users").rows("posts", [1, 2]);
/// assert_eq!(deps, Dependencies::new().rows("posts", [2, 1]).all("users"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dependencies {
   tables: IndexMap<String, DependencyRows>,
}

impl Dependencies {
   /// Creates an empty declaration (depends on nothing).
   pub fn new() -> Self {
      Self::default()
   }

   /// Depends on every row of `table`.
   pub fn all(mut self, table: impl Into<String>) -> Self {
      self.tables.insert(table.into(), DependencyRows::All);
      self
   }

   /// Depends on specific rows of `table`. Replaces any previous entry for
   /// the same table.
   pub fn rows<I, R>(mut self, table: impl Into<String>, ids: I) -> Self
   where
      I: IntoIterator<Item = R>,
      R: Into<RecordId>,
   {
      self.tables.insert(
         table.into(),
         DependencyRows::Ids(ids.into_iter().map(Into::into).collect()),
      );
      self
   }

   /// Number of declared tables.
   pub fn len(&self) -> usize {
      self.tables.len()
   }

   /// True when no table is declared.
   pub fn is_empty(&self) -> bool {
      self.tables.is_empty()
   }

   /// The declared rows for `table`, if any.
   pub fn get(&self, table: &str) -> Option<&DependencyRows> {
      self.tables.get(table)
   }

   /// True when `changes` touches anything this declaration covers.
   ///
   /// A wildcard on either side of a matching table is sufficient; two
   /// enumerations match when they share at least one id. Tables absent
   /// from the declaration never match.
   pub fn matched_by(&self, changes: &ChangeSet) -> bool {
      changes.iter().any(|(table, rows)| match self.tables.get(table) {
         Some(DependencyRows::All) => true,
         Some(DependencyRows::Ids(ids)) => match rows {
            ChangedRows::All => true,
            ChangedRows::Ids(changed) => changed.iter().any(|id| ids.contains(id)),
         },
         None => false,
      })
   }
}

/// What a mutation touched: at most one entry per table, declared once per
/// write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet {
   tables: IndexMap<String, ChangedRows>,
}

impl ChangeSet {
   /// Creates an empty change set (notifies nobody).
   pub fn new() -> Self {
      Self::default()
   }

   /// Declares that the whole of `table` may have changed.
   pub fn all(mut self, table: impl Into<String>) -> Self {
      self.tables.insert(table.into(), ChangedRows::All);
      self
   }

   /// Declares that exactly these rows of `table` changed. Replaces any
   /// previous entry for the same table.
   pub fn rows<I, R>(mut self, table: impl Into<String>, ids: I) -> Self
   where
      I: IntoIterator<Item = R>,
      R: Into<RecordId>,
   {
      self.tables.insert(
         table.into(),
         ChangedRows::Ids(ids.into_iter().map(Into::into).collect()),
      );
      self
   }

   /// Number of touched tables.
   pub fn len(&self) -> usize {
      self.tables.len()
   }

   /// True when no table was touched.
   pub fn is_empty(&self) -> bool {
      self.tables.is_empty()
   }

   /// Iterates over the touched tables in declaration order.
   pub fn iter(&self) -> impl Iterator<Item = (&str, &ChangedRows)> {
      self.tables.iter().map(|(table, rows)| (table.as_str(), rows))
   }
}
