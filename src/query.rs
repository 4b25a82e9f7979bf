//! Live query handles.
//!
//! A [`LiveQuery`] couples one SQL statement with the dependency declaration
//! describing what its result is computed from. It is created inert: no
//! statement runs and no registry slot is held until the first listener
//! subscribes. Activation executes the query once, caches the snapshot, and
//! registers the refresh routine with the database's change registry; when
//! the last listener leaves, the registry entry is torn down and the query
//! is inert again. Subscribing later re-activates it from scratch.

use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tracing::{debug, trace};

use crate::database::DatabaseInner;
use crate::decode::Rows;
use crate::deps::Dependencies;
use crate::error::Result;
use crate::registry::{ChangeRegistry, RefreshFn, RegistrySubscription};
use crate::statement::PreparedQuery;
use crate::stream::RowStream;
use crate::value::params_equal;

/// Specification for creating a live query.
#[derive(Debug, Clone)]
pub struct QuerySpec {
   sql: String,
   parameters: Vec<JsonValue>,
   dependencies: Dependencies,
}

impl QuerySpec {
   /// A query with no parameters and no dependencies.
   ///
   /// A dependency-free query executes on subscription but is never
   /// refreshed by writes.
   pub fn new(sql: impl Into<String>) -> Self {
      Self {
         sql: sql.into(),
         parameters: Vec::new(),
         dependencies: Dependencies::new(),
      }
   }

   /// Sets the positional parameters.
   pub fn with_parameters(mut self, parameters: Vec<JsonValue>) -> Self {
      self.parameters = parameters;
      self
   }

   /// Declares what the query result depends on.
   pub fn with_dependencies(mut self, dependencies: Dependencies) -> Self {
      self.dependencies = dependencies;
      self
   }
}

/// A partial reconfiguration of a live query.
///
/// Unset fields are left untouched. Set fields are compared against the
/// current value and applied only when they actually differ, so passing the
/// current configuration back is always a no-op.
#[derive(Debug, Clone, Default)]
pub struct QueryUpdate {
   sql: Option<String>,
   parameters: Option<Vec<JsonValue>>,
   dependencies: Option<Dependencies>,
}

impl QueryUpdate {
   pub fn new() -> Self {
      Self::default()
   }

   /// Replaces the SQL text.
   pub fn sql(mut self, sql: impl Into<String>) -> Self {
      self.sql = Some(sql.into());
      self
   }

   /// Replaces the positional parameters.
   pub fn parameters(mut self, parameters: Vec<JsonValue>) -> Self {
      self.parameters = Some(parameters);
      self
   }

   /// Replaces the dependency declaration.
   pub fn dependencies(mut self, dependencies: Dependencies) -> Self {
      self.dependencies = Some(dependencies);
      self
   }
}

type ListenerId = u64;
type Listener = Arc<dyn Fn(Rows) + Send + Sync>;

struct QueryState {
   statement: PreparedQuery,
   dependencies: Dependencies,
   cached: Option<Rows>,
   listeners: IndexMap<ListenerId, Listener>,
   next_listener_id: ListenerId,
   /// Present iff the query is observing (has at least one listener).
   registry_subscription: Option<RegistrySubscription>,
}

pub(crate) struct QueryShared {
   db: Arc<DatabaseInner>,
   registry: Arc<ChangeRegistry>,
   state: Mutex<QueryState>,
}

impl QueryShared {
   /// Runs the statement with its current bindings, replaces the cached
   /// snapshot, and delivers it to every listener in insertion order.
   ///
   /// The cache is replaced only on success: a failing run leaves the
   /// previous snapshot in place for existing listeners.
   async fn execute(self: &Arc<Self>) -> Result<()> {
      let statement = self.state.lock().statement.clone();
      let rows: Rows = Arc::new(statement.fetch_all(self.db.read_pool()?).await?);

      // Listener callbacks run outside the state lock; removal during this
      // delivery pass does not suppress it.
      let listeners: Vec<Listener> = {
         let mut state = self.state.lock();
         state.cached = Some(Arc::clone(&rows));
         state.listeners.values().cloned().collect()
      };

      trace!(
         sql = %statement.sql(),
         rows = rows.len(),
         listeners = listeners.len(),
         "delivering query result"
      );

      for listener in listeners {
         listener(Arc::clone(&rows));
      }

      Ok(())
   }

   /// Registry-driven refresh. Re-checks the listener table first: a pass
   /// that snapshotted this entry just before teardown must not make a
   /// listenerless query hit the store.
   async fn refresh(self: Arc<Self>) -> Result<()> {
      if self.state.lock().listeners.is_empty() {
         trace!("skipping refresh for query without listeners");
         return Ok(());
      }

      self.execute().await
   }
}

fn refresh_fn(shared: Weak<QueryShared>) -> RefreshFn {
   Arc::new(move || {
      let shared = shared.clone();
      Box::pin(async move {
         match shared.upgrade() {
            Some(shared) => shared.refresh().await,
            None => Ok(()),
         }
      })
   })
}

/// A dependency-tracked query whose result follows the database.
///
/// Cloning is cheap; clones share the same state, listeners, and registry
/// slot.
#[derive(Clone)]
pub struct LiveQuery {
   shared: Arc<QueryShared>,
}

impl LiveQuery {
   pub(crate) fn new(
      db: Arc<DatabaseInner>,
      registry: Arc<ChangeRegistry>,
      spec: QuerySpec,
   ) -> Self {
      let mut statement = PreparedQuery::new(spec.sql);
      statement.bind(spec.parameters);

      Self {
         shared: Arc::new(QueryShared {
            db,
            registry,
            state: Mutex::new(QueryState {
               statement,
               dependencies: spec.dependencies,
               cached: None,
               listeners: IndexMap::new(),
               next_listener_id: 0,
               registry_subscription: None,
            }),
         }),
      }
   }

   /// Current SQL text.
   pub fn sql(&self) -> String {
      self.shared.state.lock().statement.sql().to_string()
   }

   /// Number of attached listeners.
   pub fn listener_count(&self) -> usize {
      self.shared.state.lock().listeners.len()
   }

   /// True while the query holds a registry slot (has listeners).
   pub fn is_observing(&self) -> bool {
      self.shared.state.lock().registry_subscription.is_some()
   }

   /// Attaches a listener.
   ///
   /// The first listener activates the query: it executes immediately and
   /// registers with the change registry, so an execution error surfaces
   /// from this call. The listener is then delivered the current snapshot
   /// synchronously (even when that snapshot was already delivered to other
   /// listeners) and every fresh snapshot afterwards.
   pub async fn subscribe<F>(&self, listener: F) -> Result<QuerySubscription>
   where
      F: Fn(Rows) + Send + Sync + 'static,
   {
      let listener: Listener = Arc::new(listener);

      let activate = {
         let state = self.shared.state.lock();
         state.listeners.is_empty() && state.registry_subscription.is_none()
      };

      if activate {
         QueryShared::execute(&self.shared).await?;

         let mut state = self.shared.state.lock();
         if state.registry_subscription.is_none() {
            let refresh = refresh_fn(Arc::downgrade(&self.shared));
            let subscription = self
               .shared
               .registry
               .subscribe(state.dependencies.clone(), refresh);
            state.registry_subscription = Some(subscription);
            debug!(sql = %state.statement.sql(), "live query activated");
         }
      }

      let (id, snapshot) = {
         let mut state = self.shared.state.lock();
         let id = state.next_listener_id;
         state.next_listener_id += 1;
         state.listeners.insert(id, Arc::clone(&listener));
         (id, state.cached.clone())
      };

      if let Some(rows) = snapshot {
         listener(rows);
      }

      Ok(QuerySubscription {
         shared: Arc::clone(&self.shared),
         id,
      })
   }

   /// Subscribes and exposes the result snapshots as an async stream.
   ///
   /// The first item is the snapshot current at subscription time. Dropping
   /// the stream detaches the underlying listener.
   pub async fn watch(&self) -> Result<RowStream> {
      let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

      let subscription = self
         .subscribe(move |rows| {
            let _ = tx.send(rows);
         })
         .await?;

      Ok(RowStream::new(rx, subscription))
   }

   /// Applies a partial reconfiguration.
   ///
   /// Each supplied field is compared against the current value with the
   /// field's equality rule (text equality for SQL, positional value
   /// equality for parameters, wildcard-aware set equality for
   /// dependencies); equal fields are ignored. A changed SQL text rebuilds
   /// the statement against the new text; changed dependencies retarget the
   /// registry entry in place when observing (while inert they simply
   /// replace state, taking effect on the next subscribe). When anything
   /// changed and the query is observing, it re-executes exactly once.
   pub async fn update(&self, update: QueryUpdate) -> Result<()> {
      let (changed, observing) = {
         let mut state = self.shared.state.lock();
         let mut changed = false;

         if let Some(sql) = update.sql
            && sql != state.statement.sql()
         {
            trace!(sql = %sql, "replacing query text");
            let parameters = state.statement.parameters().to_vec();
            let mut statement = PreparedQuery::new(sql);
            statement.bind(parameters);
            state.statement = statement;
            changed = true;
         }

         if let Some(parameters) = update.parameters
            && !params_equal(&parameters, state.statement.parameters())
         {
            state.statement.bind(parameters);
            changed = true;
         }

         if let Some(dependencies) = update.dependencies
            && dependencies != state.dependencies
         {
            if let Some(subscription) = &state.registry_subscription {
               subscription.update_dependencies(dependencies.clone());
            }
            state.dependencies = dependencies;
            changed = true;
         }

         (changed, state.registry_subscription.is_some())
      };

      if changed && observing {
         QueryShared::execute(&self.shared).await?;
      }

      Ok(())
   }
}

/// Guard for one listener attachment.
///
/// Unsubscribing is synchronous, takes effect immediately, and is
/// idempotent. Dropping the guard unsubscribes as well.
#[must_use = "dropping the subscription detaches the listener"]
pub struct QuerySubscription {
   shared: Arc<QueryShared>,
   id: ListenerId,
}

impl QuerySubscription {
   /// Detaches the listener. When the last listener leaves, the query's
   /// registry entry is torn down and the query returns to the inert
   /// state.
   pub fn unsubscribe(&self) {
      let torn_down = {
         let mut state = self.shared.state.lock();
         if state.listeners.shift_remove(&self.id).is_none() {
            return; // already detached
         }
         if state.listeners.is_empty() {
            state.registry_subscription.take()
         } else {
            None
         }
      };

      if let Some(subscription) = torn_down {
         subscription.unsubscribe();
         debug!("live query deactivated");
      }
   }
}

impl Drop for QuerySubscription {
   fn drop(&mut self) {
      self.unsubscribe();
   }
}
