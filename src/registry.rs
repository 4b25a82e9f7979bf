//! The change-notification registry.
//!
//! One registry per database. Every observing query holds exactly one entry
//! pairing its refresh callback with the dependency declaration its current
//! result was computed under. [`ChangeRegistry::notify`] walks the entries
//! in registration order and fires each matching callback at most once per
//! pass, regardless of how many changed tables matched it.
//!
//! Entries are keyed by opaque incrementing tokens, never by callback
//! identity, and each query is the exclusive writer of its own entry: only
//! the owning [`RegistrySubscription`] can remove or retarget it.

use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::deps::{ChangeSet, Dependencies};
use crate::error::Result;

/// Opaque token identifying one registry entry.
pub type SubscriptionId = u64;

/// A refresh callback: re-executes the owning query and pushes the fresh
/// snapshot to its listeners.
pub type RefreshFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct RegistryEntry {
   dependencies: Dependencies,
   refresh: RefreshFn,
}

#[derive(Default)]
struct EntryTable {
   entries: IndexMap<SubscriptionId, RegistryEntry>,
   next_id: SubscriptionId,
}

/// Routes declared change sets to the queries whose dependencies they touch.
pub struct ChangeRegistry {
   table: Mutex<EntryTable>,
   /// Serializes notification passes so refreshes driven by two concurrent
   /// mutations cannot interleave.
   notify_gate: tokio::sync::Mutex<()>,
}

impl ChangeRegistry {
   pub(crate) fn new() -> Arc<Self> {
      Arc::new(Self {
         table: Mutex::new(EntryTable::default()),
         notify_gate: tokio::sync::Mutex::new(()),
      })
   }

   /// Registers `refresh` under `dependencies`.
   ///
   /// The returned handle owns the entry: dropping it (or calling
   /// [`RegistrySubscription::unsubscribe`]) removes the entry.
   pub fn subscribe(
      self: &Arc<Self>,
      dependencies: Dependencies,
      refresh: RefreshFn,
   ) -> RegistrySubscription {
      let mut table = self.table.lock();
      let id = table.next_id;
      table.next_id += 1;

      trace!(id, tables = dependencies.len(), "registering subscription");
      table.entries.insert(
         id,
         RegistryEntry {
            dependencies,
            refresh,
         },
      );

      RegistrySubscription {
         registry: Arc::downgrade(self),
         id,
      }
   }

   /// Fires the refresh callback of every entry the change set touches.
   ///
   /// The entry table is snapshotted at the start of the pass: an entry
   /// removed while the pass runs still fires if it was already selected,
   /// and entries added mid-pass are not seen. Refreshes run sequentially
   /// in registration order; the first error aborts the pass and
   /// propagates to the caller (single attempt, no retry).
   pub async fn notify(&self, changes: &ChangeSet) -> Result<()> {
      if changes.is_empty() {
         return Ok(());
      }

      let _pass = self.notify_gate.lock().await;

      let matched: Vec<(SubscriptionId, RefreshFn)> = {
         let table = self.table.lock();
         table
            .entries
            .iter()
            .filter(|(_, entry)| entry.dependencies.matched_by(changes))
            .map(|(id, entry)| (*id, Arc::clone(&entry.refresh)))
            .collect()
      };

      if matched.is_empty() {
         return Ok(());
      }

      debug!(
         matched = matched.len(),
         tables = changes.len(),
         "dispatching change notifications"
      );

      for (id, refresh) in matched {
         trace!(id, "refreshing subscriber");
         refresh().await?;
      }

      Ok(())
   }

   /// Number of registered entries.
   pub fn len(&self) -> usize {
      self.table.lock().entries.len()
   }

   /// True when nothing is registered.
   pub fn is_empty(&self) -> bool {
      self.len() == 0
   }
}

impl std::fmt::Debug for ChangeRegistry {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ChangeRegistry")
         .field("entries", &self.len())
         .finish()
   }
}

/// Handle to one registry entry, owned by the query that created it.
///
/// Dropping the handle removes the entry, so a forgotten handle cannot leak
/// a registry slot.
pub struct RegistrySubscription {
   registry: Weak<ChangeRegistry>,
   id: SubscriptionId,
}

impl RegistrySubscription {
   /// Removes the entry. No-op if already removed or the registry is gone.
   pub fn unsubscribe(&self) {
      if let Some(registry) = self.registry.upgrade()
         && registry.table.lock().entries.shift_remove(&self.id).is_some()
      {
         trace!(id = self.id, "removed subscription");
      }
   }

   /// Replaces the stored dependencies in place.
   ///
   /// Callback identity and registration order are unchanged. No-op if the
   /// entry was removed.
   pub fn update_dependencies(&self, dependencies: Dependencies) {
      if let Some(registry) = self.registry.upgrade()
         && let Some(entry) = registry.table.lock().entries.get_mut(&self.id)
      {
         trace!(id = self.id, tables = dependencies.len(), "retargeting subscription");
         entry.dependencies = dependencies;
      }
   }
}

impl Drop for RegistrySubscription {
   fn drop(&mut self) {
      self.unsubscribe();
   }
}
