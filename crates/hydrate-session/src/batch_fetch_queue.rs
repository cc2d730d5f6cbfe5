//! Keys waiting to be loaded together.
//!
//! Proxies of batch-loadable entities register their key here; the next load
//! of any of them fetches its queued siblings in the same statement.

use hydrate_core::{EntityKey, EntityPersister, Identifier};
use indexmap::{IndexMap, IndexSet};

/// Per entity name, an insertion-ordered set of keys awaiting a batch load.
#[derive(Debug, Default)]
pub struct BatchFetchQueue {
    batch_loadable: IndexMap<String, IndexSet<EntityKey>>,
}

impl BatchFetchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `key` for `entity_name`. Returns false when already queued.
    pub fn add_batch_loadable_entity_key(&mut self, entity_name: &str, key: EntityKey) -> bool {
        self.batch_loadable
            .entry(entity_name.to_string())
            .or_default()
            .insert(key)
    }

    /// Drop `key` from every queue it is in.
    pub fn remove_batch_loadable_entity_key(&mut self, key: &EntityKey) -> bool {
        let mut removed = false;
        for keys in self.batch_loadable.values_mut() {
            removed |= keys.shift_remove(key);
        }
        removed
    }

    pub fn contains_entity_key(&self, key: &EntityKey) -> bool {
        self.batch_loadable.values().any(|keys| keys.contains(key))
    }

    /// Number of keys queued for `entity_name`.
    pub fn len_for(&self, entity_name: &str) -> usize {
        self.batch_loadable.get(entity_name).map_or(0, IndexSet::len)
    }

    pub fn is_empty(&self) -> bool {
        self.batch_loadable.values().all(IndexSet::is_empty)
    }

    pub fn clear(&mut self) {
        self.batch_loadable.clear();
    }

    /// Identifiers to load together with `id`, `batch_size` slots long.
    ///
    /// Slot 0 is always `id`. The rest are filled from the queue in
    /// insertion order, skipping keys `is_cached` reports as present in the
    /// second-level cache. When the queue holds more keys than slots, filling
    /// wraps around so the keys queued right after `id` win. Unused slots
    /// are `None`.
    pub fn entity_batch(
        &self,
        persister: &EntityPersister,
        id: &Identifier,
        batch_size: usize,
        is_cached: impl Fn(&EntityKey) -> bool,
    ) -> Vec<Option<Identifier>> {
        let mut ids: Vec<Option<Identifier>> = vec![None; batch_size.max(1)];
        ids[0] = Some(id.clone());
        let Some(keys) = self.batch_loadable.get(persister.entity_name()) else {
            return ids;
        };
        if ids.len() == 1 {
            return ids;
        }

        let identifier_type = persister.identifier_type();
        let mut i = 1;
        let mut end: Option<usize> = None;
        let mut check_for_end = false;
        for key in keys {
            if check_for_end && Some(i) == end {
                // Wrapped around to where the requested id was found.
                return ids;
            }
            if identifier_type.is_equal(id, key.identifier()) {
                end = Some(i);
            } else if !is_cached(key) {
                ids[i] = Some(key.identifier().clone());
                i += 1;
            }
            if i == ids.len() {
                i = 1;
                if end.is_some() {
                    check_for_end = true;
                }
            }
        }
        ids
    }
}
