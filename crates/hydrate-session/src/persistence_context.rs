//! The persistence context: the session's identity map.
//!
//! Every entity a session has seen is registered here under its
//! [`EntityKey`], together with an [`EntityEntry`] recording its status,
//! lock mode and version. Proxies live in a separate map until the row
//! behind them is loaded.

use std::collections::{HashMap, VecDeque};

use hydrate_core::{EntityKey, EntityRef, Identifier, LockMode, Value};

use crate::batch_fetch_queue::BatchFetchQueue;

/// Lifecycle status of a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    Managed,
    ReadOnly,
    /// Deleted in this session, not yet flushed.
    Deleted,
    /// Deleted and flushed.
    Gone,
    /// Registered while its row is being hydrated.
    Loading,
}

impl EntityStatus {
    pub const fn is_deleted_or_gone(self) -> bool {
        matches!(self, EntityStatus::Deleted | EntityStatus::Gone)
    }

    pub const fn is_managed(self) -> bool {
        matches!(self, EntityStatus::Managed | EntityStatus::ReadOnly)
    }
}

/// Bookkeeping for one registered entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEntry {
    pub status: EntityStatus,
    pub lock_mode: LockMode,
    pub version: Option<Value>,
    /// Concrete entity name of the instance.
    pub entity_name: String,
}

/// Where a deferred to-one is found once its load runs.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DeferredRestriction {
    Identifier(Identifier),
    /// Target row whose `property` references the owner.
    UniqueKey { property: String, value: Identifier },
}

/// Work queued during assembly and run once the current load completes.
#[derive(Debug, Clone)]
pub(crate) enum PendingLoad {
    /// Initialize a registered proxy of a non-lazy entity.
    Entity {
        entity_name: String,
        identifier: Identifier,
    },
    /// Resolve a to-one the row could not supply and store it on `owner`.
    Property {
        owner: EntityRef,
        path: Vec<usize>,
        entity_name: String,
        restriction: DeferredRestriction,
    },
}

/// Identity map, entity entries, proxies and the batch-fetch queue of one
/// session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: HashMap<EntityKey, EntityRef>,
    entries: HashMap<EntityKey, EntityEntry>,
    proxies: HashMap<EntityKey, EntityRef>,
    batch_fetch_queue: BatchFetchQueue,
    pending: VecDeque<PendingLoad>,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered instance for `key`, whatever its status.
    pub fn get_entity(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.entities.get(key)
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// Register `entity` under `key`, replacing any proxy for the same key.
    pub fn add_entity(
        &mut self,
        key: EntityKey,
        entity: EntityRef,
        status: EntityStatus,
        lock_mode: LockMode,
        version: Option<Value>,
    ) {
        let entity_name = entity.entity_name();
        self.proxies.remove(&key);
        self.entries.insert(
            key.clone(),
            EntityEntry {
                status,
                lock_mode,
                version,
                entity_name,
            },
        );
        self.entities.insert(key, entity);
    }

    pub fn set_status(&mut self, key: &EntityKey, status: EntityStatus) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.status = status;
        }
    }

    pub fn set_entity_name(&mut self, key: &EntityKey, entity_name: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.entity_name = entity_name.into();
        }
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<&EntityRef> {
        self.proxies.get(key)
    }

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityRef) {
        self.proxies.insert(key, proxy);
    }

    /// Forget `key` entirely: entity, entry, proxy and queued batch load.
    pub fn remove(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.entries.remove(key);
        self.proxies.remove(key);
        self.batch_fetch_queue.remove_batch_loadable_entity_key(key);
        self.entities.remove(key)
    }

    /// Is this exact instance registered (as an entity or a proxy)?
    pub fn contains_instance(&self, key: &EntityKey, instance: &EntityRef) -> bool {
        self.entities
            .get(key)
            .or_else(|| self.proxies.get(key))
            .is_some_and(|r| r.same(instance))
    }

    pub fn batch_fetch_queue(&self) -> &BatchFetchQueue {
        &self.batch_fetch_queue
    }

    pub fn batch_fetch_queue_mut(&mut self) -> &mut BatchFetchQueue {
        &mut self.batch_fetch_queue
    }

    pub(crate) fn push_pending(&mut self, load: PendingLoad) {
        self.pending.push_back(load);
    }

    pub(crate) fn pop_pending(&mut self) -> Option<PendingLoad> {
        self.pending.pop_front()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending.clear();
    }

    /// Number of registered entities.
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.entries.clear();
        self.proxies.clear();
        self.batch_fetch_queue.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrate_core::EntityPersister;

    fn key(id: i64) -> EntityKey {
        EntityPersister::builder("Person", "people")
            .build()
            .entity_key(Identifier::from(id))
    }

    #[test]
    fn entities_replace_proxies() {
        let mut context = PersistenceContext::new();
        let proxy = EntityRef::proxy("Person", Identifier::from(1_i64));
        context.add_proxy(key(1), proxy.clone());
        assert!(context.get_entity(&key(1)).is_none());
        assert!(context.contains_instance(&key(1), &proxy));

        context.add_entity(key(1), proxy.clone(), EntityStatus::Loading, LockMode::None, None);
        assert!(context.get_proxy(&key(1)).is_none());
        assert_eq!(context.entry(&key(1)).unwrap().status, EntityStatus::Loading);
        context.set_status(&key(1), EntityStatus::Managed);
        assert!(context.entry(&key(1)).unwrap().status.is_managed());
    }

    #[test]
    fn remove_forgets_everything() {
        let mut context = PersistenceContext::new();
        let person = EntityRef::new("Person", Identifier::from(1_i64), Vec::new());
        context.add_entity(key(1), person, EntityStatus::Managed, LockMode::Read, None);
        context
            .batch_fetch_queue_mut()
            .add_batch_loadable_entity_key("Person", key(1));
        assert!(context.remove(&key(1)).is_some());
        assert!(context.entry(&key(1)).is_none());
        assert!(context.batch_fetch_queue().is_empty());
        assert!(context.is_empty());
    }

    #[test]
    fn statuses() {
        assert!(EntityStatus::Gone.is_deleted_or_gone());
        assert!(!EntityStatus::Loading.is_managed());
        assert!(EntityStatus::ReadOnly.is_managed());
    }
}
