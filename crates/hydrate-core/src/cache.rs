//! Second-level cache entries and region access.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityRef, PropertyValue};
use crate::error::Result;
use crate::identifier::Identifier;
use crate::persister::EntityPersister;
use crate::value::Value;

/// How a session interacts with the second-level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CacheMode {
    /// Read and write.
    #[default]
    Normal,
    /// Read only, never write.
    Get,
    /// Write only, never read.
    Put,
    /// Neither read nor write.
    Ignore,
    /// Write, overwriting existing entries, never read.
    Refresh,
}

impl CacheMode {
    pub const fn is_get_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    pub const fn is_put_enabled(self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

/// Key of an entity in a cache region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub identifier: Identifier,
    /// Hierarchy root, shared by every subclass.
    pub entity_name: String,
    pub tenant: Option<String>,
}

/// Disassembled property state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CachedValue {
    Basic(Value),
    /// Identifier of the referenced entity.
    ToOne(Option<Identifier>),
    /// Collections are cached separately; only the slot is kept.
    Collection,
    Component(Vec<CachedValue>),
}

/// A disassembled entity: concrete subclass, version and property state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredCacheEntry {
    pub subclass: String,
    pub version: Option<Value>,
    pub state: Vec<CachedValue>,
}

impl StructuredCacheEntry {
    /// Disassemble an initialized entity.
    pub fn disassemble(entity: &Entity, persister: &EntityPersister) -> Self {
        let version = persister
            .version_index()
            .and_then(|i| entity.value(i))
            .and_then(PropertyValue::as_basic)
            .cloned();
        Self {
            subclass: entity.entity_name().to_string(),
            version,
            state: entity.values().iter().map(disassemble_value).collect(),
        }
    }
}

fn disassemble_value(value: &PropertyValue) -> CachedValue {
    match value {
        PropertyValue::Basic(v) => CachedValue::Basic(v.clone()),
        PropertyValue::ToOne(target) => {
            CachedValue::ToOne(target.as_ref().map(|t| t.identifier().clone()))
        }
        PropertyValue::Collection(_) => CachedValue::Collection,
        PropertyValue::Component(values) => {
            CachedValue::Component(values.iter().map(disassemble_value).collect())
        }
    }
}

/// What a region hands back for a key.
#[derive(Debug, Clone)]
pub enum CacheEntry {
    /// The shared instance itself, only for immutable entities.
    Reference(EntityRef),
    Structured(StructuredCacheEntry),
}

/// Access to one entity cache region.
pub trait EntityDataAccess: Send + Sync + std::fmt::Debug {
    fn region_name(&self) -> &str;

    fn generate_cache_key(
        &self,
        identifier: &Identifier,
        persister: &EntityPersister,
        tenant: Option<&str>,
    ) -> CacheKey {
        CacheKey {
            identifier: identifier.clone(),
            entity_name: persister.root_entity_name().to_string(),
            tenant: tenant.map(str::to_string),
        }
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>>;

    /// Store an entry; returns whether the region accepted it.
    fn put(&self, key: CacheKey, entry: CacheEntry) -> Result<bool>;

    fn contains(&self, key: &CacheKey) -> bool;

    fn evict(&self, key: &CacheKey);

    fn evict_all(&self);
}

#[derive(Debug)]
enum StoredEntry {
    Reference(EntityRef),
    Serialized(String),
}

/// Region kept in process memory; structured entries are stored as JSON.
#[derive(Debug)]
pub struct InMemoryEntityRegion {
    name: String,
    entries: Mutex<HashMap<CacheKey, StoredEntry>>,
}

impl InMemoryEntityRegion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityDataAccess for InMemoryEntityRegion {
    fn region_name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            None => Ok(None),
            Some(StoredEntry::Reference(r)) => Ok(Some(CacheEntry::Reference(r.clone()))),
            Some(StoredEntry::Serialized(json)) => {
                let entry: StructuredCacheEntry = serde_json::from_str(json)?;
                Ok(Some(CacheEntry::Structured(entry)))
            }
        }
    }

    fn put(&self, key: CacheKey, entry: CacheEntry) -> Result<bool> {
        let stored = match entry {
            CacheEntry::Reference(r) => StoredEntry::Reference(r),
            CacheEntry::Structured(s) => StoredEntry::Serialized(serde_json::to_string(&s)?),
        };
        tracing::trace!(region = %self.name, id = %key.identifier, "cache put");
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, stored);
        Ok(true)
    }

    fn contains(&self, key: &CacheKey) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn evict(&self, key: &CacheKey) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn evict_all(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
