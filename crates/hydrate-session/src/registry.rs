//! Loaders built on demand and shared by every session of a factory.
//!
//! A loader is built the first time a combination of entity, load kind,
//! dialect, lock options and load influencers is requested, then reused.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use hydrate_core::{
    Dialect, EntityPersister, Error, LoadQueryInfluencers, LockOptions, MappingErrorKind, Result,
};
use hydrate_query::BatchSize;

use crate::batching::{BatchingEntityLoader, LoaderSpec, SharedBatchingLoader};
use crate::entity_loader::EntityLoader;
use crate::factory::SessionFactory;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum LoaderKind {
    Identifier,
    UniqueKey(String),
    MultiLoad,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoaderKey {
    entity: String,
    kind: LoaderKind,
    dialect: Dialect,
    lock_options: LockOptions,
    influencers: LoadQueryInfluencers,
}

type LoaderMap<T> = RwLock<HashMap<LoaderKey, T>>;

fn get_or_build<T: Clone>(
    map: &LoaderMap<T>,
    key: LoaderKey,
    build: impl FnOnce() -> Result<T>,
) -> Result<T> {
    if let Some(loader) = map
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
    {
        return Ok(loader.clone());
    }
    let loader = build()?;
    tracing::debug!(entity = %key.entity, kind = ?key.kind, "built loader");
    // A concurrent builder may have won; keep whichever landed first.
    Ok(map
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(key)
        .or_insert(loader)
        .clone())
}

/// Registry of loaders keyed by everything that shapes their SQL.
#[derive(Debug, Default)]
pub struct LoaderRegistry {
    batching: LoaderMap<SharedBatchingLoader>,
    single: LoaderMap<Arc<EntityLoader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loaders built so far.
    pub fn len(&self) -> usize {
        self.batching
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
            + self
                .single
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.batching
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.single
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// The identifier loader for `persister`, in the factory's batch fetch
    /// style.
    pub fn batching_loader(
        &self,
        factory: &SessionFactory,
        persister: &EntityPersister,
        dialect: Dialect,
        lock_options: LockOptions,
        influencers: &LoadQueryInfluencers,
    ) -> Result<SharedBatchingLoader> {
        let key = LoaderKey {
            entity: persister.entity_name().to_string(),
            kind: LoaderKind::Identifier,
            dialect,
            lock_options,
            influencers: influencers.clone(),
        };
        get_or_build(&self.batching, key, || {
            let spec = LoaderSpec {
                factory,
                persister,
                dialect,
                lock_options,
                influencers,
            };
            BatchingEntityLoader::build(factory.settings().batch_fetch_style, &spec).map(Arc::new)
        })
    }

    /// A single-row loader restricted by the columns of `property`, a
    /// unique key of `persister`.
    pub fn unique_key_loader(
        &self,
        factory: &SessionFactory,
        persister: &EntityPersister,
        property: &str,
        dialect: Dialect,
        influencers: &LoadQueryInfluencers,
    ) -> Result<Arc<EntityLoader>> {
        let columns = persister
            .property_index(property)
            .and_then(|index| persister.property(index))
            .map(|mapping| mapping.columns.clone())
            .filter(|columns| !columns.is_empty())
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    Some(persister.entity_name()),
                    format!("'{property}' is not a column-backed property"),
                )
            })?;
        let key = LoaderKey {
            entity: persister.entity_name().to_string(),
            kind: LoaderKind::UniqueKey(property.to_string()),
            dialect,
            lock_options: LockOptions::NONE,
            influencers: influencers.clone(),
        };
        get_or_build(&self.single, key, || {
            let template = factory.build_template(
                persister,
                &columns,
                BatchSize::Fixed(1),
                dialect,
                LockOptions::NONE,
                influencers,
            )?;
            Ok(Arc::new(EntityLoader::new(
                template,
                factory.settings().statement_cache_size,
            )))
        })
    }

    /// A loader whose identifier restriction expands to any key count.
    pub fn multi_load_loader(
        &self,
        factory: &SessionFactory,
        persister: &EntityPersister,
        dialect: Dialect,
        lock_options: LockOptions,
        influencers: &LoadQueryInfluencers,
    ) -> Result<Arc<EntityLoader>> {
        let key = LoaderKey {
            entity: persister.entity_name().to_string(),
            kind: LoaderKind::MultiLoad,
            dialect,
            lock_options,
            influencers: influencers.clone(),
        };
        get_or_build(&self.single, key, || {
            let restriction: Vec<String> = persister
                .identifier_columns()
                .into_iter()
                .map(str::to_string)
                .collect();
            let template = factory.build_template(
                persister,
                &restriction,
                BatchSize::Dynamic,
                dialect,
                lock_options,
                influencers,
            )?;
            Ok(Arc::new(EntityLoader::new(
                template,
                factory.settings().statement_cache_size,
            )))
        })
    }
}
