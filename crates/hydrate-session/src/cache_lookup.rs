//! Session and second-level cache probes run before any SQL.
//!
//! Both probes are free functions over the session: the first consults the
//! persistence context (upgrading the lock of a managed hit), the second the
//! entity's cache region.

use std::sync::Arc;

use hydrate_core::{
    CacheEntry, CachedValue, Connection, Cx, EntityKey, EntityPersister, EntityRef, Error,
    IntegrityErrorKind, LockMode, LockOptions, MappingErrorKind, Outcome, PropertyKind,
    PropertyMapping, PropertyValue, Result, StructuredCacheEntry, Value,
};

use crate::Session;
use crate::assembler::resolve_reference;
use crate::exec;
use crate::loader::{LoadRequest, LoadType};
use crate::persistence_context::EntityStatus;

/// What the session probe found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// Usable hit, or no entity at all when the entry carries none.
    Managed,
    /// Found but deleted in this session.
    RemovedEntityMarker,
    /// Found, but not an instance of the requested entity.
    InconsistentReturnClass,
}

#[derive(Debug, Clone)]
pub struct PersistenceContextEntry {
    pub entity: Option<EntityRef>,
    pub status: LookupStatus,
}

impl PersistenceContextEntry {
    fn managed(entity: Option<EntityRef>) -> Self {
        Self {
            entity,
            status: LookupStatus::Managed,
        }
    }

    /// The entity when the probe produced a usable hit.
    pub fn managed_entity(&self) -> Option<&EntityRef> {
        match self.status {
            LookupStatus::Managed => self.entity.as_ref(),
            _ => None,
        }
    }
}

/// Probe the persistence context for `key`.
///
/// A deleted hit becomes a removed marker when `load_type` checks deletion;
/// a hit of another class becomes an inconsistency marker when it allows
/// nulls. Otherwise the hit's lock is upgraded to the requested mode.
#[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
pub async fn load_from_session_cache<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    persister: &EntityPersister,
    key: &EntityKey,
    lock_options: LockOptions,
    load_type: LoadType,
) -> Outcome<PersistenceContextEntry, Error> {
    let Some(existing) = session.context.get_entity(key).cloned() else {
        return Outcome::Ok(PersistenceContextEntry::managed(None));
    };
    let Some(status) = session.context.entry(key).map(|e| e.status) else {
        return Outcome::Ok(PersistenceContextEntry::managed(None));
    };

    if load_type.check_deleted() && status.is_deleted_or_gone() {
        tracing::debug!(%key, "entity was deleted in this session");
        return Outcome::Ok(PersistenceContextEntry {
            entity: Some(existing),
            status: LookupStatus::RemovedEntityMarker,
        });
    }
    if load_type.allow_nulls() && !persister.is_instance(&existing.entity_name()) {
        return Outcome::Ok(PersistenceContextEntry {
            entity: Some(existing),
            status: LookupStatus::InconsistentReturnClass,
        });
    }

    try_outcome!(upgrade_lock(cx, session, key, &existing, lock_options).await);
    Outcome::Ok(PersistenceContextEntry::managed(Some(existing)))
}

/// Raise the recorded lock of a registered entity to `lock_options`.
///
/// Never downgrades. Pessimistic modes run the dialect's lock statement,
/// checking the version of versioned entities.
pub(crate) async fn upgrade_lock<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    key: &EntityKey,
    entity: &EntityRef,
    lock_options: LockOptions,
) -> Outcome<(), Error> {
    let requested = lock_options.lock_mode;
    let Some(entry) = session.context.entry(key).cloned() else {
        return Outcome::Ok(());
    };
    if !requested.greater_than(entry.lock_mode) {
        return Outcome::Ok(());
    }
    if !entry.status.is_managed() {
        return Outcome::Err(Error::integrity(
            IntegrityErrorKind::ObjectDeleted,
            entry.entity_name,
            Some(key.identifier().to_string()),
            "attempted to lock a deleted instance",
        ));
    }

    if requested.is_pessimistic() {
        let factory = Arc::clone(&session.factory);
        let persister = try_result!(factory.metamodel().persister(&entry.entity_name));
        let dialect = session.connection.dialect();
        let sql = exec::lock_sql(persister, dialect, &lock_options);
        let mut params = entity.identifier().values().to_vec();
        if persister.is_versioned() {
            params.push(entry.version.clone().unwrap_or(Value::Null));
        }
        tracing::debug!(%key, lock = %requested, "upgrading lock");
        let descriptor = format!("could not lock: {key}");
        let rows = try_outcome!(exec::translated(
            exec::query(cx, &session.connection, factory.statistics(), &sql, &params).await,
            dialect,
            &sql,
            &descriptor,
        ));
        if rows.is_empty() {
            factory.statistics().optimistic_failure();
            tracing::warn!(%key, "row was updated or deleted by another transaction");
            return Outcome::Err(Error::integrity(
                IntegrityErrorKind::StaleObjectState,
                entry.entity_name,
                Some(key.identifier().to_string()),
                "row was updated or deleted by another transaction",
            ));
        }
    }

    if let Some(entry) = session.context.entry_mut(key) {
        entry.lock_mode = requested;
    }
    Outcome::Ok(())
}

/// Probe the second-level cache for `key`.
///
/// Only runs when the entity is cached, the session's cache mode reads and
/// the requested lock is weaker than READ. Hits are registered in the
/// persistence context before they are returned.
#[tracing::instrument(level = "trace", skip_all, fields(key = %key))]
pub fn load_from_second_level_cache<C: Connection>(
    session: &mut Session<C>,
    persister: &EntityPersister,
    key: &EntityKey,
    request: &LoadRequest,
) -> Result<Option<EntityRef>> {
    let factory = Arc::clone(&session.factory);
    let Some(access) = factory.cache_access(persister) else {
        return Ok(None);
    };
    if !persister.can_read_from_cache()
        || !session.config.cache_mode.is_get_enabled()
        || !request.lock_options.lock_mode.less_than(LockMode::Read)
    {
        return Ok(None);
    }

    let cache_key =
        access.generate_cache_key(key.identifier(), persister, session.config.tenant.as_deref());
    let Some(entry) = access.get(&cache_key)? else {
        factory.statistics().second_level_cache_miss(access.region_name());
        tracing::debug!(%key, region = access.region_name(), "second-level cache miss");
        return Ok(None);
    };
    factory.statistics().second_level_cache_hit(access.region_name());
    tracing::debug!(%key, region = access.region_name(), "second-level cache hit");

    match entry {
        CacheEntry::Reference(reference) => {
            if request.instance_to_load.is_some() {
                return Err(Error::integrity(
                    IntegrityErrorKind::ReferenceEntryWithInstance,
                    persister.entity_name(),
                    Some(key.identifier().to_string()),
                    "attempted to load from a reference cache entry into a supplied instance",
                ));
            }
            session.context.add_entity(
                key.clone(),
                reference.clone(),
                EntityStatus::ReadOnly,
                LockMode::None,
                None,
            );
            session.context.batch_fetch_queue_mut().remove_batch_loadable_entity_key(key);
            Ok(Some(reference))
        }
        CacheEntry::Structured(structured) => {
            let entity = assemble_cached(session, persister, key, request, structured)?;
            Ok(Some(entity))
        }
    }
}

fn assemble_cached<C: Connection>(
    session: &mut Session<C>,
    persister: &EntityPersister,
    key: &EntityKey,
    request: &LoadRequest,
    entry: StructuredCacheEntry,
) -> Result<EntityRef> {
    let factory = Arc::clone(&session.factory);
    let subclass = factory.metamodel().persister(&entry.subclass)?;
    let instance = request
        .instance_to_load
        .clone()
        .or_else(|| session.context.get_proxy(key).cloned())
        .unwrap_or_else(|| EntityRef::proxy(subclass.entity_name(), key.identifier().clone()));

    session.context.add_entity(
        key.clone(),
        instance.clone(),
        EntityStatus::Loading,
        LockMode::None,
        entry.version.clone(),
    );

    let mut values = Vec::with_capacity(entry.state.len());
    for (mapping, cached) in subclass.properties().iter().zip(entry.state) {
        let value = match assemble_value(session, mapping, cached) {
            Ok(value) => value,
            Err(e) => {
                session.context.remove(key);
                return Err(e);
            }
        };
        values.push(value);
    }
    instance.write().hydrate(subclass.entity_name(), values);

    let read_only = request.read_only.unwrap_or(session.config.default_read_only)
        || !subclass.is_mutable();
    let status = if read_only {
        EntityStatus::ReadOnly
    } else {
        EntityStatus::Managed
    };
    session.context.add_entity(
        key.clone(),
        instance.clone(),
        status,
        LockMode::None,
        entry.version,
    );
    session.context.batch_fetch_queue_mut().remove_batch_loadable_entity_key(key);

    if !persister.is_instance(subclass.entity_name()) {
        tracing::warn!(%key, found = subclass.entity_name(), "cached entity has the wrong class");
        return Err(Error::integrity(
            IntegrityErrorKind::WrongClass,
            persister.entity_name(),
            Some(key.identifier().to_string()),
            format!("loaded object was of wrong class {}", subclass.entity_name()),
        ));
    }
    Ok(instance)
}

fn assemble_value<C: Connection>(
    session: &mut Session<C>,
    mapping: &PropertyMapping,
    cached: CachedValue,
) -> Result<PropertyValue> {
    Ok(match (cached, &mapping.kind) {
        (CachedValue::Basic(value), _) => PropertyValue::Basic(value),
        (CachedValue::ToOne(None), _) => PropertyValue::ToOne(None),
        (CachedValue::ToOne(Some(id)), PropertyKind::ToOne(to_one)) => {
            let target = resolve_reference(
                &session.factory,
                &mut session.context,
                &to_one.target_entity,
                id,
            )?;
            PropertyValue::ToOne(Some(target))
        }
        (CachedValue::Component(values), PropertyKind::Component(nested)) => {
            let mut assembled = Vec::with_capacity(values.len());
            for (mapping, value) in nested.iter().zip(values) {
                assembled.push(assemble_value(session, mapping, value)?);
            }
            PropertyValue::Component(assembled)
        }
        (CachedValue::Collection, _) => PropertyValue::Collection(Default::default()),
        (cached, _) => {
            return Err(Error::mapping(
                MappingErrorKind::UnknownProperty,
                None,
                format!(
                    "cached value {cached:?} does not fit property '{}'",
                    mapping.name
                ),
            ));
        }
    })
}
