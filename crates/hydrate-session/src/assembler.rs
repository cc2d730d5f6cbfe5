//! Result-set assembly.
//!
//! Rows are consumed in two phases. While reading, every entity in a row is
//! either found in the persistence context (class-checked and lock-upgraded)
//! or registered as loading with its raw column values. Once all rows are
//! read, each loading entity is initialized: references resolve to joined,
//! managed or proxied instances, and the entity becomes managed.

use std::sync::Arc;

use hydrate_core::{
    CacheEntry, CollectionValue, Entity, EntityKey, EntityPersister, EntityRef, Error, Identifier,
    IdentifierType, IntegrityErrorKind, LockMode, PropertyKind, PropertyMapping, PropertyValue,
    Result, Row, StructuredCacheEntry, Value,
};
use hydrate_query::{ColumnAliases, EntityAliases, LoadTemplate, OwnerSlot, column_alias};
use indexmap::IndexMap;

use crate::SessionConfig;
use crate::entity_loader::QueryParameters;
use crate::factory::SessionFactory;
use crate::persistence_context::{
    DeferredRestriction, EntityStatus, PendingLoad, PersistenceContext,
};

/// A property value as read from the row, before references resolve.
#[derive(Debug, Clone)]
enum RawValue {
    Basic(Value),
    /// Foreign key read from the owner's columns.
    ToOneKey {
        target: String,
        id: Option<Identifier>,
    },
    /// Target joined in the same row.
    ToOneJoined(Option<EntityRef>),
    /// Key held by the target's table; resolved after the load.
    Deferred {
        target: String,
        restriction: DeferredRestriction,
    },
    Collection,
    Component(Vec<RawValue>),
}

struct Hydrating {
    key: EntityKey,
    instance: EntityRef,
    persister: Arc<EntityPersister>,
    raw: Vec<RawValue>,
    version: Option<Value>,
    lock_mode: LockMode,
}

#[derive(Default)]
struct AssemblyState {
    hydrating: IndexMap<EntityKey, Hydrating>,
    /// Every key registered as loading by this assembly.
    loading: Vec<EntityKey>,
    /// Fetched collections per owner key and collection index.
    collections: IndexMap<(EntityKey, usize), (EntityRef, CollectionValue)>,
}

/// One assembly of a result set into the persistence context.
pub(crate) struct Assembly<'a> {
    pub factory: &'a SessionFactory,
    pub context: &'a mut PersistenceContext,
    pub config: &'a SessionConfig,
    pub template: &'a LoadTemplate,
    pub parameters: &'a QueryParameters,
}

impl Assembly<'_> {
    /// Assemble `rows`, returning the root entity of every row.
    ///
    /// Entities still loading when an error occurs are unregistered.
    pub(crate) fn assemble(mut self, rows: &[Row]) -> Result<Vec<EntityRef>> {
        let mut state = AssemblyState::default();
        let result = self.assemble_rows(rows, &mut state);
        if result.is_err() {
            for key in &state.loading {
                if self
                    .context
                    .entry(key)
                    .is_some_and(|e| e.status == EntityStatus::Loading)
                {
                    self.context.remove(key);
                }
            }
        }
        result
    }

    fn assemble_rows(&mut self, rows: &[Row], state: &mut AssemblyState) -> Result<Vec<EntityRef>> {
        let factory = self.factory;
        let metamodel = factory.metamodel();
        let persisters = self
            .template
            .entities()
            .iter()
            .map(|e| metamodel.persister(&e.entity_name).cloned())
            .collect::<Result<Vec<_>>>()?;
        let optional_key = match (&self.parameters.optional_object, &self.parameters.optional_id) {
            (Some(_), Some(id)) => Some(persisters[0].entity_key(id.clone())),
            _ => None,
        };

        let mut roots = Vec::with_capacity(rows.len());
        for (row_index, row) in rows.iter().enumerate() {
            let mut resolved: Vec<Option<(EntityKey, EntityRef)>> =
                Vec::with_capacity(persisters.len());
            for (aliases, persister) in self.template.entities().iter().zip(&persisters) {
                let identifier = read_identifier(row, &aliases.identifier)?;
                if identifier.is_null() {
                    resolved.push(None);
                    continue;
                }
                let key = persister.entity_key(identifier);
                let instance = if let Some(loading) = state.hydrating.get(&key) {
                    loading.instance.clone()
                } else if let Some(existing) = self.context.get_entity(&key).cloned() {
                    self.instance_already_loaded(row, aliases, persister, &key, &existing)?;
                    existing
                } else {
                    let target = InstanceTarget {
                        key: key.clone(),
                        optional: optional_key.as_ref() == Some(&key),
                    };
                    self.instance_not_yet_loaded(row, aliases, persister, target, state)?
                };
                resolved.push(Some((key, instance)));
            }

            link_owners(self.template, &resolved, state);
            collect_collections(self.template, &resolved, state);
            tracing::trace!(
                row = row_index,
                entities = resolved.iter().flatten().count(),
                "assembled row"
            );
            if let Some(Some((_, root))) = resolved.first() {
                roots.push(root.clone());
            }
        }

        for (_, loading) in std::mem::take(&mut state.hydrating) {
            self.initialize(loading)?;
        }
        for ((_, fetch), (owner, collection)) in &state.collections {
            let path = &self.template.collections()[*fetch].property;
            let mut owner = owner.write();
            let uninitialized = property_at(&owner, path)
                .and_then(PropertyValue::as_collection)
                .is_some_and(|c| !c.is_initialized());
            if uninitialized {
                set_property_at(&mut owner, path, PropertyValue::Collection(collection.clone()));
            }
        }
        Ok(roots)
    }

    /// Class check and lock upgrade for an entity already in the session.
    fn instance_already_loaded(
        &mut self,
        row: &Row,
        aliases: &EntityAliases,
        persister: &EntityPersister,
        key: &EntityKey,
        existing: &EntityRef,
    ) -> Result<()> {
        let found = existing.entity_name();
        if !persister.is_instance(&found) {
            tracing::warn!(%key, %found, "session holds an instance of another class");
            return Err(Error::integrity(
                IntegrityErrorKind::WrongClass,
                persister.entity_name(),
                Some(key.identifier().to_string()),
                format!("loaded object was of wrong class {found}"),
            ));
        }

        let requested = aliases.lock_mode;
        if requested == LockMode::None {
            return Ok(());
        }
        let Some(entry) = self.context.entry(key).cloned() else {
            return Ok(());
        };
        if !entry.lock_mode.less_than(requested) {
            return Ok(());
        }
        if persister.is_versioned() {
            let current = persister
                .version_index()
                .and_then(|i| aliases.properties.get(i))
                .and_then(|a| match a {
                    ColumnAliases::Columns(columns) => columns.first(),
                    _ => None,
                })
                .map(|alias| row.require(alias))
                .transpose()?;
            if let (Some(current), Some(known)) = (current, &entry.version) {
                if !current.key_eq(known) {
                    self.factory.statistics().optimistic_failure();
                    tracing::warn!(%key, %known, %current, "version changed while upgrading lock");
                    return Err(Error::integrity(
                        IntegrityErrorKind::StaleObjectState,
                        persister.entity_name(),
                        Some(key.identifier().to_string()),
                        "row was updated or deleted by another transaction",
                    ));
                }
            }
        }
        if let Some(entry) = self.context.entry_mut(key) {
            entry.lock_mode = requested;
        }
        Ok(())
    }

    /// Pick or create the instance for a new key and register it as loading.
    fn instance_not_yet_loaded(
        &mut self,
        row: &Row,
        aliases: &EntityAliases,
        persister: &Arc<EntityPersister>,
        target: InstanceTarget,
        state: &mut AssemblyState,
    ) -> Result<EntityRef> {
        let InstanceTarget { key, optional } = target;
        let concrete = self.concrete_persister(row, aliases, persister, &key)?;
        let lock_mode = match aliases.lock_mode {
            LockMode::None => LockMode::Read,
            mode => mode,
        };

        if let Some(reference) = self.cached_reference(&concrete, &key)? {
            if optional && self.parameters.optional_object.is_some() {
                return Err(Error::integrity(
                    IntegrityErrorKind::ReferenceEntryWithInstance,
                    concrete.entity_name(),
                    Some(key.identifier().to_string()),
                    "attempted to load from a reference cache entry into a supplied instance",
                ));
            }
            self.context.add_entity(
                key.clone(),
                reference.clone(),
                EntityStatus::ReadOnly,
                lock_mode,
                None,
            );
            self.context
                .batch_fetch_queue_mut()
                .remove_batch_loadable_entity_key(&key);
            return Ok(reference);
        }

        let instance = match (&self.parameters.optional_object, optional) {
            (Some(object), true) => object.clone(),
            _ => match self.context.get_proxy(&key) {
                Some(proxy) => proxy.clone(),
                None => EntityRef::proxy(concrete.entity_name(), key.identifier().clone()),
            },
        };

        let raw = read_values(row, aliases, &concrete, key.identifier())?;
        let version = concrete.version_index().and_then(|i| match raw.get(i) {
            Some(RawValue::Basic(v)) => Some(v.clone()),
            _ => None,
        });
        self.context.add_entity(
            key.clone(),
            instance.clone(),
            EntityStatus::Loading,
            lock_mode,
            version.clone(),
        );
        tracing::trace!(%key, entity = concrete.entity_name(), "hydrating");
        state.loading.push(key.clone());
        state.hydrating.insert(
            key.clone(),
            Hydrating {
                key,
                instance: instance.clone(),
                persister: concrete,
                raw,
                version,
                lock_mode,
            },
        );
        Ok(instance)
    }

    /// Persister for the row's discriminator value, or `persister` itself.
    fn concrete_persister(
        &self,
        row: &Row,
        aliases: &EntityAliases,
        persister: &Arc<EntityPersister>,
        key: &EntityKey,
    ) -> Result<Arc<EntityPersister>> {
        let Some(alias) = &aliases.discriminator else {
            return Ok(Arc::clone(persister));
        };
        let value = row.require(alias)?;
        self.factory
            .metamodel()
            .subclass_for_discriminator(persister, value)
            .ok_or_else(|| {
                Error::integrity(
                    IntegrityErrorKind::WrongClass,
                    persister.entity_name(),
                    Some(key.identifier().to_string()),
                    format!("discriminator value {value} does not map to a subclass"),
                )
            })
    }

    /// A reference entry for `key`, when the entity allows reusing them.
    fn cached_reference(
        &self,
        persister: &EntityPersister,
        key: &EntityKey,
    ) -> Result<Option<EntityRef>> {
        if !self.config.cache_mode.is_get_enabled() || !persister.can_use_reference_cache_entries()
        {
            return Ok(None);
        }
        let Some(access) = self.factory.cache_access(persister) else {
            return Ok(None);
        };
        let cache_key =
            access.generate_cache_key(key.identifier(), persister, self.config.tenant.as_deref());
        match access.get(&cache_key)? {
            Some(CacheEntry::Reference(reference)) => {
                self.factory
                    .statistics()
                    .second_level_cache_hit(access.region_name());
                Ok(Some(reference))
            }
            _ => Ok(None),
        }
    }

    /// Resolve references, hydrate the instance and mark it managed.
    fn initialize(&mut self, loading: Hydrating) -> Result<()> {
        let Hydrating {
            key,
            instance,
            persister,
            raw,
            version,
            lock_mode,
        } = loading;

        let mut values = Vec::with_capacity(raw.len());
        for (index, value) in raw.into_iter().enumerate() {
            values.push(self.resolve_value(value, vec![index], &instance)?);
        }
        instance.write().hydrate(persister.entity_name(), values);
        self.resolve_key_references(&persister, &instance)?;

        let read_only = self
            .parameters
            .read_only
            .unwrap_or(self.config.default_read_only)
            || !persister.is_mutable();
        let status = if read_only {
            EntityStatus::ReadOnly
        } else {
            EntityStatus::Managed
        };
        self.context
            .add_entity(key.clone(), instance.clone(), status, lock_mode, version);
        self.context
            .batch_fetch_queue_mut()
            .remove_batch_loadable_entity_key(&key);
        self.put_in_cache(&persister, &key, &instance)?;
        self.factory.statistics().entity_loaded();
        tracing::trace!(%key, ?status, "initialized");
        Ok(())
    }

    fn resolve_value(
        &mut self,
        raw: RawValue,
        path: Vec<usize>,
        owner: &EntityRef,
    ) -> Result<PropertyValue> {
        Ok(match raw {
            RawValue::Basic(value) => PropertyValue::Basic(value),
            RawValue::ToOneKey { id: None, .. } => PropertyValue::ToOne(None),
            RawValue::ToOneKey {
                target,
                id: Some(id),
            } => PropertyValue::ToOne(Some(resolve_reference(
                self.factory,
                self.context,
                &target,
                id,
            )?)),
            RawValue::ToOneJoined(target) => PropertyValue::ToOne(target),
            RawValue::Deferred {
                target,
                restriction,
            } => {
                self.context.push_pending(PendingLoad::Property {
                    owner: owner.clone(),
                    path,
                    entity_name: target,
                    restriction,
                });
                PropertyValue::ToOne(None)
            }
            RawValue::Collection => PropertyValue::Collection(CollectionValue::Uninitialized),
            RawValue::Component(nested) => {
                let mut values = Vec::with_capacity(nested.len());
                for (index, value) in nested.into_iter().enumerate() {
                    let mut nested_path = path.clone();
                    nested_path.push(index);
                    values.push(self.resolve_value(value, nested_path, owner)?);
                }
                PropertyValue::Component(values)
            }
        })
    }

    /// Resolve key-many-to-one components the row did not join.
    fn resolve_key_references(
        &mut self,
        persister: &EntityPersister,
        instance: &EntityRef,
    ) -> Result<()> {
        let IdentifierType::Composite { components, .. } = persister.identifier_type() else {
            return Ok(());
        };
        let values = instance.identifier().values();
        let mut offset = 0;
        for (index, component) in components.iter().enumerate() {
            let span = component.columns.len();
            let slice = values.get(offset..offset + span);
            offset += span;
            let (Some(target), Some(slice)) = (&component.key_many_to_one, slice) else {
                continue;
            };
            if instance.key_reference(index).is_some() {
                continue;
            }
            let id = Identifier::new(slice.to_vec());
            if id.is_null() {
                continue;
            }
            let reference = resolve_reference(self.factory, self.context, target, id)?;
            instance.write().set_key_reference(index, reference);
        }
        Ok(())
    }

    fn put_in_cache(
        &self,
        persister: &EntityPersister,
        key: &EntityKey,
        instance: &EntityRef,
    ) -> Result<()> {
        if !self.config.cache_mode.is_put_enabled() || !persister.can_write_to_cache() {
            return Ok(());
        }
        let Some(access) = self.factory.cache_access(persister) else {
            return Ok(());
        };
        let cache_key =
            access.generate_cache_key(key.identifier(), persister, self.config.tenant.as_deref());
        let entry = if persister.can_use_reference_cache_entries() {
            CacheEntry::Reference(instance.clone())
        } else {
            CacheEntry::Structured(StructuredCacheEntry::disassemble(&instance.read(), persister))
        };
        if access.put(cache_key, entry)? {
            self.factory
                .statistics()
                .second_level_cache_put(access.region_name());
            tracing::debug!(%key, region = access.region_name(), "cached entity");
        }
        Ok(())
    }
}

struct InstanceTarget {
    key: EntityKey,
    /// The key is the one the caller's instance stands for.
    optional: bool,
}

/// Point joined entities at their owners' slots.
fn link_owners(
    template: &LoadTemplate,
    resolved: &[Option<(EntityKey, EntityRef)>],
    state: &mut AssemblyState,
) {
    for (index, aliases) in template.entities().iter().enumerate() {
        let target = resolved[index].as_ref().map(|(_, r)| r.clone());
        if let Some(owner) = &aliases.owner {
            if let Some((owner_key, owner_ref)) = &resolved[owner.entity] {
                if let Some(loading) = state.hydrating.get_mut(owner_key) {
                    match &owner.slot {
                        OwnerSlot::Property(path) => {
                            set_raw_at(&mut loading.raw, path, RawValue::ToOneJoined(target.clone()));
                        }
                        OwnerSlot::KeyManyToOne(component) => {
                            if let Some(target) = &target {
                                owner_ref.write().set_key_reference(*component, target.clone());
                            }
                        }
                    }
                }
            }
        }
        let Some((key, instance)) = &resolved[index] else {
            continue;
        };
        if !state.hydrating.contains_key(key) {
            continue;
        }
        for link in &aliases.key_many_to_one_targets {
            if let Some(Some((_, target))) = resolved.get(link.entity) {
                instance.write().set_key_reference(link.component, target.clone());
            }
        }
    }
}

/// Add this row's collection elements to their owners.
fn collect_collections(
    template: &LoadTemplate,
    resolved: &[Option<(EntityKey, EntityRef)>],
    state: &mut AssemblyState,
) {
    for (index, fetch) in template.collections().iter().enumerate() {
        // Without the element table only the link rows are known.
        let Some(element) = fetch.element else {
            continue;
        };
        let Some((owner_key, owner)) = &resolved[fetch.owner] else {
            continue;
        };
        let (_, collection) = state
            .collections
            .entry((owner_key.clone(), index))
            .or_insert_with(|| (owner.clone(), CollectionValue::Initialized(Vec::new())));
        if let Some((_, element)) = &resolved[element] {
            collection.add_unique(element.clone());
        }
    }
}

/// The managed instance, registered proxy or a new proxy for `id`.
///
/// New proxies of batch-loadable entities are queued for batch fetching;
/// those of entities without proxy support are queued to load after the
/// current one.
pub(crate) fn resolve_reference(
    factory: &SessionFactory,
    context: &mut PersistenceContext,
    entity_name: &str,
    id: Identifier,
) -> Result<EntityRef> {
    let persister = factory.metamodel().persister(entity_name)?;
    let key = persister.entity_key(id);
    if let Some(entity) = context.get_entity(&key) {
        return Ok(entity.clone());
    }
    if let Some(proxy) = context.get_proxy(&key) {
        return Ok(proxy.clone());
    }
    let proxy = EntityRef::proxy(persister.entity_name(), key.identifier().clone());
    context.add_proxy(key.clone(), proxy.clone());
    if factory.settings().batch_size_for(persister) > 1 {
        context
            .batch_fetch_queue_mut()
            .add_batch_loadable_entity_key(persister.entity_name(), key.clone());
    }
    if !persister.has_proxy() {
        context.push_pending(PendingLoad::Entity {
            entity_name: persister.entity_name().to_string(),
            identifier: key.identifier().clone(),
        });
    }
    Ok(proxy)
}

fn read_identifier(row: &Row, aliases: &[String]) -> Result<Identifier> {
    let mut values = Vec::with_capacity(aliases.len());
    for alias in aliases {
        values.push(row.require(alias)?.clone());
    }
    Ok(Identifier::new(values))
}

/// Raw values of every property of `persister`.
///
/// A subclass may map properties the template did not select; those are
/// read by their conventional alias when the row has them.
fn read_values(
    row: &Row,
    aliases: &EntityAliases,
    persister: &EntityPersister,
    owner_id: &Identifier,
) -> Result<Vec<RawValue>> {
    let mut raw = Vec::with_capacity(persister.properties().len());
    for (index, mapping) in persister.properties().iter().enumerate() {
        let value = match aliases.properties.get(index) {
            Some(selected) => raw_value(row, mapping, selected, owner_id, true)?,
            None => {
                let derived = derived_aliases(mapping, &aliases.table_alias);
                raw_value(row, mapping, &derived, owner_id, false)?
            }
        };
        raw.push(value);
    }
    Ok(raw)
}

fn raw_value(
    row: &Row,
    mapping: &PropertyMapping,
    aliases: &ColumnAliases,
    owner_id: &Identifier,
    strict: bool,
) -> Result<RawValue> {
    let read = |alias: &String| -> Result<Value> {
        if strict {
            Ok(row.require(alias)?.clone())
        } else {
            Ok(row.get_by_name(alias).cloned().unwrap_or(Value::Null))
        }
    };
    Ok(match (&mapping.kind, aliases) {
        (PropertyKind::Basic, ColumnAliases::Columns(columns)) => match columns.first() {
            Some(alias) => RawValue::Basic(read(alias)?),
            None => RawValue::Basic(Value::Null),
        },
        (PropertyKind::Basic, _) => RawValue::Basic(Value::Null),
        (PropertyKind::ToOne(to_one), ColumnAliases::Columns(columns)) => {
            let mut values = Vec::with_capacity(columns.len());
            for alias in columns {
                values.push(read(alias)?);
            }
            let id = Identifier::new(values);
            RawValue::ToOneKey {
                target: to_one.target_entity.clone(),
                id: (!id.is_null()).then_some(id),
            }
        }
        (PropertyKind::ToOne(to_one), _) => RawValue::Deferred {
            target: to_one.target_entity.clone(),
            restriction: match &to_one.mapped_by {
                Some(property) => DeferredRestriction::UniqueKey {
                    property: property.clone(),
                    value: owner_id.clone(),
                },
                None => DeferredRestriction::Identifier(owner_id.clone()),
            },
        },
        (PropertyKind::Collection(_), _) => RawValue::Collection,
        (PropertyKind::Component(nested), ColumnAliases::Component(selected)) => {
            let mut values = Vec::with_capacity(nested.len());
            for (mapping, aliases) in nested.iter().zip(selected) {
                values.push(raw_value(row, mapping, aliases, owner_id, strict)?);
            }
            RawValue::Component(values)
        }
        (PropertyKind::Component(nested), _) => RawValue::Component(
            nested
                .iter()
                .map(|_| RawValue::Basic(Value::Null))
                .collect(),
        ),
    })
}

fn derived_aliases(mapping: &PropertyMapping, table_alias: &str) -> ColumnAliases {
    match &mapping.kind {
        PropertyKind::Component(nested) => ColumnAliases::Component(
            nested
                .iter()
                .map(|p| derived_aliases(p, table_alias))
                .collect(),
        ),
        PropertyKind::Collection(_) => ColumnAliases::None,
        _ if mapping.columns.is_empty() => ColumnAliases::None,
        _ => ColumnAliases::Columns(
            mapping
                .columns
                .iter()
                .map(|c| column_alias(table_alias, c))
                .collect(),
        ),
    }
}

fn set_raw_at(raw: &mut [RawValue], path: &[usize], value: RawValue) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    match (raw.get_mut(*first), rest.is_empty()) {
        (Some(slot), true) => *slot = value,
        (Some(RawValue::Component(nested)), false) => set_raw_at(nested, rest, value),
        _ => {}
    }
}

fn property_at<'e>(entity: &'e Entity, path: &[usize]) -> Option<&'e PropertyValue> {
    let (first, rest) = path.split_first()?;
    let mut value = entity.value(*first)?;
    for index in rest {
        match value {
            PropertyValue::Component(nested) => value = nested.get(*index)?,
            _ => return None,
        }
    }
    Some(value)
}

/// Store `value` at a property path, descending through components.
pub(crate) fn set_property_at(entity: &mut Entity, path: &[usize], value: PropertyValue) {
    let Some((first, rest)) = path.split_first() else {
        return;
    };
    let Some(mut slot) = entity.value_mut(*first) else {
        return;
    };
    for index in rest {
        match slot {
            PropertyValue::Component(nested) => match nested.get_mut(*index) {
                Some(next) => slot = next,
                None => return,
            },
            _ => return,
        }
    }
    *slot = value;
}
