//! Registry of entity persisters and fetch profiles.
//!
//! The metamodel is built once, validated eagerly and then shared read-only
//! (behind `Arc`) by the session factory and every session.

use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use regex::Regex;

use crate::error::{Error, MappingErrorKind, Result};
use crate::fetch::FetchProfile;
use crate::persister::{
    CollectionElement, EntityPersister, EntityPersisterBuilder, ForeignKeyDirection,
    PropertyKind, PropertyMapping,
};
use crate::value::Value;

/// Plain SQL identifier, optionally schema-qualified for table names.
fn column_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").ok())
        .as_ref()
}

fn table_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_$]*\.)?[A-Za-z_][A-Za-z0-9_$]*$").ok())
        .as_ref()
}

fn is_valid_column(name: &str) -> bool {
    column_pattern().is_some_and(|re| re.is_match(name))
}

fn is_valid_table(name: &str) -> bool {
    table_pattern().is_some_and(|re| re.is_match(name))
}

/// All persisters and fetch profiles known to a session factory.
#[derive(Debug, Default)]
pub struct Metamodel {
    persisters: IndexMap<String, Arc<EntityPersister>>,
    fetch_profiles: IndexMap<String, FetchProfile>,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    /// Look up a persister, failing with `UnknownEntity` when absent.
    pub fn persister(&self, entity_name: &str) -> Result<&Arc<EntityPersister>> {
        self.persisters.get(entity_name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                Some(entity_name),
                format!("unknown entity: {entity_name}"),
            )
        })
    }

    pub fn find_persister(&self, entity_name: &str) -> Option<&Arc<EntityPersister>> {
        self.persisters.get(entity_name)
    }

    pub fn persisters(&self) -> impl Iterator<Item = &Arc<EntityPersister>> {
        self.persisters.values()
    }

    pub fn fetch_profile(&self, name: &str) -> Option<&FetchProfile> {
        self.fetch_profiles.get(name)
    }

    pub fn fetch_profiles(&self) -> impl Iterator<Item = &FetchProfile> {
        self.fetch_profiles.values()
    }

    /// The persister of the hierarchy root `persister` belongs to.
    pub fn root_persister(&self, persister: &EntityPersister) -> Result<&Arc<EntityPersister>> {
        self.persister(persister.root_entity_name())
    }

    /// The concrete persister (this one or a subclass) whose discriminator
    /// value equals `value`.
    pub fn subclass_for_discriminator(
        &self,
        persister: &Arc<EntityPersister>,
        value: &Value,
    ) -> Option<Arc<EntityPersister>> {
        let candidates = std::iter::once(persister.entity_name())
            .chain(persister.subclasses().iter().map(String::as_str));
        for name in candidates {
            let Some(candidate) = self.persisters.get(name) else {
                continue;
            };
            if candidate
                .discriminator()
                .is_some_and(|d| d.value.key_eq(value))
            {
                return Some(Arc::clone(candidate));
            }
        }
        None
    }
}

/// Collects persisters and profiles, then validates them together.
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    entities: Vec<EntityPersisterBuilder>,
    fetch_profiles: Vec<FetchProfile>,
}

impl MetamodelBuilder {
    #[must_use]
    pub fn entity(mut self, persister: EntityPersisterBuilder) -> Self {
        self.entities.push(persister);
        self
    }

    #[must_use]
    pub fn fetch_profile(mut self, profile: FetchProfile) -> Self {
        self.fetch_profiles.push(profile);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// Fails on unknown targets, empty identifiers, malformed names,
    /// foreign keys whose span differs from the referenced identifier, and
    /// fetch profiles naming associations that do not exist.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.entities.len()))]
    pub fn build(self) -> Result<Metamodel> {
        let mut versions = Vec::with_capacity(self.entities.len());
        let mut persisters: IndexMap<String, EntityPersister> = IndexMap::new();
        for builder in self.entities {
            versions.push(builder.version_name().map(str::to_string));
            let persister = builder.build();
            if persisters.contains_key(persister.entity_name()) {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    Some(persister.entity_name()),
                    format!("entity {} registered twice", persister.entity_name()),
                ));
            }
            persisters.insert(persister.entity_name().to_string(), persister);
        }

        for (persister, version) in persisters.values().zip(&versions) {
            if let Some(version) = version {
                if persister.version_index().is_none() {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownProperty,
                        Some(persister.entity_name()),
                        format!("version property {version} is not mapped"),
                    ));
                }
            }
        }

        resolve_hierarchies(&mut persisters)?;

        for persister in persisters.values() {
            validate_persister(persister, &persisters)?;
        }

        let mut fetch_profiles = IndexMap::new();
        for profile in self.fetch_profiles {
            for fetch in profile.fetches() {
                let owner = persisters.get(&fetch.entity).ok_or_else(|| {
                    Error::mapping(
                        MappingErrorKind::FetchProfile,
                        Some(&fetch.entity),
                        format!(
                            "fetch profile {} refers to unknown entity {}",
                            profile.name(),
                            fetch.entity
                        ),
                    )
                })?;
                if !resolves_to_association(owner.properties(), &fetch.association) {
                    return Err(Error::mapping(
                        MappingErrorKind::FetchProfile,
                        Some(&fetch.entity),
                        format!(
                            "fetch profile {} refers to unknown association {}",
                            profile.name(),
                            fetch.role()
                        ),
                    ));
                }
            }
            fetch_profiles.insert(profile.name().to_string(), profile);
        }

        tracing::debug!(
            persisters = persisters.len(),
            fetch_profiles = fetch_profiles.len(),
            "metamodel built"
        );

        Ok(Metamodel {
            persisters: persisters
                .into_iter()
                .map(|(name, p)| (name, Arc::new(p)))
                .collect(),
            fetch_profiles,
        })
    }
}

/// Fill in root names and transitive subclass lists.
fn resolve_hierarchies(persisters: &mut IndexMap<String, EntityPersister>) -> Result<()> {
    let mut roots = Vec::with_capacity(persisters.len());
    let mut subclasses: IndexMap<String, Vec<String>> = IndexMap::new();

    for persister in persisters.values() {
        let mut current = persister;
        let mut hops = 0;
        while let Some(parent) = current.superclass() {
            current = persisters.get(parent).ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    Some(persister.entity_name()),
                    format!("unknown superclass {parent}"),
                )
            })?;
            subclasses
                .entry(current.entity_name().to_string())
                .or_default()
                .push(persister.entity_name().to_string());
            hops += 1;
            if hops > persisters.len() {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownEntity,
                    Some(persister.entity_name()),
                    "cyclic inheritance hierarchy",
                ));
            }
        }
        roots.push(current.entity_name().to_string());
    }

    for (persister, root) in persisters.values_mut().zip(roots) {
        persister.set_root_entity_name(root);
        if let Some(subs) = subclasses.swap_remove(persister.entity_name()) {
            persister.set_subclasses(subs);
        }
    }
    Ok(())
}

fn validate_persister(
    persister: &EntityPersister,
    all: &IndexMap<String, EntityPersister>,
) -> Result<()> {
    let entity = persister.entity_name();
    if !is_valid_table(persister.table()) {
        return Err(invalid_column(entity, persister.table()));
    }

    let id_columns = persister.identifier_columns();
    if id_columns.is_empty() {
        return Err(Error::mapping(
            MappingErrorKind::IdentifierShape,
            Some(entity),
            "identifier maps no columns",
        ));
    }
    for column in &id_columns {
        if !is_valid_column(column) {
            return Err(invalid_column(entity, column));
        }
    }
    for component in persister.identifier_type().key_many_to_ones() {
        let Some(target_name) = &component.key_many_to_one else {
            continue;
        };
        let target = target_of(entity, target_name, all)?;
        if component.columns.len() != target.identifier_span() {
            return Err(span_mismatch(entity, &component.name, target));
        }
    }

    if let Some(discriminator) = persister.discriminator() {
        if !is_valid_column(&discriminator.column) {
            return Err(invalid_column(entity, &discriminator.column));
        }
    }

    if persister.batch_size() == 0 {
        return Err(Error::mapping(
            MappingErrorKind::BatchSizes,
            Some(entity),
            "batch size must be at least 1",
        ));
    }

    let mut pending: Vec<&PropertyMapping> = persister.properties().iter().collect();
    while let Some(property) = pending.pop() {
        for column in &property.columns {
            if !is_valid_column(column) {
                return Err(invalid_column(entity, column));
            }
        }
        match &property.kind {
            PropertyKind::Basic => {
                if property.columns.is_empty() {
                    return Err(Error::mapping(
                        MappingErrorKind::InvalidColumn,
                        Some(entity),
                        format!("property {} maps no columns", property.name),
                    ));
                }
            }
            PropertyKind::ToOne(to_one) => {
                let target = target_of(entity, &to_one.target_entity, all)?;
                match (to_one.direction, &to_one.mapped_by) {
                    (ForeignKeyDirection::FromParent, _) => {
                        if property.columns.len() != target.identifier_span() {
                            return Err(span_mismatch(entity, &property.name, target));
                        }
                    }
                    (ForeignKeyDirection::ToParent, Some(mapped_by)) => {
                        let owning = target
                            .property_index(mapped_by)
                            .and_then(|i| target.property(i));
                        if owning.is_none_or(|p| p.columns.len() != id_columns.len()) {
                            return Err(Error::mapping(
                                MappingErrorKind::UnknownProperty,
                                Some(entity),
                                format!(
                                    "{}.{} is not a to-one keyed by {entity}",
                                    target.entity_name(),
                                    mapped_by
                                ),
                            ));
                        }
                    }
                    (ForeignKeyDirection::ToParent, None) => {
                        if target.identifier_span() != id_columns.len() {
                            return Err(span_mismatch(entity, &property.name, target));
                        }
                    }
                }
            }
            PropertyKind::Collection(collection) => {
                let target = target_of(entity, collection.element.target_entity(), all)?;
                let keys = collection.element.key_columns();
                if keys.len() != id_columns.len() {
                    return Err(span_mismatch(entity, &property.name, persister));
                }
                for column in keys {
                    if !is_valid_column(column) {
                        return Err(invalid_column(entity, column));
                    }
                }
                if let CollectionElement::ManyToMany {
                    link_table,
                    element_columns,
                    ..
                } = &collection.element
                {
                    if !is_valid_table(link_table) {
                        return Err(invalid_column(entity, link_table));
                    }
                    if element_columns.len() != target.identifier_span() {
                        return Err(span_mismatch(entity, &property.name, target));
                    }
                    for column in element_columns {
                        if !is_valid_column(column) {
                            return Err(invalid_column(entity, column));
                        }
                    }
                }
            }
            PropertyKind::Component(nested) => pending.extend(nested.iter()),
        }
    }
    Ok(())
}

fn target_of<'a>(
    entity: &str,
    target: &str,
    all: &'a IndexMap<String, EntityPersister>,
) -> Result<&'a EntityPersister> {
    all.get(target).ok_or_else(|| {
        Error::mapping(
            MappingErrorKind::UnknownEntity,
            Some(entity),
            format!("association of {entity} targets unknown entity {target}"),
        )
    })
}

fn invalid_column(entity: &str, column: &str) -> Error {
    Error::mapping(
        MappingErrorKind::InvalidColumn,
        Some(entity),
        format!("invalid SQL identifier {column:?}"),
    )
}

fn span_mismatch(entity: &str, property: &str, target: &EntityPersister) -> Error {
    Error::mapping(
        MappingErrorKind::ForeignKeySpan,
        Some(entity),
        format!(
            "foreign key of {entity}.{property} does not match the identifier of {}",
            target.entity_name()
        ),
    )
}

fn resolves_to_association(properties: &[PropertyMapping], path: &str) -> bool {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Some(property) = properties.iter().find(|p| p.name == head) else {
        return false;
    };
    match (&property.kind, rest) {
        (PropertyKind::Component(nested), Some(rest)) => resolves_to_association(nested, rest),
        (PropertyKind::ToOne(_) | PropertyKind::Collection(_), None) => true,
        _ => false,
    }
}
