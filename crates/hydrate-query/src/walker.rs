//! The join walker.
//!
//! Walks the association graph of an entity, decides per association whether
//! to fetch it with an INNER or LEFT OUTER join or to leave it to a separate
//! select, and renders the decisions into a [`LoadTemplate`].

use std::collections::{HashMap, HashSet};

use hydrate_core::{
    CascadeStyle, CollectionElement, CollectionMapping, Dialect, EntityPersister, Error,
    FetchMode, FetchStyle, ForeignKeyDirection, IdentifierType, LoadQueryInfluencers, LockMode, LockOptions,
    MappingErrorKind, Metamodel, PropertyKind, PropertyMapping, Result, ToOneMapping, Value,
};

use crate::alias::{PropertyPath, column_alias, generate_alias, qualify};
use crate::association::{Association, Joinable};
use crate::join::{JoinFragment, JoinType};
use crate::key_many_to_one::resolve_key_many_to_one_targets;
use crate::template::{
    BatchSize, CollectionFetch, ColumnAliases, DecisionReason, EntityAliases, EntityOwner,
    JoinDecision, LoadTemplate, OwnerSlot,
};

/// Limits on how far the walker joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JoinWalkerConfig {
    /// Associations at this depth or deeper are not joined; `None` is unlimited.
    pub max_fetch_depth: Option<usize>,
    /// Collections joined per statement.
    pub max_joined_collections: usize,
}

impl Default for JoinWalkerConfig {
    fn default() -> Self {
        Self {
            max_fetch_depth: None,
            max_joined_collections: 1,
        }
    }
}

/// The entity currently being walked and where it sits in the graph.
struct Site<'s> {
    owner: &'s EntityPersister,
    alias: &'s str,
    path: &'s PropertyPath,
    /// Path from `owner` to the current component, empty at entity level.
    relative: &'s str,
    depth: usize,
}

/// Inputs of one join-type decision.
struct Candidate<'c> {
    role: &'c str,
    fetch: FetchMode,
    cascade: CascadeStyle,
    is_collection: bool,
    target_has_proxy: bool,
    fk_table: &'c str,
    fk_columns: &'c [String],
    nullable: bool,
    depth: usize,
}

/// Builds load templates for one set of session influencers.
pub struct JoinWalker<'a> {
    metamodel: &'a Metamodel,
    dialect: Dialect,
    config: JoinWalkerConfig,
    influencers: &'a LoadQueryInfluencers,
    lock_options: LockOptions,
    associations: Vec<Association>,
    decisions: Vec<JoinDecision>,
    visited: HashSet<(String, Vec<String>)>,
    joined_collections: usize,
}

impl<'a> JoinWalker<'a> {
    pub fn new(
        metamodel: &'a Metamodel,
        dialect: Dialect,
        config: JoinWalkerConfig,
        influencers: &'a LoadQueryInfluencers,
    ) -> Self {
        Self {
            metamodel,
            dialect,
            config,
            influencers,
            lock_options: LockOptions::NONE,
            associations: Vec::new(),
            decisions: Vec::new(),
            visited: HashSet::new(),
            joined_collections: 0,
        }
    }

    /// Walk `persister` and render a load restricted on `restriction_columns`
    /// (its identifier or a unique property) for `batch_size` keys.
    ///
    /// Never touches the database.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(entity = %persister.entity_name(), batch = %batch_size, lock = %lock_options.lock_mode)
    )]
    pub fn build(
        mut self,
        persister: &EntityPersister,
        restriction_columns: &[String],
        batch_size: BatchSize,
        lock_options: LockOptions,
    ) -> Result<LoadTemplate> {
        if batch_size == BatchSize::Fixed(0) {
            return Err(Error::mapping(
                MappingErrorKind::BatchSizes,
                Some(persister.entity_name()),
                "batch size must be at least 1",
            ));
        }
        validate_restriction(persister, restriction_columns)?;
        self.lock_options = lock_options;

        let root_alias = generate_alias(persister.entity_name(), 0);
        self.walk_entity(persister, &root_alias, &PropertyPath::root(), 0)?;

        let mut select = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut entities = vec![entity_aliases(
            persister,
            &root_alias,
            None,
            lock_options.lock_mode,
            &mut select,
        )];
        positions.insert(root_alias.clone(), 0);

        let metamodel = self.metamodel;
        let mut collections: Vec<CollectionFetch> = Vec::new();
        let mut links: HashMap<String, usize> = HashMap::new();
        let mut orderings: Vec<(usize, String)> = Vec::new();
        for association in &self.associations {
            let owner = positions.get(&association.lhs_alias).copied();
            match &association.joinable {
                Joinable::Entity { entity_name, .. } => {
                    let target = metamodel.persister(entity_name)?;
                    let owner = owner.map(|entity| EntityOwner {
                        entity,
                        slot: association.slot.clone(),
                    });
                    positions.insert(association.rhs_alias.clone(), entities.len());
                    entities.push(entity_aliases(
                        target,
                        &association.rhs_alias,
                        owner,
                        lock_options.lock_mode,
                        &mut select,
                    ));
                }
                Joinable::Collection(collection) => {
                    let (Some(owner), OwnerSlot::Property(property)) = (owner, &association.slot)
                    else {
                        continue;
                    };
                    let mut fetch = CollectionFetch {
                        role: collection.role.clone(),
                        owner,
                        property: property.clone(),
                        element: None,
                    };
                    match &collection.element {
                        CollectionElement::OneToMany { target_entity, .. } => {
                            let target = metamodel.persister(target_entity)?;
                            let element = entities.len();
                            positions.insert(association.rhs_alias.clone(), element);
                            entities.push(entity_aliases(
                                target,
                                &association.rhs_alias,
                                None,
                                lock_options.lock_mode,
                                &mut select,
                            ));
                            fetch.element = Some(element);
                            if let Some(order_by) = &collection.order_by {
                                orderings.push((element, order_by.clone()));
                            }
                        }
                        CollectionElement::ManyToMany { .. } => {
                            links.insert(association.rhs_alias.clone(), collections.len());
                        }
                    }
                    collections.push(fetch);
                }
                Joinable::ManyToManyElement { entity_name } => {
                    let target = metamodel.persister(entity_name)?;
                    let element = entities.len();
                    positions.insert(association.rhs_alias.clone(), element);
                    entities.push(entity_aliases(
                        target,
                        &association.rhs_alias,
                        None,
                        lock_options.lock_mode,
                        &mut select,
                    ));
                    if let Some(&index) = links.get(&association.lhs_alias) {
                        collections[index].element = Some(element);
                        if let Some(order_by) = self.link_ordering(&association.lhs_alias) {
                            orderings.push((element, order_by));
                        }
                    }
                }
            }
        }

        for (entity, targets) in resolve_key_many_to_one_targets(
            metamodel,
            persister,
            &root_alias,
            &self.associations,
            &positions,
        )? {
            entities[entity].key_many_to_one_targets = targets;
        }

        let mut joins = JoinFragment::new();
        for association in &self.associations {
            joins.add(association.to_join());
        }

        let head = format!(
            "select {} from {} {root_alias}{} where ",
            select.join(", "),
            persister.table(),
            joins.to_sql()
        );

        let mut tail = String::new();
        if let Some(filter) = self.filter_condition(persister, &root_alias) {
            tail.push_str(&format!(" and {filter}"));
        }
        if let Some(restriction) = discriminator_restriction(metamodel, persister, &root_alias) {
            tail.push_str(&format!(" and {restriction}"));
        }
        let order_by: Vec<String> = orderings
            .iter()
            .flat_map(|(element, ordering)| {
                let alias = &entities[*element].table_alias;
                ordering
                    .split(',')
                    .map(|term| qualify(alias, term.trim()))
                    .collect::<Vec<_>>()
            })
            .collect();
        if !order_by.is_empty() {
            tail.push_str(&format!(" order by {}", order_by.join(", ")));
        }
        if let Some(lock) = self.dialect.for_update_clause(&lock_options) {
            tail.push_str(&lock);
        }

        let template = LoadTemplate {
            entity_name: persister.entity_name().to_string(),
            dialect: self.dialect,
            batch_size,
            restriction_alias: root_alias,
            restriction_columns: restriction_columns.to_vec(),
            head,
            tail,
            sql: String::new(),
            entities,
            collections,
            decisions: self.decisions,
            lock_options,
        }
        .finish();

        tracing::debug!(
            joined = self.associations.len(),
            sql = %template.sql(),
            "built load template"
        );
        Ok(template)
    }

    fn walk_entity(
        &mut self,
        persister: &EntityPersister,
        alias: &str,
        path: &PropertyPath,
        depth: usize,
    ) -> Result<()> {
        let site = Site {
            owner: persister,
            alias,
            path,
            relative: "",
            depth,
        };
        for (index, property) in persister.properties().iter().enumerate() {
            self.walk_property(&site, property, vec![index])?;
        }

        // Non-aggregated composite identifiers expose their key-many-to-ones
        // as ordinary associations.
        if let IdentifierType::Composite {
            embedded: true,
            components,
        } = persister.identifier_type()
        {
            for (index, component) in components.iter().enumerate() {
                let Some(target) = &component.key_many_to_one else {
                    continue;
                };
                let columns: Vec<&str> = component.columns.iter().map(String::as_str).collect();
                let property =
                    PropertyMapping::many_to_one(&component.name, target, &columns).nullable(false);
                if let PropertyKind::ToOne(to_one) = &property.kind {
                    self.walk_to_one(&site, &property, to_one, OwnerSlot::KeyManyToOne(index))?;
                }
            }
        }
        Ok(())
    }

    fn walk_property(
        &mut self,
        site: &Site<'_>,
        property: &PropertyMapping,
        index_path: Vec<usize>,
    ) -> Result<()> {
        match &property.kind {
            PropertyKind::Basic => Ok(()),
            PropertyKind::Component(nested) => {
                let path = site.path.append(&property.name);
                let relative = join_relative(site.relative, &property.name);
                let component_site = Site {
                    owner: site.owner,
                    alias: site.alias,
                    path: &path,
                    relative: &relative,
                    depth: site.depth,
                };
                for (index, nested_property) in nested.iter().enumerate() {
                    let mut child = index_path.clone();
                    child.push(index);
                    self.walk_property(&component_site, nested_property, child)?;
                }
                Ok(())
            }
            PropertyKind::ToOne(to_one) => {
                self.walk_to_one(site, property, to_one, OwnerSlot::Property(index_path))
            }
            PropertyKind::Collection(collection) => {
                self.walk_collection(site, property, collection, index_path)
            }
        }
    }

    fn walk_to_one(
        &mut self,
        site: &Site<'_>,
        property: &PropertyMapping,
        to_one: &ToOneMapping,
        slot: OwnerSlot,
    ) -> Result<()> {
        let metamodel = self.metamodel;
        let target = metamodel.persister(&to_one.target_entity)?;
        let target_id = owned_columns(&target.identifier_columns());
        let owner_id = owned_columns(&site.owner.identifier_columns());

        let (lhs_columns, rhs_columns) = match (to_one.direction, &to_one.mapped_by) {
            (ForeignKeyDirection::FromParent, _) => (property.columns.clone(), target_id),
            (ForeignKeyDirection::ToParent, None) => (owner_id, target_id),
            (ForeignKeyDirection::ToParent, Some(mapped_by)) => {
                let owning = target
                    .property_index(mapped_by)
                    .and_then(|i| target.property(i))
                    .ok_or_else(|| {
                        Error::mapping(
                            MappingErrorKind::UnknownProperty,
                            Some(target.entity_name()),
                            format!("unknown property {mapped_by}"),
                        )
                    })?;
                (owner_id, owning.columns.clone())
            }
        };
        let (fk_table, fk_columns) = match to_one.direction {
            ForeignKeyDirection::FromParent => (site.owner.table(), &lhs_columns),
            ForeignKeyDirection::ToParent => (target.table(), &rhs_columns),
        };

        let path = site.path.append(&property.name);
        let role = format!(
            "{}.{}",
            site.owner.entity_name(),
            join_relative(site.relative, &property.name)
        );
        let (join_type, reason) = self.decide(&Candidate {
            role: &role,
            fetch: property.fetch,
            cascade: property.cascade,
            is_collection: false,
            target_has_proxy: target.has_proxy(),
            fk_table,
            fk_columns,
            nullable: property.nullable,
            depth: site.depth,
        });
        self.record(&path, role, site.depth, join_type, reason);
        if !join_type.is_joined() {
            return Ok(());
        }

        // Alias numbering counts only joined associations, before this one is added.
        let rhs_alias = generate_alias(target.entity_name(), self.associations.len() + 1);
        let filter = self.filter_condition(target, &rhs_alias);
        self.associations.push(Association {
            path: path.clone(),
            lhs_alias: site.alias.to_string(),
            lhs_columns,
            rhs_table: target.table().to_string(),
            rhs_alias: rhs_alias.clone(),
            rhs_columns,
            join_type,
            depth: site.depth,
            joinable: Joinable::Entity {
                entity_name: target.entity_name().to_string(),
                to_one: to_one.clone(),
            },
            slot,
            filter,
        });
        self.walk_entity(target, &rhs_alias, &path, site.depth + 1)
    }

    fn walk_collection(
        &mut self,
        site: &Site<'_>,
        property: &PropertyMapping,
        collection: &CollectionMapping,
        index_path: Vec<usize>,
    ) -> Result<()> {
        let metamodel = self.metamodel;
        let target = metamodel.persister(collection.element.target_entity())?;
        let owner_id = owned_columns(&site.owner.identifier_columns());
        let (rhs_table, rhs_columns) = match &collection.element {
            CollectionElement::OneToMany { key_columns, .. } => {
                (target.table().to_string(), key_columns.clone())
            }
            CollectionElement::ManyToMany {
                link_table,
                key_columns,
                ..
            } => (link_table.clone(), key_columns.clone()),
        };

        let path = site.path.append(&property.name);
        let role = format!(
            "{}.{}",
            site.owner.entity_name(),
            join_relative(site.relative, &property.name)
        );
        let (join_type, reason) = self.decide(&Candidate {
            role: &role,
            fetch: property.fetch,
            cascade: property.cascade,
            is_collection: true,
            target_has_proxy: target.has_proxy(),
            fk_table: &rhs_table,
            fk_columns: &rhs_columns,
            nullable: true,
            depth: site.depth,
        });
        self.record(&path, role.clone(), site.depth, join_type, reason);
        if !join_type.is_joined() {
            return Ok(());
        }

        let rhs_alias = generate_alias(&collection.role, self.associations.len() + 1);
        let filter = match collection.element {
            CollectionElement::OneToMany { .. } => self.filter_condition(target, &rhs_alias),
            CollectionElement::ManyToMany { .. } => None,
        };
        self.associations.push(Association {
            path: path.clone(),
            lhs_alias: site.alias.to_string(),
            lhs_columns: owner_id,
            rhs_table,
            rhs_alias: rhs_alias.clone(),
            rhs_columns,
            join_type,
            depth: site.depth,
            joinable: Joinable::Collection(collection.clone()),
            slot: OwnerSlot::Property(index_path.clone()),
            filter,
        });
        if join_type == JoinType::LeftOuter {
            self.joined_collections += 1;
        }

        match &collection.element {
            CollectionElement::OneToMany { .. } => {
                self.walk_entity(target, &rhs_alias, &path, site.depth + 1)
            }
            CollectionElement::ManyToMany {
                link_table,
                element_columns,
                ..
            } => {
                // The element join sits at the collection's own depth.
                let (element_join, reason) = if self.is_too_deep(site.depth) {
                    (JoinType::None, DecisionReason::TooDeep)
                } else if !self
                    .visited
                    .insert((link_table.clone(), element_columns.clone()))
                {
                    (JoinType::None, DecisionReason::Duplicate)
                } else {
                    (JoinType::LeftOuter, DecisionReason::Joined)
                };
                self.record(&path, role, site.depth, element_join, reason);
                if !element_join.is_joined() {
                    return Ok(());
                }
                let element_alias =
                    generate_alias(target.entity_name(), self.associations.len() + 1);
                let filter = self.filter_condition(target, &element_alias);
                self.associations.push(Association {
                    path: path.clone(),
                    lhs_alias: rhs_alias,
                    lhs_columns: element_columns.clone(),
                    rhs_table: target.table().to_string(),
                    rhs_alias: element_alias.clone(),
                    rhs_columns: owned_columns(&target.identifier_columns()),
                    join_type: element_join,
                    depth: site.depth,
                    joinable: Joinable::ManyToManyElement {
                        entity_name: target.entity_name().to_string(),
                    },
                    slot: OwnerSlot::Property(index_path),
                    filter,
                });
                self.walk_entity(target, &element_alias, &path, site.depth + 1)
            }
        }
    }

    /// Join type for one association. The checks run in a fixed order and
    /// the duplicate check records the foreign key as visited.
    fn decide(&mut self, candidate: &Candidate<'_>) -> (JoinType, DecisionReason) {
        if self.lock_options.lock_mode.greater_than(LockMode::Read) {
            return (JoinType::None, DecisionReason::LockMode);
        }
        if self.is_too_deep(candidate.depth) {
            return (JoinType::None, DecisionReason::TooDeep);
        }
        if candidate.is_collection && self.joined_collections >= self.config.max_joined_collections
        {
            return (JoinType::None, DecisionReason::TooManyCollections);
        }
        if !self.is_join_fetch_enabled_in_mapping(candidate)
            && !self.is_join_fetch_enabled_by_profile(candidate.role)
        {
            return (JoinType::None, DecisionReason::NotJoinFetched);
        }
        if !self.visited.insert((
            candidate.fk_table.to_string(),
            candidate.fk_columns.to_vec(),
        )) {
            return (JoinType::None, DecisionReason::Duplicate);
        }
        if !candidate.nullable && candidate.depth == 0 {
            (JoinType::Inner, DecisionReason::Joined)
        } else {
            (JoinType::LeftOuter, DecisionReason::Joined)
        }
    }

    fn is_too_deep(&self, depth: usize) -> bool {
        self.config.max_fetch_depth.is_some_and(|max| depth >= max)
    }

    fn is_join_fetch_enabled_in_mapping(&self, candidate: &Candidate<'_>) -> bool {
        if let Some(profile) = self.influencers.internal_fetch_profile() {
            return candidate.cascade.does_cascade(profile.cascading_action());
        }
        match candidate.fetch {
            FetchMode::Join => true,
            FetchMode::Select => false,
            FetchMode::Default => !candidate.is_collection && !candidate.target_has_proxy,
        }
    }

    fn is_join_fetch_enabled_by_profile(&self, role: &str) -> bool {
        self.influencers.enabled_fetch_profiles().any(|name| {
            self.metamodel
                .fetch_profile(name)
                .and_then(|profile| profile.fetch_by_role(role))
                .is_some_and(|fetch| fetch.style == FetchStyle::Join)
        })
    }

    fn record(
        &mut self,
        path: &PropertyPath,
        role: String,
        depth: usize,
        join_type: JoinType,
        reason: DecisionReason,
    ) {
        tracing::trace!(path = %path, %role, depth, %join_type, ?reason, "join decision");
        self.decisions.push(JoinDecision {
            path: path.full_path(),
            role,
            depth,
            join_type,
            reason,
        });
    }

    /// Enabled filter conditions of `persister`, qualified with `alias`.
    fn filter_condition(&self, persister: &EntityPersister, alias: &str) -> Option<String> {
        let conditions: Vec<String> = persister
            .filters()
            .iter()
            .filter(|f| self.influencers.is_filter_enabled(&f.name))
            .map(|f| f.condition.replace("{alias}", alias))
            .collect();
        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" and "))
        }
    }

    fn link_ordering(&self, link_alias: &str) -> Option<String> {
        self.associations
            .iter()
            .find(|a| a.rhs_alias == link_alias)
            .and_then(|a| match &a.joinable {
                Joinable::Collection(c) => c.order_by.clone(),
                _ => None,
            })
    }
}

fn join_relative(relative: &str, name: &str) -> String {
    if relative.is_empty() {
        name.to_string()
    } else {
        format!("{relative}.{name}")
    }
}

fn owned_columns(columns: &[&str]) -> Vec<String> {
    columns.iter().map(|c| (*c).to_string()).collect()
}

fn validate_restriction(persister: &EntityPersister, columns: &[String]) -> Result<()> {
    if columns.is_empty() {
        return Err(Error::mapping(
            MappingErrorKind::InvalidRestriction,
            Some(persister.entity_name()),
            "load restriction names no columns",
        ));
    }
    let matches_identifier = persister
        .identifier_columns()
        .iter()
        .copied()
        .eq(columns.iter().map(String::as_str));
    let matches_property = persister.properties().iter().any(|p| {
        matches!(p.kind, PropertyKind::Basic | PropertyKind::ToOne(_))
            && !p.columns.is_empty()
            && p.columns == columns
    });
    if matches_identifier || matches_property {
        Ok(())
    } else {
        Err(Error::mapping(
            MappingErrorKind::InvalidRestriction,
            Some(persister.entity_name()),
            format!(
                "columns [{}] are neither the identifier nor a mapped property",
                columns.join(", ")
            ),
        ))
    }
}

/// Column aliases of one entity; appends its select items to `select`.
fn entity_aliases(
    persister: &EntityPersister,
    alias: &str,
    owner: Option<EntityOwner>,
    lock_mode: LockMode,
    select: &mut Vec<String>,
) -> EntityAliases {
    let mut selected: Vec<String> = Vec::new();
    let mut add = |column: &str| -> String {
        let result_alias = column_alias(alias, column);
        if !selected.contains(&result_alias) {
            select.push(format!("{} as {result_alias}", qualify(alias, column)));
            selected.push(result_alias.clone());
        }
        result_alias
    };

    let identifier = persister
        .identifier_columns()
        .into_iter()
        .map(&mut add)
        .collect();
    let properties = persister
        .properties()
        .iter()
        .map(|p| property_aliases(p, &mut add))
        .collect();
    let discriminator = persister.discriminator().map(|d| add(&d.column));

    EntityAliases {
        entity_name: persister.entity_name().to_string(),
        table_alias: alias.to_string(),
        identifier,
        properties,
        discriminator,
        owner,
        lock_mode,
        key_many_to_one_targets: Vec::new(),
    }
}

fn property_aliases(
    property: &PropertyMapping,
    add: &mut impl FnMut(&str) -> String,
) -> ColumnAliases {
    match &property.kind {
        PropertyKind::Component(nested) => {
            ColumnAliases::Component(nested.iter().map(|p| property_aliases(p, add)).collect())
        }
        PropertyKind::Collection(_) => ColumnAliases::None,
        PropertyKind::Basic | PropertyKind::ToOne(_) if property.columns.is_empty() => {
            ColumnAliases::None
        }
        PropertyKind::Basic | PropertyKind::ToOne(_) => {
            ColumnAliases::Columns(property.columns.iter().map(|c| add(c)).collect())
        }
    }
}

/// `alias.kind in ('D', 'P')` for a subclass load sharing its table.
fn discriminator_restriction(
    metamodel: &Metamodel,
    persister: &EntityPersister,
    alias: &str,
) -> Option<String> {
    persister.superclass()?;
    let discriminator = persister.discriminator()?;
    let values: Vec<String> = std::iter::once(persister.entity_name())
        .chain(persister.subclasses().iter().map(String::as_str))
        .filter_map(|name| metamodel.find_persister(name))
        .filter_map(|p| p.discriminator().and_then(|d| render_literal(&d.value)))
        .collect();
    if values.is_empty() {
        return None;
    }
    Some(format!(
        "{} in ({})",
        qualify(alias, &discriminator.column),
        values.join(", ")
    ))
}

fn render_literal(value: &Value) -> Option<String> {
    match value {
        Value::Text(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        Value::Bool(b) => Some(b.to_string()),
        Value::TinyInt(_) | Value::SmallInt(_) | Value::Int(_) | Value::BigInt(_) => {
            value.as_i64().map(|v| v.to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrate_core::{
        CascadeStyle, FetchProfile, IdComponent, InternalFetchProfile, PropertyMapping,
    };

    fn metamodel() -> Metamodel {
        let league = EntityPersister::builder("League", "leagues")
            .property(PropertyMapping::basic("name", "name"))
            .lazy(false);
        let team = EntityPersister::builder("Team", "teams")
            .property(PropertyMapping::basic("name", "name"))
            .property(PropertyMapping::many_to_one("league", "League", &["league_id"]))
            .property(
                PropertyMapping::one_to_many("members", "Person", &["team_id"])
                    .cascade(CascadeStyle::Merge),
            );
        let pet = EntityPersister::builder("Pet", "pets")
            .property(PropertyMapping::basic("name", "name"))
            .filter("alive", "{alias}.alive = true");
        let person = EntityPersister::builder("Person", "people")
            .property(PropertyMapping::basic("name", "name"))
            .property(
                PropertyMapping::many_to_one("team", "Team", &["team_id"])
                    .fetch(FetchMode::Join)
                    .nullable(false),
            )
            .property(
                PropertyMapping::one_to_many("pets", "Pet", &["owner_id"])
                    .fetch(FetchMode::Join)
                    .order_by("name"),
            )
            .property(PropertyMapping::one_to_many("cars", "Car", &["owner_id"]).fetch(FetchMode::Join))
            .property(PropertyMapping::component(
                "address",
                vec![
                    PropertyMapping::basic("street", "street"),
                    PropertyMapping::many_to_one("city", "City", &["city_id"]),
                ],
            ))
            .filter("active", "{alias}.active = true");
        let car = EntityPersister::builder("Car", "cars").property(PropertyMapping::basic("plate", "plate"));
        let city = EntityPersister::builder("City", "cities").property(PropertyMapping::basic("name", "name"));
        Metamodel::builder()
            .entity(league)
            .entity(team)
            .entity(pet)
            .entity(person)
            .entity(car)
            .entity(city)
            .fetch_profile(FetchProfile::new("with-city").join("Person", "address.city"))
            .build()
            .unwrap()
    }

    fn id() -> Vec<String> {
        vec!["id".to_string()]
    }

    fn build(
        metamodel: &Metamodel,
        influencers: &LoadQueryInfluencers,
        config: JoinWalkerConfig,
        lock: LockOptions,
        batch: BatchSize,
    ) -> LoadTemplate {
        let person = metamodel.persister("Person").unwrap();
        JoinWalker::new(metamodel, Dialect::Postgres, config, influencers)
            .build(person, &id(), batch, lock)
            .unwrap()
    }

    #[test]
    fn joins_follow_mapping() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig::default(),
            LockOptions::NONE,
            BatchSize::Fixed(1),
        );

        let team = template.decision("team").unwrap();
        assert_eq!(team.join_type, JoinType::Inner);
        // Joined at depth 1, so outer even though the target has no proxy.
        assert_eq!(template.decision("team.league").unwrap().join_type, JoinType::LeftOuter);
        // Collections default to select.
        assert_eq!(
            template.decision("team.members").unwrap().reason,
            DecisionReason::NotJoinFetched
        );
        assert_eq!(template.decision("pets").unwrap().join_type, JoinType::LeftOuter);
        assert_eq!(
            template.decision("cars").unwrap().reason,
            DecisionReason::TooManyCollections
        );
        assert_eq!(
            template.decision("address.city").unwrap().reason,
            DecisionReason::NotJoinFetched
        );

        let sql = template.sql();
        assert!(sql.starts_with("select person0_.id as person0__id, person0_.name as person0__name"));
        assert!(sql.contains(" from people person0_ inner join teams team1_ on person0_.team_id=team1_.id"));
        assert!(sql.contains(" left outer join leagues league2_ on team1_.league_id=league2_.id"));
        assert!(sql.contains(" left outer join pets pets3_ on person0_.id=pets3_.owner_id"));
        assert!(sql.contains(" where person0_.id = $1"));
        assert!(sql.ends_with(" order by pets3_.name"));

        let entities = template.entities();
        assert_eq!(entities.len(), 4);
        assert_eq!(entities[1].entity_name, "Team");
        assert_eq!(
            entities[1].owner,
            Some(EntityOwner {
                entity: 0,
                slot: OwnerSlot::Property(vec![1])
            })
        );
        assert_eq!(entities[2].owner.as_ref().map(|o| o.entity), Some(1));
        assert!(template.has_collection_owners());
        assert_eq!(template.collections()[0].element, Some(3));
    }

    #[test]
    fn fetch_profile_enables_component_association() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_fetch_profile("with-city");
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig::default(),
            LockOptions::NONE,
            BatchSize::Fixed(1),
        );
        let city = template.decision("address.city").unwrap();
        assert_eq!(city.role, "Person.address.city");
        assert_eq!(city.join_type, JoinType::LeftOuter);
        assert!(template.sql().contains("on person0_.city_id=city"));
    }

    #[test]
    fn strong_locks_disable_joins() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig::default(),
            LockOptions::new(LockMode::PessimisticWrite),
            BatchSize::Fixed(1),
        );
        assert!(template
            .decisions()
            .iter()
            .all(|d| d.reason == DecisionReason::LockMode));
        assert_eq!(template.entities().len(), 1);
        assert!(template.sql().ends_with(" for update"));
    }

    #[test]
    fn depth_limit_applies() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig {
                max_fetch_depth: Some(1),
                max_joined_collections: 1,
            },
            LockOptions::NONE,
            BatchSize::Fixed(1),
        );
        assert_eq!(template.decision("team").unwrap().join_type, JoinType::Inner);
        assert_eq!(
            template.decision("team.league").unwrap().reason,
            DecisionReason::TooDeep
        );
    }

    #[test]
    fn internal_profile_joins_cascaded_associations() {
        let metamodel = metamodel();
        let team = metamodel.persister("Team").unwrap();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.set_internal_fetch_profile(Some(InternalFetchProfile::Merge));
        let template = JoinWalker::new(
            &metamodel,
            Dialect::Postgres,
            JoinWalkerConfig::default(),
            &influencers,
        )
        .build(team, &id(), BatchSize::Fixed(1), LockOptions::NONE)
        .unwrap();
        assert_eq!(template.decision("members").unwrap().join_type, JoinType::LeftOuter);
        // League does not cascade merge.
        assert_eq!(
            template.decision("league").unwrap().reason,
            DecisionReason::NotJoinFetched
        );
    }

    #[test]
    fn filters_and_batches_render() {
        let metamodel = metamodel();
        let mut influencers = LoadQueryInfluencers::new();
        influencers.enable_filter("active");
        influencers.enable_filter("alive");
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig::default(),
            LockOptions::NONE,
            BatchSize::Fixed(3),
        );
        let sql = template.sql();
        assert!(sql.contains("on person0_.id=pets3_.owner_id and (pets3_.alive = true)"));
        assert!(sql.contains(" where person0_.id in ($1, $2, $3) and person0_.active = true"));
    }

    #[test]
    fn dynamic_templates_expand_per_count() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let template = build(
            &metamodel,
            &influencers,
            JoinWalkerConfig::default(),
            LockOptions::NONE,
            BatchSize::Dynamic,
        );
        let sql = template.sql_for_count(5).unwrap();
        assert!(sql.contains("person0_.id in ($1, $2, $3, $4, $5)"));
        assert!(template.sql_for_count(0).is_err());
    }

    #[test]
    fn duplicate_foreign_keys_are_not_joined_twice() {
        let node = EntityPersister::builder("Node", "nodes")
            .property(PropertyMapping::many_to_one("parent", "Node", &["parent_id"]).fetch(FetchMode::Join))
            .property(PropertyMapping::many_to_one("origin", "Node", &["parent_id"]).fetch(FetchMode::Join));
        let metamodel = Metamodel::builder().entity(node).build().unwrap();
        let influencers = LoadQueryInfluencers::new();
        let persister = metamodel.persister("Node").unwrap();
        let template = JoinWalker::new(
            &metamodel,
            Dialect::Postgres,
            JoinWalkerConfig {
                max_fetch_depth: Some(2),
                max_joined_collections: 1,
            },
            &influencers,
        )
        .build(persister, &id(), BatchSize::Fixed(1), LockOptions::NONE)
        .unwrap();
        assert_eq!(template.decision("parent").unwrap().join_type, JoinType::LeftOuter);
        assert_eq!(
            template.decision("origin").unwrap().reason,
            DecisionReason::Duplicate
        );
    }

    #[test]
    fn invalid_requests_fail_at_build_time() {
        let metamodel = metamodel();
        let influencers = LoadQueryInfluencers::new();
        let person = metamodel.persister("Person").unwrap();
        let walker = || {
            JoinWalker::new(&metamodel, Dialect::Postgres, JoinWalkerConfig::default(), &influencers)
        };
        let err = walker()
            .build(person, &[], BatchSize::Fixed(1), LockOptions::NONE)
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::InvalidRestriction));
        let err = walker()
            .build(person, &["street".to_string()], BatchSize::Fixed(1), LockOptions::NONE)
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::InvalidRestriction));
        let err = walker()
            .build(person, &id(), BatchSize::Fixed(0), LockOptions::NONE)
            .unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::BatchSizes));
        assert!(walker()
            .build(person, &["name".to_string()], BatchSize::Fixed(1), LockOptions::NONE)
            .is_ok());
    }

    #[test]
    fn subclass_loads_restrict_the_discriminator() {
        let animal = EntityPersister::builder("Animal", "animals")
            .property(PropertyMapping::basic("name", "name"))
            .discriminator("kind", "A");
        let dog = animal.subclass("Dog", "D");
        let metamodel = Metamodel::builder().entity(animal).entity(dog).build().unwrap();
        let influencers = LoadQueryInfluencers::new();
        let dog = metamodel.persister("Dog").unwrap();
        let template = JoinWalker::new(
            &metamodel,
            Dialect::Postgres,
            JoinWalkerConfig::default(),
            &influencers,
        )
        .build(dog, &id(), BatchSize::Fixed(1), LockOptions::NONE)
        .unwrap();
        assert!(template.sql().contains("dog0_.kind as dog0__kind"));
        assert!(template.sql().ends_with("where dog0_.id = $1 and dog0_.kind in ('D')"));
    }

    #[test]
    fn embedded_key_many_to_one_is_walked() {
        let order = EntityPersister::builder("Order", "orders")
            .property(PropertyMapping::basic("code", "code"))
            .lazy(false);
        let line = EntityPersister::builder("Line", "lines").composite_id(
            "id",
            true,
            vec![
                IdComponent::key_many_to_one("order", "Order", &["order_id"]),
                IdComponent::basic("number", "line_no"),
            ],
        );
        let metamodel = Metamodel::builder().entity(order).entity(line).build().unwrap();
        let influencers = LoadQueryInfluencers::new();
        let line = metamodel.persister("Line").unwrap();
        let columns = vec!["order_id".to_string(), "line_no".to_string()];
        let template = JoinWalker::new(
            &metamodel,
            Dialect::Postgres,
            JoinWalkerConfig::default(),
            &influencers,
        )
        .build(line, &columns, BatchSize::Fixed(2), LockOptions::NONE)
        .unwrap();
        assert_eq!(template.decision("order").unwrap().join_type, JoinType::Inner);
        assert_eq!(
            template.entities()[1].owner,
            Some(EntityOwner {
                entity: 0,
                slot: OwnerSlot::KeyManyToOne(0)
            })
        );
        assert!(template.sql().contains(
            "where ((line0_.order_id = $1 and line0_.line_no = $2) or (line0_.order_id = $3 and line0_.line_no = $4))"
        ));
    }
}
