//! Entity persister metadata.
//!
//! A persister describes how one entity type maps to a table: identifier
//! shape, properties and associations, inheritance, caching and batch
//! fetching. The loading core only ever reads it.

use crate::fetch::{CascadeStyle, FetchMode};
use crate::identifier::{EntityKey, Identifier};
use crate::value::Value;

// ============================================================================
// Identifier mapping
// ============================================================================

/// One component of a composite identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdComponent {
    pub name: String,
    pub columns: Vec<String>,
    /// Target entity when this component is a key-many-to-one reference.
    pub key_many_to_one: Option<String>,
}

impl IdComponent {
    /// A plain column component.
    pub fn basic(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: vec![column.into()],
            key_many_to_one: None,
        }
    }

    /// A component referencing another entity through its foreign key columns.
    pub fn key_many_to_one(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| (*c).to_string()).collect(),
            key_many_to_one: Some(target_entity.into()),
        }
    }
}

/// Shape of an entity identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentifierType {
    Simple {
        column: String,
    },
    /// `embedded` marks an identifier mapped as the entity's own properties
    /// rather than a separate id class.
    Composite {
        embedded: bool,
        components: Vec<IdComponent>,
    },
}

impl IdentifierType {
    /// All identifier columns, flattened in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        match self {
            IdentifierType::Simple { column } => vec![column.as_str()],
            IdentifierType::Composite { components, .. } => components
                .iter()
                .flat_map(|c| c.columns.iter().map(String::as_str))
                .collect(),
        }
    }

    pub fn column_span(&self) -> usize {
        match self {
            IdentifierType::Simple { .. } => 1,
            IdentifierType::Composite { components, .. } => {
                components.iter().map(|c| c.columns.len()).sum()
            }
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, IdentifierType::Composite { .. })
    }

    pub fn is_embedded(&self) -> bool {
        matches!(self, IdentifierType::Composite { embedded: true, .. })
    }

    /// Key-many-to-one components of a composite identifier.
    pub fn key_many_to_ones(&self) -> impl Iterator<Item = &IdComponent> {
        let components: &[IdComponent] = match self {
            IdentifierType::Simple { .. } => &[],
            IdentifierType::Composite { components, .. } => components,
        };
        components.iter().filter(|c| c.key_many_to_one.is_some())
    }

    /// Does the identifier contain entity references?
    pub fn has_association(&self) -> bool {
        self.key_many_to_ones().next().is_some()
    }

    /// Identifier equality as the mapping defines it.
    pub fn is_equal(&self, a: &Identifier, b: &Identifier) -> bool {
        a.span() == self.column_span() && a == b
    }
}

// ============================================================================
// Property mapping
// ============================================================================

/// Which side of a to-one association holds the foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForeignKeyDirection {
    /// The owning table holds the foreign key (many-to-one).
    FromParent,
    /// The associated table holds the key (shared-primary-key or inverse one-to-one).
    ToParent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToOneKind {
    ManyToOne,
    OneToOne,
}

/// A to-one association.
///
/// Structural equality of this value is the "same association type" test
/// used when matching key-many-to-one inverses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToOneMapping {
    pub target_entity: String,
    pub kind: ToOneKind,
    pub direction: ForeignKeyDirection,
    /// Property on the target that owns the foreign key (inverse one-to-one).
    pub mapped_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionElement {
    /// Element rows carry `key_columns` referencing the owner identifier.
    OneToMany {
        target_entity: String,
        key_columns: Vec<String>,
    },
    /// A link table joins owner and element.
    ManyToMany {
        target_entity: String,
        link_table: String,
        key_columns: Vec<String>,
        element_columns: Vec<String>,
    },
}

impl CollectionElement {
    pub fn target_entity(&self) -> &str {
        match self {
            CollectionElement::OneToMany { target_entity, .. }
            | CollectionElement::ManyToMany { target_entity, .. } => target_entity,
        }
    }

    pub fn key_columns(&self) -> &[String] {
        match self {
            CollectionElement::OneToMany { key_columns, .. }
            | CollectionElement::ManyToMany { key_columns, .. } => key_columns,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMapping {
    /// `Owner.property`
    pub role: String,
    pub element: CollectionElement,
    pub order_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Basic,
    ToOne(ToOneMapping),
    Collection(CollectionMapping),
    Component(Vec<PropertyMapping>),
}

/// A mapped property of an entity or component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMapping {
    pub name: String,
    /// Columns on the owning table (empty for collections, components and
    /// to-ones whose key lives on the other side).
    pub columns: Vec<String>,
    pub kind: PropertyKind,
    pub nullable: bool,
    pub fetch: FetchMode,
    pub cascade: CascadeStyle,
}

impl PropertyMapping {
    fn with_kind(name: impl Into<String>, columns: Vec<String>, kind: PropertyKind) -> Self {
        Self {
            name: name.into(),
            columns,
            kind,
            nullable: true,
            fetch: FetchMode::Default,
            cascade: CascadeStyle::None,
        }
    }

    /// A single-column value property.
    pub fn basic(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self::with_kind(name, vec![column.into()], PropertyKind::Basic)
    }

    /// A many-to-one association through foreign key columns on the owner.
    pub fn many_to_one(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        columns: &[&str],
    ) -> Self {
        Self::with_kind(
            name,
            columns.iter().map(|c| (*c).to_string()).collect(),
            PropertyKind::ToOne(ToOneMapping {
                target_entity: target_entity.into(),
                kind: ToOneKind::ManyToOne,
                direction: ForeignKeyDirection::FromParent,
                mapped_by: None,
            }),
        )
    }

    /// A one-to-one sharing the owner's primary key.
    pub fn one_to_one(name: impl Into<String>, target_entity: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            Vec::new(),
            PropertyKind::ToOne(ToOneMapping {
                target_entity: target_entity.into(),
                kind: ToOneKind::OneToOne,
                direction: ForeignKeyDirection::ToParent,
                mapped_by: None,
            }),
        )
    }

    /// The inverse side of a one-to-one whose key is `mapped_by` on the target.
    pub fn one_to_one_mapped_by(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self::with_kind(
            name,
            Vec::new(),
            PropertyKind::ToOne(ToOneMapping {
                target_entity: target_entity.into(),
                kind: ToOneKind::OneToOne,
                direction: ForeignKeyDirection::ToParent,
                mapped_by: Some(mapped_by.into()),
            }),
        )
    }

    /// A one-to-many collection; `role` is filled in when added to a persister.
    pub fn one_to_many(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        key_columns: &[&str],
    ) -> Self {
        Self::with_kind(
            name,
            Vec::new(),
            PropertyKind::Collection(CollectionMapping {
                role: String::new(),
                element: CollectionElement::OneToMany {
                    target_entity: target_entity.into(),
                    key_columns: key_columns.iter().map(|c| (*c).to_string()).collect(),
                },
                order_by: None,
            }),
        )
    }

    /// A many-to-many collection through `link_table`.
    pub fn many_to_many(
        name: impl Into<String>,
        target_entity: impl Into<String>,
        link_table: impl Into<String>,
        key_columns: &[&str],
        element_columns: &[&str],
    ) -> Self {
        Self::with_kind(
            name,
            Vec::new(),
            PropertyKind::Collection(CollectionMapping {
                role: String::new(),
                element: CollectionElement::ManyToMany {
                    target_entity: target_entity.into(),
                    link_table: link_table.into(),
                    key_columns: key_columns.iter().map(|c| (*c).to_string()).collect(),
                    element_columns: element_columns.iter().map(|c| (*c).to_string()).collect(),
                },
                order_by: None,
            }),
        )
    }

    /// An embedded value grouping nested properties.
    pub fn component(name: impl Into<String>, properties: Vec<PropertyMapping>) -> Self {
        Self::with_kind(name, Vec::new(), PropertyKind::Component(properties))
    }

    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub fn fetch(mut self, mode: FetchMode) -> Self {
        self.fetch = mode;
        self
    }

    #[must_use]
    pub fn cascade(mut self, style: CascadeStyle) -> Self {
        self.cascade = style;
        self
    }

    /// Default ordering of a collection's elements (builder pattern).
    #[must_use]
    pub fn order_by(mut self, ordering: impl Into<String>) -> Self {
        if let PropertyKind::Collection(c) = &mut self.kind {
            c.order_by = Some(ordering.into());
        }
        self
    }

    pub fn is_association(&self) -> bool {
        matches!(
            self.kind,
            PropertyKind::ToOne(_) | PropertyKind::Collection(_)
        )
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.kind, PropertyKind::Collection(_))
    }

    pub fn as_to_one(&self) -> Option<&ToOneMapping> {
        match &self.kind {
            PropertyKind::ToOne(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionMapping> {
        match &self.kind {
            PropertyKind::Collection(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Entity persister
// ============================================================================

/// Second-level cache settings of an entity hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub region: String,
    /// Store immutable instances by reference instead of disassembling them.
    pub reference_entries: bool,
}

/// Single-table inheritance discriminator.
#[derive(Debug, Clone, PartialEq)]
pub struct Discriminator {
    pub column: String,
    /// Value identifying rows of this exact entity.
    pub value: Value,
}

/// A named SQL restriction that sessions may enable.
///
/// `{alias}` in the condition is replaced with the entity's table alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterMapping {
    pub name: String,
    pub condition: String,
}

/// Runtime descriptor of an entity's table, columns and associations.
#[derive(Debug, Clone)]
pub struct EntityPersister {
    entity_name: String,
    root_entity_name: String,
    superclass: Option<String>,
    subclasses: Vec<String>,
    table: String,
    identifier_property: String,
    identifier_type: IdentifierType,
    properties: Vec<PropertyMapping>,
    version_property: Option<usize>,
    discriminator: Option<Discriminator>,
    batch_size: usize,
    lazy: bool,
    cache: Option<CacheSettings>,
    mutable: bool,
    filters: Vec<FilterMapping>,
}

impl EntityPersister {
    /// Start describing an entity mapped to `table` with a single `id` column.
    pub fn builder(
        entity_name: impl Into<String>,
        table: impl Into<String>,
    ) -> EntityPersisterBuilder {
        EntityPersisterBuilder::new(entity_name, table)
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    /// All subclasses (direct and indirect), not including this entity.
    pub fn subclasses(&self) -> &[String] {
        &self.subclasses
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn identifier_property(&self) -> &str {
        &self.identifier_property
    }

    pub fn identifier_type(&self) -> &IdentifierType {
        &self.identifier_type
    }

    pub fn identifier_columns(&self) -> Vec<&str> {
        self.identifier_type.columns()
    }

    pub fn identifier_span(&self) -> usize {
        self.identifier_type.column_span()
    }

    pub fn properties(&self) -> &[PropertyMapping] {
        &self.properties
    }

    pub fn property(&self, index: usize) -> Option<&PropertyMapping> {
        self.properties.get(index)
    }

    pub fn property_index(&self, name: &str) -> Option<usize> {
        self.properties.iter().position(|p| p.name == name)
    }

    pub fn version_index(&self) -> Option<usize> {
        self.version_property
    }

    pub fn is_versioned(&self) -> bool {
        self.version_property.is_some()
    }

    pub fn version_column(&self) -> Option<&str> {
        self.version_property
            .and_then(|i| self.properties.get(i))
            .and_then(|p| p.columns.first())
            .map(String::as_str)
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    /// Configured batch size; 1 disables batch fetching.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn is_batch_loadable(&self) -> bool {
        self.batch_size > 1
    }

    /// Can references to this entity be represented by uninitialized proxies?
    pub fn has_proxy(&self) -> bool {
        self.lazy
    }

    pub fn cache(&self) -> Option<&CacheSettings> {
        self.cache.as_ref()
    }

    pub fn can_read_from_cache(&self) -> bool {
        self.cache.is_some()
    }

    pub fn can_write_to_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Reference entries are only safe for immutable entities.
    pub fn can_use_reference_cache_entries(&self) -> bool {
        !self.mutable && self.cache.as_ref().is_some_and(|c| c.reference_entries)
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn filters(&self) -> &[FilterMapping] {
        &self.filters
    }

    pub fn has_collections(&self) -> bool {
        fn any_collection(props: &[PropertyMapping]) -> bool {
            props.iter().any(|p| match &p.kind {
                PropertyKind::Collection(_) => true,
                PropertyKind::Component(nested) => any_collection(nested),
                _ => false,
            })
        }
        any_collection(&self.properties)
    }

    /// Build the identity-map key for an identifier of this entity.
    pub fn entity_key(&self, identifier: Identifier) -> EntityKey {
        EntityKey::new(
            identifier,
            self.root_entity_name.as_str(),
            self.entity_name.as_str(),
        )
    }

    /// Is `entity_name` this entity or one of its subclasses?
    pub fn is_instance(&self, entity_name: &str) -> bool {
        self.entity_name == entity_name || self.subclasses.iter().any(|s| s == entity_name)
    }

    pub(crate) fn set_subclasses(&mut self, subclasses: Vec<String>) {
        self.subclasses = subclasses;
    }

    pub(crate) fn set_root_entity_name(&mut self, root: String) {
        self.root_entity_name = root;
    }
}

/// Builder for [`EntityPersister`].
#[derive(Debug, Clone)]
pub struct EntityPersisterBuilder {
    persister: EntityPersister,
    version_name: Option<String>,
}

impl EntityPersisterBuilder {
    pub fn new(entity_name: impl Into<String>, table: impl Into<String>) -> Self {
        let entity_name = entity_name.into();
        Self {
            persister: EntityPersister {
                root_entity_name: entity_name.clone(),
                entity_name,
                superclass: None,
                subclasses: Vec::new(),
                table: table.into(),
                identifier_property: "id".to_string(),
                identifier_type: IdentifierType::Simple {
                    column: "id".to_string(),
                },
                properties: Vec::new(),
                version_property: None,
                discriminator: None,
                batch_size: 1,
                lazy: true,
                cache: None,
                mutable: true,
                filters: Vec::new(),
            },
            version_name: None,
        }
    }

    /// Single-column identifier (builder pattern).
    #[must_use]
    pub fn id(mut self, property: impl Into<String>, column: impl Into<String>) -> Self {
        self.persister.identifier_property = property.into();
        self.persister.identifier_type = IdentifierType::Simple {
            column: column.into(),
        };
        self
    }

    /// Composite identifier (builder pattern).
    #[must_use]
    pub fn composite_id(
        mut self,
        property: impl Into<String>,
        embedded: bool,
        components: Vec<IdComponent>,
    ) -> Self {
        self.persister.identifier_property = property.into();
        self.persister.identifier_type = IdentifierType::Composite {
            embedded,
            components,
        };
        self
    }

    #[must_use]
    pub fn property(mut self, mut property: PropertyMapping) -> Self {
        assign_roles(&self.persister.entity_name, "", &mut property);
        self.persister.properties.push(property);
        self
    }

    /// Mark an already added basic property as the version (builder pattern).
    #[must_use]
    pub fn version(mut self, property: impl Into<String>) -> Self {
        self.version_name = Some(property.into());
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.persister.batch_size = size;
        self
    }

    /// Whether references to this entity may be proxies (builder pattern).
    #[must_use]
    pub fn lazy(mut self, value: bool) -> Self {
        self.persister.lazy = value;
        self
    }

    #[must_use]
    pub fn cache_region(mut self, region: impl Into<String>) -> Self {
        self.persister.cache = Some(CacheSettings {
            region: region.into(),
            reference_entries: false,
        });
        self
    }

    /// Allow reference cache entries; only honored for immutable entities.
    #[must_use]
    pub fn reference_cache_entries(mut self, value: bool) -> Self {
        if let Some(cache) = &mut self.persister.cache {
            cache.reference_entries = value;
        }
        self
    }

    #[must_use]
    pub fn immutable(mut self) -> Self {
        self.persister.mutable = false;
        self
    }

    #[must_use]
    pub fn filter(mut self, name: impl Into<String>, condition: impl Into<String>) -> Self {
        self.persister.filters.push(FilterMapping {
            name: name.into(),
            condition: condition.into(),
        });
        self
    }

    /// Discriminator column and this entity's value (builder pattern).
    #[must_use]
    pub fn discriminator(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.persister.discriminator = Some(Discriminator {
            column: column.into(),
            value: value.into(),
        });
        self
    }

    /// Derive a single-table subclass sharing this entity's table, identifier
    /// and properties, told apart by `discriminator_value`.
    pub fn subclass(
        &self,
        entity_name: impl Into<String>,
        discriminator_value: impl Into<Value>,
    ) -> EntityPersisterBuilder {
        let mut sub = self.clone();
        sub.persister.superclass = Some(self.persister.entity_name.clone());
        sub.persister.entity_name = entity_name.into();
        if let Some(d) = &mut sub.persister.discriminator {
            d.value = discriminator_value.into();
        }
        sub
    }

    /// Finish the persister. Cross-entity validation happens in the metamodel.
    pub fn build(mut self) -> EntityPersister {
        if let Some(name) = &self.version_name {
            self.persister.version_property = self.persister.property_index(name);
        }
        self.persister
    }

    pub(crate) fn version_name(&self) -> Option<&str> {
        self.version_name.as_deref()
    }
}

fn assign_roles(entity: &str, prefix: &str, property: &mut PropertyMapping) {
    let path = if prefix.is_empty() {
        property.name.clone()
    } else {
        format!("{prefix}.{}", property.name)
    };
    match &mut property.kind {
        PropertyKind::Collection(c) if c.role.is_empty() => {
            c.role = format!("{entity}.{path}");
        }
        PropertyKind::Component(nested) => {
            for p in nested {
                assign_roles(entity, &path, p);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityPersister {
        EntityPersister::builder("Person", "people")
            .property(PropertyMapping::basic("name", "name"))
            .property(PropertyMapping::basic("version", "version"))
            .property(PropertyMapping::many_to_one("team", "Team", &["team_id"]))
            .property(PropertyMapping::one_to_many("pets", "Pet", &["owner_id"]))
            .version("version")
            .batch_size(10)
            .build()
    }

    #[test]
    fn builder_fills_defaults_and_roles() {
        let p = person();
        assert_eq!(p.identifier_columns(), vec!["id"]);
        assert_eq!(p.version_index(), Some(1));
        assert_eq!(p.version_column(), Some("version"));
        assert!(p.is_batch_loadable());
        assert!(p.has_collections());
        let pets = p.properties()[3].as_collection().unwrap();
        assert_eq!(pets.role, "Person.pets");
    }

    #[test]
    fn composite_identifier_shape() {
        let id = IdentifierType::Composite {
            embedded: false,
            components: vec![
                IdComponent::key_many_to_one("order", "Order", &["order_id"]),
                IdComponent::basic("line", "line_no"),
            ],
        };
        assert_eq!(id.columns(), vec!["order_id", "line_no"]);
        assert_eq!(id.column_span(), 2);
        assert!(id.has_association());
        let a = Identifier::new(vec![Value::Int(1), Value::Int(2)]);
        assert!(id.is_equal(&a, &Identifier::new(vec![Value::BigInt(1), Value::BigInt(2)])));
        assert!(!id.is_equal(&a, &Identifier::single(1_i64)));
    }

    #[test]
    fn subclasses_share_table_and_identifier() {
        let animal = EntityPersister::builder("Animal", "animals").discriminator("kind", "A");
        let dog = animal.subclass("Dog", "D").build();
        assert_eq!(dog.table(), "animals");
        assert_eq!(dog.superclass(), Some("Animal"));
        assert_eq!(dog.discriminator().unwrap().value, Value::Text("D".into()));
    }

    #[test]
    fn reference_entries_require_immutability() {
        let mutable = EntityPersister::builder("Country", "countries")
            .cache_region("countries")
            .reference_cache_entries(true)
            .build();
        assert!(!mutable.can_use_reference_cache_entries());
        let immutable = EntityPersister::builder("Country", "countries")
            .cache_region("countries")
            .reference_cache_entries(true)
            .immutable()
            .build();
        assert!(immutable.can_use_reference_cache_entries());
    }
}
