//! Immutable load templates.
//!
//! A [`LoadTemplate`] is the rendered result of one join walk: SQL text plus
//! everything the result assembler needs to map row columns back onto
//! entities. Templates are built once and shared through `Arc`.

use std::fmt;

use hydrate_core::{
    Dialect, Error, Identifier, LockMode, LockOptions, MappingErrorKind, Result, Value,
};

use crate::fragment::{batch_fragment, where_fragment};
use crate::join::JoinType;

/// Result-set aliases of one property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnAliases {
    /// Collections and to-ones keyed on the other table.
    None,
    Columns(Vec<String>),
    Component(Vec<ColumnAliases>),
}

/// Where a joined entity hangs off its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerSlot {
    /// Property index path, through components, of a to-one.
    Property(Vec<usize>),
    /// Component index of a key-many-to-one in the owner's identifier.
    KeyManyToOne(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOwner {
    /// Entity index of the owner within the row.
    pub entity: usize,
    pub slot: OwnerSlot,
}

/// A key-many-to-one component whose target is already joined in the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyManyToOneTarget {
    /// Index of the component within the composite identifier.
    pub component: usize,
    /// Entity index holding the referenced instance.
    pub entity: usize,
}

/// Column aliases of one entity selected by a template.
///
/// Index 0 is always the entity being loaded; joined entities follow in
/// walk order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityAliases {
    pub entity_name: String,
    pub table_alias: String,
    pub identifier: Vec<String>,
    /// One entry per persister property, in property order.
    pub properties: Vec<ColumnAliases>,
    pub discriminator: Option<String>,
    pub owner: Option<EntityOwner>,
    pub lock_mode: LockMode,
    pub key_many_to_one_targets: Vec<KeyManyToOneTarget>,
}

/// A collection fetched by outer join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionFetch {
    pub role: String,
    /// Entity index of the collection owner.
    pub owner: usize,
    /// Property index path of the collection on the owner.
    pub property: Vec<usize>,
    /// Entity index of the element, when the element table is joined.
    pub element: Option<usize>,
}

/// Why an association got the join type it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionReason {
    /// Lock mode stronger than READ disables joins.
    LockMode,
    TooDeep,
    TooManyCollections,
    /// Neither the mapping nor an enabled fetch profile asks for a join.
    NotJoinFetched,
    /// Same foreign key already joined.
    Duplicate,
    Joined,
}

/// The join decision recorded for one association during the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinDecision {
    /// Path from the loaded entity, e.g. `team.league`.
    pub path: String,
    /// `Entity.relative.path`, the key fetch profiles use.
    pub role: String,
    pub depth: usize,
    pub join_type: JoinType,
    pub reason: DecisionReason,
}

/// Number of keys a template binds per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchSize {
    Fixed(usize),
    /// Restriction expanded per call to the exact key count.
    Dynamic,
}

impl fmt::Display for BatchSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchSize::Fixed(n) => write!(f, "{n}"),
            BatchSize::Dynamic => f.write_str("dynamic"),
        }
    }
}

/// Rendered load statement plus the row shape it produces.
#[derive(Debug, Clone)]
pub struct LoadTemplate {
    pub(crate) entity_name: String,
    pub(crate) dialect: Dialect,
    pub(crate) batch_size: BatchSize,
    pub(crate) restriction_alias: String,
    pub(crate) restriction_columns: Vec<String>,
    /// Everything up to and including `where `.
    pub(crate) head: String,
    /// Filters, ordering and lock clause following the restriction.
    pub(crate) tail: String,
    /// Rendered statement for fixed templates; single-key form for dynamic ones.
    pub(crate) sql: String,
    pub(crate) entities: Vec<EntityAliases>,
    pub(crate) collections: Vec<CollectionFetch>,
    pub(crate) decisions: Vec<JoinDecision>,
    pub(crate) lock_options: LockOptions,
}

impl LoadTemplate {
    pub(crate) fn finish(mut self) -> Self {
        let count = match self.batch_size {
            BatchSize::Fixed(n) => n,
            BatchSize::Dynamic => 1,
        };
        let restriction = where_fragment(&self.restriction_alias, &self.restriction_columns, count);
        self.sql = self
            .dialect
            .render_placeholders(&format!("{}{restriction}{}", self.head, self.tail));
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn batch_size(&self) -> BatchSize {
        self.batch_size
    }

    /// The statement, rendered for the dialect.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The statement with its restriction expanded to exactly `count` keys.
    ///
    /// Composite keys use row-value lists when the dialect supports them.
    pub fn sql_for_count(&self, count: usize) -> Result<String> {
        if count == 0 {
            return Err(Error::mapping(
                MappingErrorKind::BatchSizes,
                Some(&self.entity_name),
                "cannot render a load for zero keys",
            ));
        }
        if let BatchSize::Fixed(n) = self.batch_size {
            if n != count {
                return Err(Error::mapping(
                    MappingErrorKind::BatchSizes,
                    Some(&self.entity_name),
                    format!("template binds {n} keys, not {count}"),
                ));
            }
            return Ok(self.sql.clone());
        }
        let restriction = batch_fragment(
            &self.restriction_alias,
            &self.restriction_columns,
            count,
            self.dialect,
        );
        Ok(self
            .dialect
            .render_placeholders(&format!("{}{restriction}{}", self.head, self.tail)))
    }

    pub fn restriction_columns(&self) -> &[String] {
        &self.restriction_columns
    }

    /// Flatten keys into positional parameters, one slot set per key.
    pub fn bind(&self, keys: &[Identifier]) -> Result<Vec<Value>> {
        let span = self.restriction_columns.len();
        if let BatchSize::Fixed(n) = self.batch_size {
            if keys.len() != n {
                return Err(Error::mapping(
                    MappingErrorKind::BatchSizes,
                    Some(&self.entity_name),
                    format!("template binds {n} keys, got {}", keys.len()),
                ));
            }
        }
        let mut params = Vec::with_capacity(keys.len() * span);
        for key in keys {
            if key.span() != span {
                return Err(Error::mapping(
                    MappingErrorKind::IdentifierShape,
                    Some(&self.entity_name),
                    format!("key {key} does not span {span} columns"),
                ));
            }
            params.extend(key.values().iter().cloned());
        }
        Ok(params)
    }

    pub fn entities(&self) -> &[EntityAliases] {
        &self.entities
    }

    pub fn collections(&self) -> &[CollectionFetch] {
        &self.collections
    }

    /// Does the template join-fetch a collection (so one key may span rows)?
    pub fn has_collection_owners(&self) -> bool {
        !self.collections.is_empty()
    }

    pub fn decisions(&self) -> &[JoinDecision] {
        &self.decisions
    }

    pub fn decision(&self, path: &str) -> Option<&JoinDecision> {
        self.decisions.iter().find(|d| d.path == path)
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock_options
    }

    pub fn lock_modes(&self) -> Vec<LockMode> {
        self.entities.iter().map(|e| e.lock_mode).collect()
    }

    pub fn key_many_to_one_targets(&self, entity: usize) -> &[KeyManyToOneTarget] {
        self.entities
            .get(entity)
            .map_or(&[], |e| e.key_many_to_one_targets.as_slice())
    }
}
