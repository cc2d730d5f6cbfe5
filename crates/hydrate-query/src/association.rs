//! Outer-joinable associations collected by the join walker.

use hydrate_core::{CollectionElement, CollectionMapping, ToOneMapping};

use crate::alias::PropertyPath;
use crate::join::{Join, JoinType};
use crate::template::OwnerSlot;

/// What sits on the right-hand side of a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Joinable {
    /// A to-one target (including key-many-to-one identifier components).
    Entity {
        entity_name: String,
        to_one: ToOneMapping,
    },
    /// A collection: the element table for one-to-many, the link table for
    /// many-to-many.
    Collection(CollectionMapping),
    /// Element table of a many-to-many, joined from the link table.
    ManyToManyElement { entity_name: String },
}

/// One joined association of a load statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub path: PropertyPath,
    pub lhs_alias: String,
    pub lhs_columns: Vec<String>,
    pub rhs_table: String,
    pub rhs_alias: String,
    pub rhs_columns: Vec<String>,
    pub join_type: JoinType,
    pub depth: usize,
    pub joinable: Joinable,
    /// Where the joined value lands on the owning entity.
    pub slot: OwnerSlot,
    /// Enabled filter conditions of the target, qualified with `rhs_alias`.
    pub filter: Option<String>,
}

impl Association {
    /// Does the join select the columns of an entity?
    pub fn consumes_entity_alias(&self) -> bool {
        match &self.joinable {
            Joinable::Entity { .. } | Joinable::ManyToManyElement { .. } => true,
            Joinable::Collection(c) => matches!(c.element, CollectionElement::OneToMany { .. }),
        }
    }

    /// Entity whose columns are selected through `rhs_alias`.
    pub fn entity_name(&self) -> Option<&str> {
        match &self.joinable {
            Joinable::Entity { entity_name, .. } | Joinable::ManyToManyElement { entity_name } => {
                Some(entity_name)
            }
            Joinable::Collection(c) => match &c.element {
                CollectionElement::OneToMany { target_entity, .. } => Some(target_entity),
                CollectionElement::ManyToMany { .. } => None,
            },
        }
    }

    pub fn is_collection(&self) -> bool {
        matches!(self.joinable, Joinable::Collection(_))
    }

    pub fn to_one(&self) -> Option<&ToOneMapping> {
        match &self.joinable {
            Joinable::Entity { to_one, .. } => Some(to_one),
            _ => None,
        }
    }

    pub fn to_join(&self) -> Join {
        let join = Join::new(
            self.join_type,
            &self.rhs_table,
            &self.rhs_alias,
            &self.lhs_alias,
            &self.lhs_columns,
            &self.rhs_columns,
        );
        match &self.filter {
            Some(filter) => join.condition(filter.clone()),
            None => join,
        }
    }
}
