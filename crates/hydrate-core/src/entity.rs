//! Dynamic entity instances.
//!
//! Entities are untyped: an entity name, an identifier and one
//! [`PropertyValue`] per mapped property, in persister order. Instances are
//! shared through [`EntityRef`]; two references denote the same object only
//! when they point at the same allocation.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::identifier::Identifier;
use crate::value::Value;

/// The state of one property of an entity.
#[derive(Clone)]
pub enum PropertyValue {
    Basic(Value),
    /// A to-one reference; `None` when the foreign key is NULL.
    ToOne(Option<EntityRef>),
    Collection(CollectionValue),
    Component(Vec<PropertyValue>),
}

impl PropertyValue {
    pub fn as_basic(&self) -> Option<&Value> {
        match self {
            PropertyValue::Basic(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_to_one(&self) -> Option<&EntityRef> {
        match self {
            PropertyValue::ToOne(r) => r.as_ref(),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionValue> {
        match self {
            PropertyValue::Collection(c) => Some(c),
            _ => None,
        }
    }

    fn attributes_equal(&self, other: &PropertyValue) -> bool {
        match (self, other) {
            (PropertyValue::Basic(a), PropertyValue::Basic(b)) => a.key_eq(b),
            (PropertyValue::ToOne(a), PropertyValue::ToOne(b)) => match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.identifier() == b.identifier(),
                _ => false,
            },
            (PropertyValue::Collection(a), PropertyValue::Collection(b)) => a.attributes_equal(b),
            (PropertyValue::Component(a), PropertyValue::Component(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.attributes_equal(y))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Basic(v) => write!(f, "{v:?}"),
            PropertyValue::ToOne(None) => f.write_str("null"),
            PropertyValue::ToOne(Some(r)) => write!(f, "{r:?}"),
            PropertyValue::Collection(c) => write!(f, "{c:?}"),
            PropertyValue::Component(values) => f.debug_list().entries(values).finish(),
        }
    }
}

/// A collection property.
#[derive(Clone, Default)]
pub enum CollectionValue {
    /// Not fetched yet.
    #[default]
    Uninitialized,
    Initialized(Vec<EntityRef>),
}

impl CollectionValue {
    pub fn is_initialized(&self) -> bool {
        matches!(self, CollectionValue::Initialized(_))
    }

    pub fn elements(&self) -> &[EntityRef] {
        match self {
            CollectionValue::Uninitialized => &[],
            CollectionValue::Initialized(elements) => elements,
        }
    }

    /// Append `element` unless the same instance is already present.
    /// Returns whether it was added.
    pub fn add_unique(&mut self, element: EntityRef) -> bool {
        match self {
            CollectionValue::Uninitialized => {
                *self = CollectionValue::Initialized(vec![element]);
                true
            }
            CollectionValue::Initialized(elements) => {
                if elements.iter().any(|e| e.same(&element)) {
                    false
                } else {
                    elements.push(element);
                    true
                }
            }
        }
    }

    fn attributes_equal(&self, other: &CollectionValue) -> bool {
        match (self, other) {
            (CollectionValue::Uninitialized, CollectionValue::Uninitialized) => true,
            (CollectionValue::Initialized(a), CollectionValue::Initialized(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|x| b.iter().any(|y| x.identifier() == y.identifier()))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for CollectionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionValue::Uninitialized => f.write_str("<uninitialized>"),
            CollectionValue::Initialized(elements) => f.debug_list().entries(elements).finish(),
        }
    }
}

/// Mutable state of an entity instance.
pub struct Entity {
    entity_name: String,
    initialized: bool,
    values: Vec<PropertyValue>,
    /// Instances referenced by key-many-to-one identifier components.
    key_references: Vec<(usize, EntityRef)>,
}

impl Entity {
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    /// False for proxies that have not been loaded yet.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn values(&self) -> &[PropertyValue] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&PropertyValue> {
        self.values.get(index)
    }

    pub fn value_mut(&mut self, index: usize) -> Option<&mut PropertyValue> {
        self.values.get_mut(index)
    }

    pub fn set_value(&mut self, index: usize, value: PropertyValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    /// Replace the whole state, resolving the concrete entity name, and mark
    /// the instance initialized.
    pub fn hydrate(&mut self, entity_name: impl Into<String>, values: Vec<PropertyValue>) {
        self.entity_name = entity_name.into();
        self.values = values;
        self.initialized = true;
    }

    /// Instance referenced by identifier component `component`, if resolved.
    pub fn key_reference(&self, component: usize) -> Option<&EntityRef> {
        self.key_references
            .iter()
            .find(|(c, _)| *c == component)
            .map(|(_, r)| r)
    }

    pub fn set_key_reference(&mut self, component: usize, target: EntityRef) {
        match self.key_references.iter_mut().find(|(c, _)| *c == component) {
            Some(slot) => slot.1 = target,
            None => self.key_references.push((component, target)),
        }
    }
}

struct EntityCell {
    identifier: Identifier,
    state: RwLock<Entity>,
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<EntityCell>);

impl EntityRef {
    /// A fully initialized instance.
    pub fn new(
        entity_name: impl Into<String>,
        identifier: Identifier,
        values: Vec<PropertyValue>,
    ) -> Self {
        Self(Arc::new(EntityCell {
            identifier,
            state: RwLock::new(Entity {
                entity_name: entity_name.into(),
                initialized: true,
                values,
                key_references: Vec::new(),
            }),
        }))
    }

    /// An uninitialized instance standing in for a row not yet loaded.
    pub fn proxy(entity_name: impl Into<String>, identifier: Identifier) -> Self {
        Self(Arc::new(EntityCell {
            identifier,
            state: RwLock::new(Entity {
                entity_name: entity_name.into(),
                initialized: false,
                values: Vec::new(),
                key_references: Vec::new(),
            }),
        }))
    }

    pub fn identifier(&self) -> &Identifier {
        &self.0.identifier
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity_name(&self) -> String {
        self.read().entity_name.clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.read().initialized
    }

    /// Object identity.
    pub fn same(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Value of a basic property, cloned.
    pub fn basic(&self, index: usize) -> Option<Value> {
        self.read().value(index).and_then(PropertyValue::as_basic).cloned()
    }

    /// Target of a to-one property.
    pub fn to_one(&self, index: usize) -> Option<EntityRef> {
        self.read().value(index).and_then(PropertyValue::as_to_one).cloned()
    }

    /// Instance behind key-many-to-one identifier component `component`.
    pub fn key_reference(&self, component: usize) -> Option<EntityRef> {
        self.read().key_reference(component).cloned()
    }

    /// Elements of an initialized collection property.
    pub fn collection(&self, index: usize) -> Option<Vec<EntityRef>> {
        match self.read().value(index) {
            Some(PropertyValue::Collection(CollectionValue::Initialized(elements))) => {
                Some(elements.clone())
            }
            _ => None,
        }
    }

    /// Same entity name, identifier and property values. References are
    /// compared by identifier, so distinct instances of one row compare equal.
    pub fn attributes_equal(&self, other: &EntityRef) -> bool {
        if self.identifier() != other.identifier() {
            return false;
        }
        if self.same(other) {
            return true;
        }
        let a = self.read();
        let b = other.read();
        a.entity_name == b.entity_name
            && a.initialized == b.initialized
            && a.values.len() == b.values.len()
            && a.values
                .iter()
                .zip(&b.values)
                .all(|(x, y)| x.attributes_equal(y))
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only the header: referenced entities may point back at this one.
        match self.0.state.try_read() {
            Ok(state) => write!(
                f,
                "{}#{}{}",
                state.entity_name,
                self.0.identifier,
                if state.initialized { "" } else { " (proxy)" }
            ),
            Err(_) => write!(f, "?#{}", self.0.identifier),
        }
    }
}
