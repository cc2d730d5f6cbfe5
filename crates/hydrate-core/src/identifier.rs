//! Identifier values and entity keys.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// An entity identifier: one value per identifier column.
///
/// Equality and hashing follow [`Value::key_eq`], so integer widths do not
/// matter and composite identifiers compare component-wise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identifier(Vec<Value>);

impl Identifier {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Identifier for a single-column key.
    pub fn single(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// Number of columns spanned.
    pub fn span(&self) -> usize {
        self.0.len()
    }

    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    /// True when every component is NULL, i.e. an outer join found nothing.
    pub fn is_null(&self) -> bool {
        self.0.iter().all(Value::is_null)
    }
}

impl PartialEq for Identifier {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a.key_eq(b))
    }
}

impl Eq for Identifier {}

impl Hash for Identifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for value in &self.0 {
            value.key_hash(state);
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                write!(f, "(")?;
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Value> for Identifier {
    fn from(value: Value) -> Self {
        Self::single(value)
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<i32> for Identifier {
    fn from(value: i32) -> Self {
        Self::single(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self::single(value)
    }
}

impl From<Vec<Value>> for Identifier {
    fn from(values: Vec<Value>) -> Self {
        Self::new(values)
    }
}

/// Identity-map key: identifier plus the root of the entity hierarchy.
///
/// Subclasses share their root's key space, so `Dog#1` and `Animal#1` are
/// the same key. The concrete entity name is kept only for diagnostics.
#[derive(Debug, Clone)]
pub struct EntityKey {
    identifier: Identifier,
    root_entity_name: Arc<str>,
    entity_name: Arc<str>,
}

impl EntityKey {
    pub fn new(
        identifier: Identifier,
        root_entity_name: impl Into<Arc<str>>,
        entity_name: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            identifier,
            root_entity_name: root_entity_name.into(),
            entity_name: entity_name.into(),
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.root_entity_name == other.root_entity_name && self.identifier == other.identifier
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.root_entity_name.hash(state);
        self.identifier.hash(state);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}#{}]", self.entity_name, self.identifier)
    }
}

/// Describe a batch of identifiers the way load errors report them,
/// e.g. `[Person#<1, 2, 3>]`.
pub fn batch_info_string(entity_name: &str, ids: &[Identifier]) -> String {
    let mut out = format!("[{entity_name}#<");
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&id.to_string());
    }
    out.push_str(">]");
    out
}
