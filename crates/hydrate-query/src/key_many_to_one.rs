//! Links key-many-to-one identifier components to instances joined in the
//! same row.
//!
//! A non-embedded composite identifier can reference another entity. When
//! that entity is already selected by the template, either as the entity the
//! identifier holder was reached from or as a join hanging off the holder,
//! the assembler reuses it instead of resolving the reference separately.

use std::collections::HashMap;

use hydrate_core::{
    EntityPersister, ForeignKeyDirection, IdentifierType, Metamodel, Result, ToOneKind,
    ToOneMapping,
};

use crate::association::Association;
use crate::template::KeyManyToOneTarget;

/// Per entity index, the key-many-to-one components whose target is in the row.
pub(crate) fn resolve_key_many_to_one_targets(
    metamodel: &Metamodel,
    root: &EntityPersister,
    root_alias: &str,
    associations: &[Association],
    positions: &HashMap<String, usize>,
) -> Result<Vec<(usize, Vec<KeyManyToOneTarget>)>> {
    let holders = std::iter::once((root_alias, root.entity_name())).chain(
        associations
            .iter()
            .filter_map(|a| a.entity_name().map(|name| (a.rhs_alias.as_str(), name))),
    );

    let mut resolved = Vec::new();
    for (alias, entity_name) in holders {
        let persister = metamodel.persister(entity_name)?;
        let IdentifierType::Composite {
            embedded: false,
            components,
        } = persister.identifier_type()
        else {
            continue;
        };
        let Some(&holder) = positions.get(alias) else {
            continue;
        };

        let mut targets = Vec::new();
        for (component, id_component) in components.iter().enumerate() {
            let Some(target) = &id_component.key_many_to_one else {
                continue;
            };
            if let Some(entity) =
                joined_target(root, root_alias, alias, target, associations, positions)
            {
                targets.push(KeyManyToOneTarget { component, entity });
            }
        }
        if !targets.is_empty() {
            tracing::trace!(entity = %entity_name, alias, ?targets, "key-many-to-one targets");
            resolved.push((holder, targets));
        }
    }
    Ok(resolved)
}

fn joined_target(
    root: &EntityPersister,
    root_alias: &str,
    alias: &str,
    target: &str,
    associations: &[Association],
    positions: &HashMap<String, usize>,
) -> Option<usize> {
    // The entity this holder was joined from, matched by name.
    let lhs_alias = associations
        .iter()
        .find(|a| a.rhs_alias == alias)
        .map(|a| a.lhs_alias.as_str());
    if let Some(lhs_alias) = lhs_alias {
        let lhs_entity = if lhs_alias == root_alias {
            Some(root.entity_name())
        } else {
            associations
                .iter()
                .find(|a| a.rhs_alias == lhs_alias)
                .and_then(Association::entity_name)
        };
        if lhs_entity == Some(target) {
            if let Some(&entity) = positions.get(lhs_alias) {
                return Some(entity);
            }
        }
    }

    // A many-to-one from the holder onto the same target, matched by type.
    let key_type = ToOneMapping {
        target_entity: target.to_string(),
        kind: ToOneKind::ManyToOne,
        direction: ForeignKeyDirection::FromParent,
        mapped_by: None,
    };
    associations
        .iter()
        .filter(|a| a.lhs_alias == alias)
        .find(|a| a.to_one() == Some(&key_type))
        .and_then(|a| positions.get(&a.rhs_alias).copied())
}
