//! Per-request load resolution.
//!
//! A request walks `session probe -> second-level probe -> SQL load`, stopping
//! at the first layer that answers. References discovered along the way that
//! must be loaded eagerly are queued in the persistence context and drained
//! iteratively once the request completes.

use std::fmt;
use std::sync::Arc;

use hydrate_core::{
    Connection, Cx, EntityRef, Error, Identifier, IntegrityErrorKind, LockOptions,
    MappingErrorKind, Outcome, PropertyValue,
};

use crate::Session;
use crate::assembler::set_property_at;
use crate::cache_lookup::{LookupStatus, load_from_second_level_cache, load_from_session_cache};
use crate::entity_loader::QueryParameters;
use crate::persistence_context::{DeferredRestriction, PendingLoad};

/// One request to load an entity by identifier.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub entity_name: String,
    pub identifier: Identifier,
    /// Caller-supplied instance to populate.
    pub instance_to_load: Option<EntityRef>,
    pub lock_options: LockOptions,
    /// Overrides the session's default read-only setting.
    pub read_only: Option<bool>,
}

impl LoadRequest {
    pub fn new(entity_name: impl Into<String>, identifier: impl Into<Identifier>) -> Self {
        Self {
            entity_name: entity_name.into(),
            identifier: identifier.into(),
            instance_to_load: None,
            lock_options: LockOptions::NONE,
            read_only: None,
        }
    }

    #[must_use]
    pub fn instance_to_load(mut self, instance: EntityRef) -> Self {
        self.instance_to_load = Some(instance);
        self
    }

    #[must_use]
    pub fn lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }
}

/// How a load treats deleted and mistyped session hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadType {
    name: &'static str,
    allow_nulls: bool,
    check_deleted: bool,
}

impl LoadType {
    pub const GET: LoadType = LoadType::new("get", true, true);
    pub const LOAD: LoadType = LoadType::new("load", false, true);
    pub const IMMEDIATE_LOAD: LoadType = LoadType::new("immediate_load", true, false);
    pub const INTERNAL_LOAD_EAGER: LoadType = LoadType::new("internal_load_eager", false, false);
    pub const INTERNAL_LOAD_NULLABLE: LoadType =
        LoadType::new("internal_load_nullable", true, false);

    const fn new(name: &'static str, allow_nulls: bool, check_deleted: bool) -> Self {
        Self {
            name,
            allow_nulls,
            check_deleted,
        }
    }

    pub const fn name(self) -> &'static str {
        self.name
    }

    /// A session hit of another class yields a marker instead of an error.
    pub const fn allow_nulls(self) -> bool {
        self.allow_nulls
    }

    /// A session hit deleted in this session yields a removed marker.
    pub const fn check_deleted(self) -> bool {
        self.check_deleted
    }
}

impl fmt::Display for LoadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Where a load request ended.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(EntityRef),
    NotFound,
    /// Registered, but deleted in this session.
    Removed(EntityRef),
    /// Registered under the key, but not an instance of the requested entity.
    Inconsistent(EntityRef),
}

impl LoadOutcome {
    /// The entity of a successful load.
    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            LoadOutcome::Loaded(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityRef> {
        match self {
            LoadOutcome::Loaded(entity) => Some(entity),
            _ => None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }
}

/// Resolve one request through the session, the second-level cache and the
/// entity's batching loader.
#[tracing::instrument(level = "debug", skip_all, fields(entity = %request.entity_name, id = %request.identifier, load_type = %load_type))]
pub(crate) async fn resolve<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    request: &LoadRequest,
    load_type: LoadType,
) -> Outcome<LoadOutcome, Error> {
    let factory = Arc::clone(&session.factory);
    let persister = Arc::clone(try_result!(
        factory.metamodel().persister(&request.entity_name)
    ));
    if request.identifier.span() != persister.identifier_span() {
        return Outcome::Err(Error::mapping(
            MappingErrorKind::IdentifierShape,
            Some(persister.entity_name()),
            format!(
                "identifier {} has {} value(s), expected {}",
                request.identifier,
                request.identifier.span(),
                persister.identifier_span()
            ),
        ));
    }
    let key = persister.entity_key(request.identifier.clone());
    tracing::debug!(%key, lock = %request.lock_options.lock_mode, "load requested");

    let entry = try_outcome!(
        load_from_session_cache(cx, session, &persister, &key, request.lock_options, load_type)
            .await
    );
    match (entry.status, entry.entity) {
        (LookupStatus::RemovedEntityMarker, Some(entity)) => {
            return Outcome::Ok(LoadOutcome::Removed(entity));
        }
        (LookupStatus::InconsistentReturnClass, Some(entity)) => {
            return Outcome::Ok(LoadOutcome::Inconsistent(entity));
        }
        (LookupStatus::Managed, Some(entity)) => {
            let found = entity.entity_name();
            if !persister.is_instance(&found) {
                tracing::warn!(%key, %found, "session holds an instance of another class");
                return Outcome::Err(Error::integrity(
                    IntegrityErrorKind::WrongClass,
                    persister.entity_name(),
                    Some(key.identifier().to_string()),
                    format!("object with the given identifier is of class {found}"),
                ));
            }
            return Outcome::Ok(LoadOutcome::Loaded(entity));
        }
        _ => {}
    }

    if let Some(entity) = try_result!(load_from_second_level_cache(
        session, &persister, &key, request
    )) {
        return Outcome::Ok(LoadOutcome::Loaded(entity));
    }

    let dialect = session.connection.dialect();
    let loader = try_result!(factory.loaders().batching_loader(
        &factory,
        &persister,
        dialect,
        request.lock_options,
        &session.influencers,
    ));
    match try_outcome!(loader.load(cx, session, &persister, request).await) {
        Some(entity) => Outcome::Ok(LoadOutcome::Loaded(entity)),
        None => {
            tracing::debug!(%key, "no row found");
            Outcome::Ok(LoadOutcome::NotFound)
        }
    }
}

/// Load the single `entity_name` row whose `property` columns equal `value`.
#[tracing::instrument(level = "debug", skip_all, fields(entity = entity_name, property = property))]
pub(crate) async fn resolve_unique_key<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    entity_name: &str,
    property: &str,
    value: Identifier,
) -> Outcome<Option<EntityRef>, Error> {
    let factory = Arc::clone(&session.factory);
    let persister = Arc::clone(try_result!(factory.metamodel().persister(entity_name)));
    let dialect = session.connection.dialect();
    let loader = try_result!(factory.loaders().unique_key_loader(
        &factory,
        &persister,
        property,
        dialect,
        &session.influencers,
    ));
    tracing::debug!(%value, "unique key load");
    loader
        .load(cx, session, &persister, QueryParameters::new(vec![value]))
        .await
}

/// Run every load queued during assembly, including loads queued by those
/// loads, until the queue is empty. The queue is cleared on failure.
pub(crate) async fn drain_pending<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
) -> Outcome<(), Error> {
    let outcome = drain(cx, session).await;
    if !matches!(outcome, Outcome::Ok(())) {
        session.context.clear_pending();
    }
    outcome
}

async fn drain<C: Connection>(cx: &Cx, session: &mut Session<C>) -> Outcome<(), Error> {
    while let Some(pending) = session.context.pop_pending() {
        match pending {
            PendingLoad::Entity {
                entity_name,
                identifier,
            } => {
                let factory = Arc::clone(&session.factory);
                let persister = try_result!(factory.metamodel().persister(&entity_name));
                let key = persister.entity_key(identifier.clone());
                if session
                    .context
                    .get_entity(&key)
                    .is_some_and(EntityRef::is_initialized)
                {
                    continue;
                }
                let request = LoadRequest::new(entity_name, identifier);
                let outcome = try_outcome!(
                    resolve(cx, session, &request, LoadType::INTERNAL_LOAD_NULLABLE).await
                );
                if !outcome.is_loaded() {
                    tracing::debug!(%key, "eager reference has no row");
                }
            }
            PendingLoad::Property {
                owner,
                path,
                entity_name,
                restriction,
            } => {
                let target = match restriction {
                    DeferredRestriction::Identifier(id) => {
                        let request = LoadRequest::new(entity_name, id);
                        try_outcome!(
                            resolve(cx, session, &request, LoadType::INTERNAL_LOAD_NULLABLE).await
                        )
                        .into_entity()
                    }
                    DeferredRestriction::UniqueKey { property, value } => try_outcome!(
                        resolve_unique_key(cx, session, &entity_name, &property, value).await
                    ),
                };
                set_property_at(&mut owner.write(), &path, PropertyValue::ToOne(target));
            }
        }
    }
    Outcome::Ok(())
}
