//! Sessions and entity loaders for Hydrate.
//!
//! `hydrate-session` is the **loading layer**. A [`Session`] answers
//! "give me the entity with this identifier" by consulting, in order, its
//! persistence context, the second-level cache and the database, where the
//! entity's batching loader may fetch other queued keys in the same
//! statement.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one instance per entity key, with status, lock
//!   mode and version.
//! - **Batch fetching**: uninitialized references are queued and loaded
//!   together by `Padded`, `Dynamic` or `Legacy` loaders.
//! - **Second-level cache**: structured or reference entries per region.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel).build()?;
//! let mut session = factory.open_session(connection);
//!
//! // Identity: the second call issues no SQL.
//! let person = session.get(&cx, "Person", 42_i64).await?;
//! let again = session.get(&cx, "Person", 42_i64).await?;
//! ```

/// Unwrap an `Outcome`, returning early on anything but `Ok`.
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            Outcome::Ok(value) => value,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}

/// Unwrap a `Result` inside a function returning `Outcome`.
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(value) => value,
            Err(e) => return Outcome::Err(e),
        }
    };
}

mod assembler;
pub mod batch_fetch_queue;
pub mod batch_size;
pub mod batching;
pub mod cache_lookup;
pub mod entity_loader;
mod exec;
pub mod factory;
pub mod loader;
pub mod multi_load;
pub mod persistence_context;
pub mod registry;

#[cfg(test)]
mod test_support;

pub use batch_fetch_queue::BatchFetchQueue;
pub use batch_size::{generate_batch_sizes, validate_batch_sizes};
pub use batching::{BatchingEntityLoader, DynamicLoader, LoaderSpec, SizedLoaders, get_object_from_list};
pub use cache_lookup::{
    LookupStatus, PersistenceContextEntry, load_from_second_level_cache, load_from_session_cache,
};
pub use entity_loader::{EntityLoader, QueryParameters};
pub use factory::{BatchFetchStyle, SessionFactory, SessionFactoryBuilder, Settings};
pub use loader::{LoadOutcome, LoadRequest, LoadType};
pub use multi_load::MultiLoadOptions;
pub use persistence_context::{EntityEntry, EntityStatus, PersistenceContext};
pub use registry::LoaderRegistry;

use std::sync::Arc;

use hydrate_core::{
    CacheMode, Connection, Cx, EntityRef, Error, Identifier, InternalFetchProfile,
    IntegrityErrorKind, LoadQueryInfluencers, LockMode, LockOptions, MappingErrorKind, Outcome,
    Result,
};

// ============================================================================
// Session Configuration
// ============================================================================

/// Per-session settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub cache_mode: CacheMode,
    /// Whether loaded entities default to read-only.
    pub default_read_only: bool,
    /// Tenant identifier folded into second-level cache keys.
    pub tenant: Option<String>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cache_mode(mut self, mode: CacheMode) -> Self {
        self.cache_mode = mode;
        self
    }

    #[must_use]
    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    #[must_use]
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

// ============================================================================
// Session
// ============================================================================

/// A single-threaded unit of loading work over one connection.
pub struct Session<C: Connection> {
    pub(crate) factory: Arc<SessionFactory>,
    pub(crate) connection: C,
    pub(crate) context: PersistenceContext,
    pub(crate) config: SessionConfig,
    pub(crate) influencers: LoadQueryInfluencers,
}

impl<C: Connection> std::fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.connection.dialect())
            .field("entities", &self.context.len())
            .field("config", &self.config)
            .field("influencers", &self.influencers)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Session<C> {
    pub(crate) fn new(factory: Arc<SessionFactory>, connection: C, config: SessionConfig) -> Self {
        Self {
            factory,
            connection,
            context: PersistenceContext::new(),
            config,
            influencers: LoadQueryInfluencers::new(),
        }
    }

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn influencers(&self) -> &LoadQueryInfluencers {
        &self.influencers
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Get an entity by identifier, `None` when no row exists or the entity
    /// was deleted in this session.
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: impl Into<Identifier>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let request = LoadRequest::new(entity_name, id);
        let outcome = try_outcome!(self.load_outcome(cx, &request, LoadType::GET).await);
        Outcome::Ok(outcome.into_entity())
    }

    /// Load an entity by identifier, failing with `ObjectNotFound` when no
    /// row exists.
    pub async fn load(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: impl Into<Identifier>,
    ) -> Outcome<EntityRef, Error> {
        self.load_with_lock(cx, entity_name, id, LockOptions::NONE)
            .await
    }

    /// Load an entity and hold `lock_options` on its row.
    pub async fn load_with_lock(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        id: impl Into<Identifier>,
        lock_options: LockOptions,
    ) -> Outcome<EntityRef, Error> {
        let request = LoadRequest::new(entity_name, id).lock_options(lock_options);
        let outcome = try_outcome!(self.load_outcome(cx, &request, LoadType::LOAD).await);
        required(&request, outcome)
    }

    /// Populate `instance`, an uninitialized instance carrying its entity
    /// name and identifier.
    pub async fn load_into(&mut self, cx: &Cx, instance: &EntityRef) -> Outcome<(), Error> {
        let request = LoadRequest::new(instance.entity_name(), instance.identifier().clone())
            .instance_to_load(instance.clone());
        let outcome = try_outcome!(self.load_outcome(cx, &request, LoadType::LOAD).await);
        try_outcome!(required(&request, outcome));
        Outcome::Ok(())
    }

    /// Run `request` through the session, cache and database layers and
    /// report where it ended.
    pub async fn load_outcome(
        &mut self,
        cx: &Cx,
        request: &LoadRequest,
        load_type: LoadType,
    ) -> Outcome<LoadOutcome, Error> {
        let outcome = loader::resolve(cx, self, request, load_type).await;
        self.finish(cx, outcome).await
    }

    /// Load the entity whose `property` columns equal `value`.
    pub async fn find_by_natural_key(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        property: &str,
        value: impl Into<Identifier>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let outcome =
            loader::resolve_unique_key(cx, self, entity_name, property, value.into()).await;
        self.finish(cx, outcome).await
    }

    /// Load many identifiers of one entity; see [`MultiLoadOptions`].
    pub async fn multi_load(
        &mut self,
        cx: &Cx,
        entity_name: &str,
        ids: &[Identifier],
        options: &MultiLoadOptions,
    ) -> Outcome<Vec<Option<EntityRef>>, Error> {
        let outcome = multi_load::multi_load(cx, self, entity_name, ids, options).await;
        self.finish(cx, outcome).await
    }

    /// Drain loads queued by the request, or drop them when it failed.
    async fn finish<T>(&mut self, cx: &Cx, outcome: Outcome<T, Error>) -> Outcome<T, Error> {
        match outcome {
            Outcome::Ok(value) => {
                try_outcome!(loader::drain_pending(cx, self).await);
                Outcome::Ok(value)
            }
            other => {
                self.context.clear_pending();
                other
            }
        }
    }

    // ========================================================================
    // Instance state
    // ========================================================================

    /// Raise the lock held on a managed entity.
    pub async fn lock(
        &mut self,
        cx: &Cx,
        entity: &EntityRef,
        lock_options: LockOptions,
    ) -> Outcome<(), Error> {
        let key = try_result!(self.managed_key(entity));
        cache_lookup::upgrade_lock(cx, self, &key, entity, lock_options).await
    }

    /// Detach `entity`; later loads of its key go back to the cache or
    /// database.
    pub fn evict(&mut self, entity: &EntityRef) -> Result<()> {
        let key = self.managed_key(entity)?;
        self.context.remove(&key);
        self.context
            .batch_fetch_queue_mut()
            .remove_batch_loadable_entity_key(&key);
        tracing::debug!(%key, "evicted");
        Ok(())
    }

    /// Mark `entity` deleted in this session without touching the database.
    pub fn delete_local(&mut self, entity: &EntityRef) -> Result<()> {
        let key = self.managed_key(entity)?;
        self.context.set_status(&key, EntityStatus::Deleted);
        Ok(())
    }

    /// Whether this session manages exactly this instance.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.factory
            .metamodel()
            .persister(&entity.entity_name())
            .is_ok_and(|persister| {
                let key = persister.entity_key(entity.identifier().clone());
                self.context.contains_instance(&key, entity)
            })
    }

    /// An uninitialized reference to `entity_name#id`, queued for batch
    /// fetching. Returns the managed instance or existing proxy when there
    /// is one.
    pub fn register_proxy(
        &mut self,
        entity_name: &str,
        id: impl Into<Identifier>,
    ) -> Result<EntityRef> {
        let factory = Arc::clone(&self.factory);
        let persister = factory.metamodel().persister(entity_name)?;
        let key = persister.entity_key(id.into());
        if let Some(entity) = self
            .context
            .get_entity(&key)
            .or_else(|| self.context.get_proxy(&key))
        {
            return Ok(entity.clone());
        }
        let proxy = EntityRef::proxy(persister.entity_name(), key.identifier().clone());
        self.context.add_proxy(key.clone(), proxy.clone());
        if factory.settings().batch_size_for(persister) > 1 {
            self.context
                .batch_fetch_queue_mut()
                .add_batch_loadable_entity_key(persister.entity_name(), key);
        }
        Ok(proxy)
    }

    pub fn entity_status(&self, entity: &EntityRef) -> Option<EntityStatus> {
        let key = self.managed_key(entity).ok()?;
        self.context.entry(&key).map(|e| e.status)
    }

    pub fn lock_mode(&self, entity: &EntityRef) -> Option<LockMode> {
        let key = self.managed_key(entity).ok()?;
        self.context.entry(&key).map(|e| e.lock_mode)
    }

    /// Detach everything.
    pub fn clear(&mut self) {
        self.context.clear();
    }

    fn managed_key(&self, entity: &EntityRef) -> Result<hydrate_core::EntityKey> {
        let persister = self.factory.metamodel().persister(&entity.entity_name())?;
        let key = persister.entity_key(entity.identifier().clone());
        if !self.context.contains_instance(&key, entity) {
            return Err(Error::integrity(
                IntegrityErrorKind::ObjectNotFound,
                persister.entity_name(),
                Some(key.identifier().to_string()),
                "instance is not associated with this session",
            ));
        }
        Ok(key)
    }

    // ========================================================================
    // Fetch and cache control
    // ========================================================================

    pub fn enable_fetch_profile(&mut self, name: &str) -> Result<()> {
        if self.factory.metamodel().fetch_profile(name).is_none() {
            return Err(Error::mapping(
                MappingErrorKind::FetchProfile,
                None,
                format!("unknown fetch profile '{name}'"),
            ));
        }
        self.influencers.enable_fetch_profile(name);
        Ok(())
    }

    pub fn disable_fetch_profile(&mut self, name: &str) {
        self.influencers.disable_fetch_profile(name);
    }

    pub fn enable_filter(&mut self, name: &str) {
        self.influencers.enable_filter(name);
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.influencers.disable_filter(name);
    }

    pub fn set_internal_fetch_profile(&mut self, profile: Option<InternalFetchProfile>) {
        self.influencers.set_internal_fetch_profile(profile);
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) {
        self.config.cache_mode = mode;
    }

    pub fn set_default_read_only(&mut self, value: bool) {
        self.config.default_read_only = value;
    }
}

/// The loaded entity, or `ObjectNotFound`.
fn required(request: &LoadRequest, outcome: LoadOutcome) -> Outcome<EntityRef, Error> {
    match outcome {
        LoadOutcome::Loaded(entity) => Outcome::Ok(entity),
        LoadOutcome::NotFound | LoadOutcome::Removed(_) | LoadOutcome::Inconsistent(_) => {
            Outcome::Err(Error::integrity(
                IntegrityErrorKind::ObjectNotFound,
                request.entity_name.clone(),
                Some(request.identifier.to_string()),
                "no row with the given identifier exists",
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockConnection, factory, person_row};
    use asupersync::runtime::RuntimeBuilder;
    use hydrate_core::{CacheEntry, LockTimeout};

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn identity_is_preserved_within_a_session() {
        let conn = MockConnection::new().with_rows("from people", vec![person_row(42, "Ada")]);
        let mut session = factory(1).open_session(conn.clone());
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let first = unwrap_outcome(session.get(&cx, "Person", 42_i64).await).expect("found");
            let second = unwrap_outcome(session.get(&cx, "Person", 42_i64).await).expect("found");
            assert!(first.same(&second));
            assert!(session.contains(&first));
            assert_eq!(conn.statements().len(), 1);
            assert_eq!(conn.open_statements(), 0);
            assert_eq!(session.entity_status(&first), Some(EntityStatus::Managed));
            assert_eq!(session.lock_mode(&first), Some(LockMode::Read));
        });
    }

    #[test]
    fn missing_rows_differ_between_get_and_load() {
        let conn = MockConnection::new();
        let mut session = factory(1).open_session(conn);
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            assert!(unwrap_outcome(session.get(&cx, "Person", 7_i64).await).is_none());
            let Outcome::Err(err) = session.load(&cx, "Person", 7_i64).await else {
                panic!("expected ObjectNotFound");
            };
            assert_eq!(err.integrity_kind(), Some(IntegrityErrorKind::ObjectNotFound));
        });
    }

    #[test]
    fn locally_deleted_entities_are_removed_markers() {
        let conn = MockConnection::new().with_rows("from people", vec![person_row(1, "Ada")]);
        let mut session = factory(1).open_session(conn.clone());
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let ada = unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
            session.delete_local(&ada).unwrap();

            let outcome = unwrap_outcome(
                session
                    .load_outcome(&cx, &LoadRequest::new("Person", 1_i64), LoadType::GET)
                    .await,
            );
            assert!(matches!(outcome, LoadOutcome::Removed(ref e) if e.same(&ada)));
            assert!(unwrap_outcome(session.get(&cx, "Person", 1_i64).await).is_none());

            // Internal loads do not check deletion.
            let internal = unwrap_outcome(
                session
                    .load_outcome(
                        &cx,
                        &LoadRequest::new("Person", 1_i64),
                        LoadType::INTERNAL_LOAD_NULLABLE,
                    )
                    .await,
            );
            assert!(internal.is_loaded());
            assert_eq!(conn.statements().len(), 1);
        });
    }

    #[test]
    fn evicted_entities_are_reloaded() {
        let conn = MockConnection::new().with_rows("from people", vec![person_row(3, "Grace")]);
        let mut session = factory(1).open_session(conn.clone());
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let grace = unwrap_outcome(session.load(&cx, "Person", 3_i64).await);
            session.evict(&grace).unwrap();
            assert!(!session.contains(&grace));
            assert!(session.evict(&grace).is_err());

            let reloaded = unwrap_outcome(session.load(&cx, "Person", 3_i64).await);
            assert!(!reloaded.same(&grace));
            assert!(reloaded.attributes_equal(&grace));
            assert_eq!(conn.statements().len(), 2);
        });
    }

    #[test]
    fn proxies_are_queued_once() {
        let mut session = factory(10).open_session(MockConnection::new());
        let a = session.register_proxy("Person", 5_i64).unwrap();
        let b = session.register_proxy("Person", 5_i64).unwrap();
        assert!(a.same(&b));
        assert!(!a.is_initialized());
        assert_eq!(
            session
                .persistence_context()
                .batch_fetch_queue()
                .len_for("Person"),
            1
        );
        assert!(session.register_proxy("Nobody", 1_i64).is_err());
    }

    #[test]
    fn pessimistic_lock_upgrades_issue_a_lock_statement() {
        let conn = MockConnection::new()
            .with_rows("from people person0_", vec![person_row(9, "Linus")])
            .with_rows("for update", vec![person_row(9, "Linus")]);
        let mut session = factory(1).open_session(conn.clone());
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let linus = unwrap_outcome(session.load(&cx, "Person", 9_i64).await);
            let options = LockOptions::new(LockMode::PessimisticWrite).timeout(LockTimeout::NoWait);
            unwrap_outcome(session.lock(&cx, &linus, options).await);
            assert_eq!(session.lock_mode(&linus), Some(LockMode::PessimisticWrite));

            // Never downgraded.
            unwrap_outcome(session.lock(&cx, &linus, LockOptions::new(LockMode::Read)).await);
            assert_eq!(session.lock_mode(&linus), Some(LockMode::PessimisticWrite));

            let statements = conn.statements();
            assert_eq!(statements.len(), 2);
            assert!(statements[1].0.ends_with("for update nowait"));
        });
    }

    #[test]
    fn unknown_fetch_profiles_are_rejected() {
        let mut session = factory(1).open_session(MockConnection::new());
        let err = session.enable_fetch_profile("missing").unwrap_err();
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::FetchProfile));
        session.enable_filter("active");
        assert!(session.influencers().is_filter_enabled("active"));
        session.disable_filter("active");
        assert!(!session.influencers().is_filter_enabled("active"));
    }

    #[test]
    fn cache_mode_controls_second_level_reads() {
        let conn = MockConnection::new().with_rows("from people", vec![person_row(4, "Barbara")]);
        let factory = crate::test_support::cached_factory();
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            let mut writer = factory.open_session(conn.clone());
            unwrap_outcome(writer.load(&cx, "Person", 4_i64).await);
            let region = factory.region("people").expect("region");
            let persister = factory.metamodel().persister("Person").unwrap();
            let cached = region
                .get(&region.generate_cache_key(&Identifier::from(4_i64), persister, None))
                .unwrap();
            assert!(matches!(cached, Some(CacheEntry::Structured(_))));

            let mut reader = factory.open_session(conn.clone());
            unwrap_outcome(reader.load(&cx, "Person", 4_i64).await);
            assert_eq!(conn.statements().len(), 1);

            let mut ignoring =
                factory.open_session_with(conn.clone(), SessionConfig::new().cache_mode(CacheMode::Ignore));
            unwrap_outcome(ignoring.load(&cx, "Person", 4_i64).await);
            assert_eq!(conn.statements().len(), 2);
        });
    }
}
