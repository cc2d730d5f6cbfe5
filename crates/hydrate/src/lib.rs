//! Hydrate - an entity loading engine.
//!
//! Hydrate turns "load the entity with this identifier" into as few SQL
//! statements as possible while preserving one in-memory instance per row:
//!
//! - Join-fetch planning that walks the association graph once per entity
//!   and renders a reusable load template
//! - Batch fetching of queued references with padded, dynamic or legacy
//!   loaders
//! - A persistence context and a second-level cache consulted before SQL
//! - Cancel-correct async execution on asupersync
//!
//! # Quick Start
//!
//! ```ignore
//! use hydrate::prelude::*;
//!
//! let metamodel = Metamodel::builder()
//!     .entity(
//!         EntityPersister::builder("Person", "people")
//!             .property(PropertyMapping::basic("name", "name"))
//!             .property(PropertyMapping::many_to_one("team", "Team", &["team_id"]))
//!             .batch_size(10),
//!     )
//!     .entity(EntityPersister::builder("Team", "teams").batch_size(10))
//!     .build()?;
//!
//! let factory = SessionFactory::builder(metamodel)
//!     .settings(Settings::new().batch_fetch_style(BatchFetchStyle::Dynamic))
//!     .build()?;
//!
//! let mut session = factory.open_session(connection);
//! let person = session.load(&cx, "Person", 42_i64).await?;
//! ```

pub use hydrate_core::{
    // asupersync re-exports
    Budget,
    // Core types
    CacheEntry,
    CacheMode,
    Connection,
    Cx,
    Dialect,
    Entity,
    EntityDataAccess,
    EntityKey,
    EntityPersister,
    EntityRef,
    Error,
    FetchMode,
    FetchProfile,
    Identifier,
    InMemoryEntityRegion,
    IntegrityErrorKind,
    LoadQueryInfluencers,
    LockMode,
    LockOptions,
    LockTimeout,
    MappingErrorKind,
    Metamodel,
    Outcome,
    PreparedStatement,
    PropertyMapping,
    PropertyValue,
    QueryErrorKind,
    Result,
    Row,
    Statistics,
    StatisticsSnapshot,
    Value,
};
pub use hydrate_query::{BatchSize, JoinWalker, JoinWalkerConfig, LoadTemplate, StatementCache};
pub use hydrate_session::{
    BatchFetchStyle, BatchingEntityLoader, EntityStatus, LoadOutcome, LoadRequest, LoadType,
    LookupStatus, MultiLoadOptions, Session, SessionConfig, SessionFactory, SessionFactoryBuilder,
    Settings,
};

/// Sub-crates, for items not re-exported at the top level.
pub use hydrate_core as core;
pub use hydrate_query as query;
pub use hydrate_session as session;

pub mod prelude {
    pub use crate::{
        // Mapping
        BatchFetchStyle,
        // Core traits and types
        CacheMode,
        Connection,
        Cx,
        EntityPersister,
        EntityRef,
        Error,
        Identifier,
        LockMode,
        LockOptions,
        Metamodel,
        MultiLoadOptions,
        Outcome,
        PropertyMapping,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        Settings,
        Value,
    };
}
