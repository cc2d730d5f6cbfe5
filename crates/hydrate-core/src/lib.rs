//! Core types for Hydrate.
//!
//! This crate provides the vocabulary shared by the query builder and the
//! session:
//!
//! - `Value`, `Row` and `Identifier`/`EntityKey` for data and identity
//! - `EntityPersister` and `Metamodel` for runtime mapping metadata
//! - `Entity`/`EntityRef` for dynamic, shareable instances
//! - `Connection` and `Dialect` for talking to the database
//! - second-level cache entries, statistics and the error type
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome};

pub mod cache;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod fetch;
pub mod identifier;
pub mod lock;
pub mod metamodel;
pub mod persister;
pub mod row;
pub mod statistics;
pub mod value;

pub use cache::{
    CacheEntry, CacheKey, CacheMode, CachedValue, EntityDataAccess, InMemoryEntityRegion,
    StructuredCacheEntry,
};
pub use connection::{Connection, PreparedStatement};
pub use dialect::{BatchLoadSizingStrategy, Dialect};
pub use entity::{CollectionValue, Entity, EntityRef, PropertyValue};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, IntegrityError, IntegrityErrorKind,
    MappingError, MappingErrorKind, QueryError, QueryErrorKind, Result, TypeError,
};
pub use fetch::{
    CascadeStyle, CascadingAction, Fetch, FetchMode, FetchProfile, FetchStyle,
    InternalFetchProfile, LoadQueryInfluencers,
};
pub use identifier::{EntityKey, Identifier, batch_info_string};
pub use lock::{LockMode, LockOptions, LockTimeout};
pub use metamodel::{Metamodel, MetamodelBuilder};
pub use persister::{
    CacheSettings, CollectionElement, CollectionMapping, Discriminator, EntityPersister,
    EntityPersisterBuilder, FilterMapping, ForeignKeyDirection, IdComponent, IdentifierType,
    PropertyKind, PropertyMapping, ToOneKind, ToOneMapping,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use statistics::{RegionStatistics, Statistics, StatisticsSnapshot};
pub use value::Value;
