//! Factory-wide configuration and shared state.
//!
//! A [`SessionFactory`] owns everything sessions share: the metamodel,
//! settings, statistics, second-level cache regions and the registry of
//! loaders built so far. It is immutable apart from those internally
//! synchronized caches and is handed out as `Arc<SessionFactory>`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use hydrate_core::{
    Connection, Dialect, EntityDataAccess, EntityPersister, Error, InMemoryEntityRegion,
    LoadQueryInfluencers, LockOptions, Metamodel, Result, Statistics,
};
use hydrate_query::{BatchSize, JoinWalker, JoinWalkerConfig, LoadTemplate};
use serde::{Deserialize, Serialize};

use crate::registry::LoaderRegistry;
use crate::{Session, SessionConfig};

// ============================================================================
// Settings
// ============================================================================

/// Which batching loader entities with a batch size above 1 get.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFetchStyle {
    /// Pre-built sizes; issue the largest whose last slot is filled.
    #[default]
    Legacy,
    /// Pre-built sizes; pad the smallest size that fits with the requested id.
    Padded,
    /// One statement sized to the exact number of queued ids.
    Dynamic,
}

impl BatchFetchStyle {
    pub const fn as_str(self) -> &'static str {
        match self {
            BatchFetchStyle::Legacy => "legacy",
            BatchFetchStyle::Padded => "padded",
            BatchFetchStyle::Dynamic => "dynamic",
        }
    }
}

impl fmt::Display for BatchFetchStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchFetchStyle {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(BatchFetchStyle::Legacy),
            "padded" => Ok(BatchFetchStyle::Padded),
            "dynamic" => Ok(BatchFetchStyle::Dynamic),
            other => Err(Error::config(format!(
                "unknown batch fetch style {other:?}, expected legacy, padded or dynamic"
            ))),
        }
    }
}

/// Property keys understood by [`Settings::from_properties`].
pub mod keys {
    pub const BATCH_FETCH_STYLE: &str = "hydrate.batch_fetch_style";
    pub const DEFAULT_BATCH_FETCH_SIZE: &str = "hydrate.default_batch_fetch_size";
    pub const MAX_FETCH_DEPTH: &str = "hydrate.max_fetch_depth";
    pub const MAX_JOINED_COLLECTIONS: &str = "hydrate.max_joined_collections";
    pub const USE_SECOND_LEVEL_CACHE: &str = "hydrate.cache.use_second_level_cache";
    pub const GENERATE_STATISTICS: &str = "hydrate.generate_statistics";
    pub const STATEMENT_CACHE_SIZE: &str = "hydrate.statement_cache_size";
}

/// Factory-wide loading settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub batch_fetch_style: BatchFetchStyle,
    /// Batch size for entities that do not declare one.
    pub default_batch_fetch_size: usize,
    /// Associations at this depth or deeper are never joined; `None` is unlimited.
    pub max_fetch_depth: Option<usize>,
    pub max_joined_collections: usize,
    pub use_second_level_cache: bool,
    pub generate_statistics: bool,
    /// Expanded statements kept per dynamic loader.
    pub statement_cache_size: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            batch_fetch_style: BatchFetchStyle::Legacy,
            default_batch_fetch_size: 1,
            max_fetch_depth: None,
            max_joined_collections: 1,
            use_second_level_cache: true,
            generate_statistics: false,
            statement_cache_size: 64,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn batch_fetch_style(mut self, style: BatchFetchStyle) -> Self {
        self.batch_fetch_style = style;
        self
    }

    #[must_use]
    pub fn default_batch_fetch_size(mut self, size: usize) -> Self {
        self.default_batch_fetch_size = size;
        self
    }

    #[must_use]
    pub fn max_fetch_depth(mut self, depth: Option<usize>) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    #[must_use]
    pub fn max_joined_collections(mut self, count: usize) -> Self {
        self.max_joined_collections = count;
        self
    }

    #[must_use]
    pub fn use_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    #[must_use]
    pub fn generate_statistics(mut self, enabled: bool) -> Self {
        self.generate_statistics = enabled;
        self
    }

    #[must_use]
    pub fn statement_cache_size(mut self, size: usize) -> Self {
        self.statement_cache_size = size;
        self
    }

    /// Parse settings from `hydrate.*` string properties.
    ///
    /// Unknown keys are ignored; malformed values fail with `Error::Config`.
    /// A max fetch depth of `0` or `none` means unlimited.
    pub fn from_properties<'a, I>(properties: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut settings = Settings::default();
        for (key, value) in properties {
            match key {
                keys::BATCH_FETCH_STYLE => settings.batch_fetch_style = value.parse()?,
                keys::DEFAULT_BATCH_FETCH_SIZE => {
                    let size: usize = parse_value(key, value)?;
                    if size == 0 {
                        return Err(Error::config(format!("{key} must be at least 1")));
                    }
                    settings.default_batch_fetch_size = size;
                }
                keys::MAX_FETCH_DEPTH => {
                    settings.max_fetch_depth = if value.trim().eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(parse_value::<usize>(key, value)?).filter(|d| *d > 0)
                    };
                }
                keys::MAX_JOINED_COLLECTIONS => {
                    settings.max_joined_collections = parse_value(key, value)?;
                }
                keys::USE_SECOND_LEVEL_CACHE => {
                    settings.use_second_level_cache = parse_value(key, value)?;
                }
                keys::GENERATE_STATISTICS => {
                    settings.generate_statistics = parse_value(key, value)?;
                }
                keys::STATEMENT_CACHE_SIZE => {
                    settings.statement_cache_size = parse_value(key, value)?;
                }
                _ => tracing::trace!(key, "ignoring unknown property"),
            }
        }
        Ok(settings)
    }

    /// Parse settings from a JSON object with the field names of this
    /// struct; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(json).map_err(|e| {
            Error::Config(hydrate_core::ConfigError {
                message: "invalid settings document".to_string(),
                source: Some(Box::new(e)),
            })
        })?;
        if settings.default_batch_fetch_size == 0 {
            return Err(Error::config(format!(
                "{} must be at least 1",
                keys::DEFAULT_BATCH_FETCH_SIZE
            )));
        }
        Ok(settings)
    }

    /// Batch size used for `persister`: its own when it declares one above
    /// 1, otherwise the default.
    pub fn batch_size_for(&self, persister: &EntityPersister) -> usize {
        if persister.batch_size() > 1 {
            persister.batch_size()
        } else {
            self.default_batch_fetch_size.max(1)
        }
    }

    pub fn join_walker_config(&self) -> JoinWalkerConfig {
        JoinWalkerConfig {
            max_fetch_depth: self.max_fetch_depth,
            max_joined_collections: self.max_joined_collections,
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().map_err(|e: T::Err| {
        Error::Config(hydrate_core::ConfigError {
            message: format!("invalid value {value:?} for {key}"),
            source: Some(Box::new(e)),
        })
    })
}

// ============================================================================
// Session Factory
// ============================================================================

/// Shared, thread-safe state behind every session.
pub struct SessionFactory {
    metamodel: Arc<Metamodel>,
    settings: Settings,
    statistics: Statistics,
    regions: HashMap<String, Arc<dyn EntityDataAccess>>,
    loaders: LoaderRegistry,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.metamodel.persisters().count())
            .field("settings", &self.settings)
            .field("regions", &self.regions.keys().collect::<Vec<_>>())
            .field("loaders", &self.loaders.len())
            .finish()
    }
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel,
            settings: Settings::default(),
            regions: Vec::new(),
        }
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.metamodel
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    /// Open a session over `connection` with default session settings.
    pub fn open_session<C: Connection>(self: &Arc<Self>, connection: C) -> Session<C> {
        Session::new(Arc::clone(self), connection, SessionConfig::default())
    }

    pub fn open_session_with<C: Connection>(
        self: &Arc<Self>,
        connection: C,
        config: SessionConfig,
    ) -> Session<C> {
        Session::new(Arc::clone(self), connection, config)
    }

    /// Region access for `persister`, when it is cached and caching is on.
    pub fn cache_access(&self, persister: &EntityPersister) -> Option<&Arc<dyn EntityDataAccess>> {
        if !self.settings.use_second_level_cache {
            return None;
        }
        persister
            .cache()
            .and_then(|cache| self.regions.get(&cache.region))
    }

    pub fn region(&self, name: &str) -> Option<&Arc<dyn EntityDataAccess>> {
        self.regions.get(name)
    }

    /// Walk `persister` and render a template with the factory's limits.
    pub(crate) fn build_template(
        &self,
        persister: &EntityPersister,
        restriction_columns: &[String],
        batch_size: BatchSize,
        dialect: Dialect,
        lock_options: LockOptions,
        influencers: &LoadQueryInfluencers,
    ) -> Result<LoadTemplate> {
        JoinWalker::new(
            &self.metamodel,
            dialect,
            self.settings.join_walker_config(),
            influencers,
        )
        .build(persister, restriction_columns, batch_size, lock_options)
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    settings: Settings,
    regions: Vec<Arc<dyn EntityDataAccess>>,
}

impl SessionFactoryBuilder {
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Supply the access object for a cache region (builder pattern).
    ///
    /// Regions named by persisters but not supplied get an in-memory region.
    #[must_use]
    pub fn region(mut self, access: Arc<dyn EntityDataAccess>) -> Self {
        self.regions.push(access);
        self
    }

    #[tracing::instrument(level = "debug", skip(self), fields(style = %self.settings.batch_fetch_style))]
    pub fn build(self) -> Result<Arc<SessionFactory>> {
        if self.settings.statement_cache_size == 0 {
            return Err(Error::config("statement cache size must be at least 1"));
        }
        let mut regions: HashMap<String, Arc<dyn EntityDataAccess>> = HashMap::new();
        for access in self.regions {
            regions.insert(access.region_name().to_string(), access);
        }
        if self.settings.use_second_level_cache {
            for persister in self.metamodel.persisters() {
                if let Some(cache) = persister.cache() {
                    regions.entry(cache.region.clone()).or_insert_with(|| {
                        Arc::new(InMemoryEntityRegion::new(cache.region.clone()))
                    });
                }
            }
        }
        tracing::debug!(regions = regions.len(), "building session factory");
        Ok(Arc::new(SessionFactory {
            metamodel: Arc::new(self.metamodel),
            statistics: Statistics::new(self.settings.generate_statistics),
            settings: self.settings,
            regions,
            loaders: LoaderRegistry::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_from_properties() {
        let settings = Settings::from_properties([
            (keys::BATCH_FETCH_STYLE, "Padded"),
            (keys::DEFAULT_BATCH_FETCH_SIZE, "16"),
            (keys::MAX_FETCH_DEPTH, "3"),
            (keys::MAX_JOINED_COLLECTIONS, "2"),
            (keys::USE_SECOND_LEVEL_CACHE, "false"),
            (keys::GENERATE_STATISTICS, "true"),
            ("hydrate.unknown", "x"),
        ])
        .unwrap();
        assert_eq!(settings.batch_fetch_style, BatchFetchStyle::Padded);
        assert_eq!(settings.default_batch_fetch_size, 16);
        assert_eq!(settings.max_fetch_depth, Some(3));
        assert_eq!(settings.max_joined_collections, 2);
        assert!(!settings.use_second_level_cache);
        assert!(settings.generate_statistics);

        let unlimited = Settings::from_properties([(keys::MAX_FETCH_DEPTH, "0")]).unwrap();
        assert_eq!(unlimited.max_fetch_depth, None);
    }

    #[test]
    fn bad_property_values_fail() {
        for (key, value) in [
            (keys::BATCH_FETCH_STYLE, "eager"),
            (keys::DEFAULT_BATCH_FETCH_SIZE, "0"),
            (keys::DEFAULT_BATCH_FETCH_SIZE, "ten"),
            (keys::GENERATE_STATISTICS, "yes"),
        ] {
            let err = Settings::from_properties([(key, value)]).unwrap_err();
            assert!(matches!(err, Error::Config(_)), "{key}={value}");
        }
    }

    #[test]
    fn settings_load_from_json() {
        let settings =
            Settings::from_json(r#"{"batch_fetch_style": "dynamic", "default_batch_fetch_size": 25}"#)
                .unwrap();
        assert_eq!(settings.batch_fetch_style, BatchFetchStyle::Dynamic);
        assert_eq!(settings.default_batch_fetch_size, 25);
        assert_eq!(settings.statement_cache_size, 64);

        assert!(matches!(
            Settings::from_json(r#"{"batch_fetch_style": "eager"}"#),
            Err(Error::Config(_))
        ));
        assert!(Settings::from_json(r#"{"default_batch_fetch_size": 0}"#).is_err());
    }

    #[test]
    fn entity_batch_size_overrides_default() {
        let settings = Settings::new().default_batch_fetch_size(8);
        let plain = EntityPersister::builder("Person", "people").build();
        let batched = EntityPersister::builder("Team", "teams").batch_size(25).build();
        assert_eq!(settings.batch_size_for(&plain), 8);
        assert_eq!(settings.batch_size_for(&batched), 25);
    }

    #[test]
    fn cached_entities_get_default_regions() {
        let metamodel = Metamodel::builder()
            .entity(EntityPersister::builder("Person", "people").cache_region("people"))
            .build()
            .unwrap();
        let factory = SessionFactory::builder(metamodel).build().unwrap();
        let person = factory.metamodel().persister("Person").unwrap();
        assert_eq!(
            factory.cache_access(person).map(|r| r.region_name().to_string()),
            Some("people".to_string())
        );

        let metamodel = Metamodel::builder()
            .entity(EntityPersister::builder("Person", "people").cache_region("people"))
            .build()
            .unwrap();
        let factory = SessionFactory::builder(metamodel)
            .settings(Settings::new().use_second_level_cache(false))
            .build()
            .unwrap();
        let person = factory.metamodel().persister("Person").unwrap();
        assert!(factory.cache_access(person).is_none());
    }
}
