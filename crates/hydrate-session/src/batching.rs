//! Batching entity loaders.
//!
//! Each variant answers `load(id)` but may fetch other queued keys of the
//! same entity in the same statement:
//!
//! - `Padded` keeps one loader per pre-built size and pads the smallest
//!   size that fits with the requested id
//! - `Dynamic` renders a statement for exactly the number of live keys
//! - `Legacy` issues the largest pre-built size whose last slot is filled
//! - `None` only ever loads the requested key

use std::sync::Arc;

use hydrate_core::{
    Connection, Cx, Dialect, EntityPersister, EntityRef, Error, Identifier, LoadQueryInfluencers,
    LockOptions, Outcome, Result,
};
use hydrate_query::BatchSize;

use crate::Session;
use crate::batch_size::{generate_batch_sizes, validate_batch_sizes};
use crate::entity_loader::{EntityLoader, QueryParameters};
use crate::factory::{BatchFetchStyle, SessionFactory};
use crate::loader::LoadRequest;

/// Pre-built loaders for a strictly decreasing sequence of batch sizes.
#[derive(Debug)]
pub struct SizedLoaders {
    sizes: Vec<usize>,
    loaders: Vec<EntityLoader>,
}

impl SizedLoaders {
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    fn max_batch_size(&self) -> usize {
        self.sizes[0]
    }

    /// The size-1 loader at the end of the sequence.
    fn single(&self) -> &EntityLoader {
        &self.loaders[self.loaders.len() - 1]
    }
}

#[derive(Debug)]
pub struct DynamicLoader {
    max_batch_size: usize,
    single: EntityLoader,
    dynamic: EntityLoader,
}

impl DynamicLoader {
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Loader whose restriction is expanded to the key count per call.
    pub fn dynamic(&self) -> &EntityLoader {
        &self.dynamic
    }
}

/// What one `build` call needs to render templates.
pub struct LoaderSpec<'a> {
    pub factory: &'a SessionFactory,
    pub persister: &'a EntityPersister,
    pub dialect: Dialect,
    pub lock_options: LockOptions,
    pub influencers: &'a LoadQueryInfluencers,
}

impl LoaderSpec<'_> {
    fn loader(&self, batch_size: BatchSize) -> Result<EntityLoader> {
        let restriction: Vec<String> = self
            .persister
            .identifier_columns()
            .into_iter()
            .map(str::to_string)
            .collect();
        let template = self.factory.build_template(
            self.persister,
            &restriction,
            batch_size,
            self.dialect,
            self.lock_options,
            self.influencers,
        )?;
        Ok(EntityLoader::new(
            template,
            self.factory.settings().statement_cache_size,
        ))
    }

    fn sized(&self, max_batch_size: usize) -> Result<SizedLoaders> {
        let sizes = generate_batch_sizes(max_batch_size);
        validate_batch_sizes(self.persister.entity_name(), max_batch_size, &sizes)?;
        let loaders = sizes
            .iter()
            .map(|&size| self.loader(BatchSize::Fixed(size)))
            .collect::<Result<Vec<_>>>()?;
        Ok(SizedLoaders { sizes, loaders })
    }
}

/// Loader for one entity, chosen by the factory's batch fetch style.
#[derive(Debug)]
pub enum BatchingEntityLoader {
    None(EntityLoader),
    Padded(SizedLoaders),
    Dynamic(DynamicLoader),
    Legacy(SizedLoaders),
}

impl BatchingEntityLoader {
    /// Build the loader family for `spec.persister`.
    ///
    /// Entities with an effective batch size of 1 always get `None`.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %spec.persister.entity_name(), ?style))]
    pub fn build(style: BatchFetchStyle, spec: &LoaderSpec<'_>) -> Result<Self> {
        let max_batch_size = spec.factory.settings().batch_size_for(spec.persister);
        if max_batch_size <= 1 {
            return Ok(BatchingEntityLoader::None(spec.loader(BatchSize::Fixed(1))?));
        }
        Ok(match style {
            BatchFetchStyle::Padded => BatchingEntityLoader::Padded(spec.sized(max_batch_size)?),
            BatchFetchStyle::Legacy => BatchingEntityLoader::Legacy(spec.sized(max_batch_size)?),
            BatchFetchStyle::Dynamic => BatchingEntityLoader::Dynamic(DynamicLoader {
                max_batch_size,
                single: spec.loader(BatchSize::Fixed(1))?,
                dynamic: spec.loader(BatchSize::Dynamic)?,
            }),
        })
    }

    /// Build from an explicit size sequence instead of the generated one.
    pub fn padded_with_sizes(spec: &LoaderSpec<'_>, sizes: Vec<usize>) -> Result<Self> {
        let max_batch_size = spec.factory.settings().batch_size_for(spec.persister);
        validate_batch_sizes(spec.persister.entity_name(), max_batch_size, &sizes)?;
        let loaders = sizes
            .iter()
            .map(|&size| spec.loader(BatchSize::Fixed(size)))
            .collect::<Result<Vec<_>>>()?;
        Ok(BatchingEntityLoader::Padded(SizedLoaders { sizes, loaders }))
    }

    pub fn style(&self) -> Option<BatchFetchStyle> {
        match self {
            BatchingEntityLoader::None(_) => None,
            BatchingEntityLoader::Padded(_) => Some(BatchFetchStyle::Padded),
            BatchingEntityLoader::Dynamic(_) => Some(BatchFetchStyle::Dynamic),
            BatchingEntityLoader::Legacy(_) => Some(BatchFetchStyle::Legacy),
        }
    }

    /// Load `request.identifier`, together with queued siblings when the
    /// variant batches.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = %persister.entity_name(), id = %request.identifier))]
    pub async fn load<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &EntityPersister,
        request: &LoadRequest,
    ) -> Outcome<Option<EntityRef>, Error> {
        match self {
            BatchingEntityLoader::None(single) => {
                single
                    .load(cx, session, persister, parameters(request, vec![request.identifier.clone()]))
                    .await
            }
            BatchingEntityLoader::Padded(sized) => {
                let live = queued_batch(session, persister, &request.identifier, sized.max_batch_size());
                if live.len() <= 1 {
                    return load_single(cx, session, sized.single(), persister, request).await;
                }
                // Smallest pre-built size that holds every live key.
                let index = sized
                    .sizes
                    .iter()
                    .rposition(|&size| size >= live.len())
                    .unwrap_or(0);
                let size = sized.sizes[index];
                let mut ids = live.clone();
                ids.resize(size, request.identifier.clone());
                tracing::debug!(size, live = live.len(), padding = size - live.len(), "padded batch");
                let results = try_outcome!(
                    sized.loaders[index]
                        .load_batch(cx, session, persister, parameters(request, ids))
                        .await
                );
                forget_missing(session, persister, &live, &results);
                Outcome::Ok(get_object_from_list(&results, &request.identifier, persister))
            }
            BatchingEntityLoader::Dynamic(dynamic) => {
                let cap = session
                    .connection
                    .dialect()
                    .batch_load_sizing_strategy()
                    .determine_optimal_batch_load_size(persister.identifier_span(), dynamic.max_batch_size);
                let live = queued_batch(session, persister, &request.identifier, cap);
                if live.len() <= 1 {
                    return load_single(cx, session, &dynamic.single, persister, request).await;
                }
                tracing::debug!(size = live.len(), "dynamic batch");
                let results = try_outcome!(
                    dynamic
                        .dynamic
                        .load_batch(cx, session, persister, parameters(request, live.clone()))
                        .await
                );
                forget_missing(session, persister, &live, &results);
                Outcome::Ok(get_object_from_list(&results, &request.identifier, persister))
            }
            BatchingEntityLoader::Legacy(sized) => {
                let batch = session.context.batch_fetch_queue().entity_batch(
                    persister,
                    &request.identifier,
                    sized.max_batch_size(),
                    |key| is_cached(session, persister, key.identifier()),
                );
                let last = sized.sizes.len() - 1;
                for (index, &size) in sized.sizes[..last].iter().enumerate() {
                    if batch.get(size - 1).is_some_and(Option::is_some) {
                        let ids: Vec<Identifier> = batch[..size].iter().flatten().cloned().collect();
                        tracing::debug!(size, "legacy batch");
                        let results = try_outcome!(
                            sized.loaders[index]
                                .load_batch(cx, session, persister, parameters(request, ids))
                                .await
                        );
                        return Outcome::Ok(get_object_from_list(
                            &results,
                            &request.identifier,
                            persister,
                        ));
                    }
                }
                sized
                    .single()
                    .load(cx, session, persister, parameters(request, vec![request.identifier.clone()]))
                    .await
            }
        }
    }
}

/// The result whose identifier equals `id` under the entity's identifier
/// equality.
pub fn get_object_from_list(
    results: &[EntityRef],
    id: &Identifier,
    persister: &EntityPersister,
) -> Option<EntityRef> {
    results
        .iter()
        .find(|e| persister.identifier_type().is_equal(e.identifier(), id))
        .cloned()
}

fn parameters(request: &LoadRequest, ids: Vec<Identifier>) -> QueryParameters {
    QueryParameters::new(ids)
        .optional_object(
            request.instance_to_load.clone(),
            request
                .instance_to_load
                .as_ref()
                .map(|_| request.identifier.clone()),
        )
        .lock_options(request.lock_options)
        .read_only(request.read_only)
}

/// Single-key load that drops the key from the batch queue when no row
/// exists.
async fn load_single<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    loader: &EntityLoader,
    persister: &EntityPersister,
    request: &LoadRequest,
) -> Outcome<Option<EntityRef>, Error> {
    let found = try_outcome!(
        loader
            .load(cx, session, persister, parameters(request, vec![request.identifier.clone()]))
            .await
    );
    if found.is_none() {
        let key = persister.entity_key(request.identifier.clone());
        session
            .context
            .batch_fetch_queue_mut()
            .remove_batch_loadable_entity_key(&key);
    }
    Outcome::Ok(found)
}

/// Live keys of the batch for `id`, requested id first.
fn queued_batch<C: Connection>(
    session: &Session<C>,
    persister: &EntityPersister,
    id: &Identifier,
    size: usize,
) -> Vec<Identifier> {
    session
        .context
        .batch_fetch_queue()
        .entity_batch(persister, id, size, |key| {
            is_cached(session, persister, key.identifier())
        })
        .into_iter()
        .flatten()
        .collect()
}

/// Is `id` present in the entity's cache region (when the session reads it)?
fn is_cached<C: Connection>(session: &Session<C>, persister: &EntityPersister, id: &Identifier) -> bool {
    if !session.config.cache_mode.is_get_enabled() {
        return false;
    }
    session.factory.cache_access(persister).is_some_and(|access| {
        access.contains(&access.generate_cache_key(id, persister, session.config.tenant.as_deref()))
    })
}

/// Drop keys the batch asked for but the database did not return.
fn forget_missing<C: Connection>(
    session: &mut Session<C>,
    persister: &EntityPersister,
    requested: &[Identifier],
    results: &[EntityRef],
) {
    for id in requested {
        if get_object_from_list(results, id, persister).is_none() {
            let key = persister.entity_key(id.clone());
            if session
                .context
                .batch_fetch_queue_mut()
                .remove_batch_loadable_entity_key(&key)
            {
                tracing::debug!(%key, "batch key not found");
            }
        }
    }
}

/// Shared handle stored by the loader registry.
pub(crate) type SharedBatchingLoader = Arc<BatchingEntityLoader>;
