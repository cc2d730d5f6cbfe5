//! Loading many identifiers of one entity at once.

use std::sync::Arc;

use hydrate_core::{
    Connection, Cx, EntityPersister, EntityRef, Error, Identifier, LockOptions, Outcome,
};

use crate::Session;
use crate::cache_lookup::{LookupStatus, load_from_second_level_cache, load_from_session_cache};
use crate::entity_loader::{EntityLoader, QueryParameters};
use crate::loader::{LoadRequest, LoadType};

/// Options for [`Session::multi_load`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultiLoadOptions {
    /// Results line up with the requested identifiers, `None` where missing.
    pub ordered: bool,
    /// Consult the persistence context before issuing SQL.
    pub session_checking: bool,
    pub second_level_cache_checking: bool,
    /// Return entities deleted in this session instead of `None`.
    pub return_deleted: bool,
    /// Keys per statement; the dialect's sizing strategy when `None`.
    pub batch_size: Option<usize>,
    pub lock_options: LockOptions,
}

impl Default for MultiLoadOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            session_checking: false,
            second_level_cache_checking: true,
            return_deleted: false,
            batch_size: None,
            lock_options: LockOptions::NONE,
        }
    }
}

impl MultiLoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ordered(mut self, value: bool) -> Self {
        self.ordered = value;
        self
    }

    #[must_use]
    pub fn session_checking(mut self, value: bool) -> Self {
        self.session_checking = value;
        self
    }

    #[must_use]
    pub fn second_level_cache_checking(mut self, value: bool) -> Self {
        self.second_level_cache_checking = value;
        self
    }

    #[must_use]
    pub fn return_deleted(mut self, value: bool) -> Self {
        self.return_deleted = value;
        self
    }

    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    #[must_use]
    pub fn lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }
}

/// Answer from the in-memory layers for one identifier.
enum Probe {
    Found(Option<EntityRef>),
    Miss,
}

/// Load `ids` of `entity_name`.
///
/// Ordered results have one slot per requested identifier. Unordered results
/// hold only the entities found, in no particular order.
#[tracing::instrument(level = "debug", skip_all, fields(entity = entity_name, ids = ids.len(), ordered = options.ordered))]
pub(crate) async fn multi_load<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    entity_name: &str,
    ids: &[Identifier],
    options: &MultiLoadOptions,
) -> Outcome<Vec<Option<EntityRef>>, Error> {
    let factory = Arc::clone(&session.factory);
    let persister = Arc::clone(try_result!(factory.metamodel().persister(entity_name)));
    let dialect = session.connection.dialect();
    let batch_size = options.batch_size.unwrap_or_else(|| {
        dialect
            .batch_load_sizing_strategy()
            .determine_optimal_batch_load_size(persister.identifier_span(), ids.len())
    });

    let mut results: Vec<Option<EntityRef>> = vec![None; ids.len()];
    let mut unresolved: Vec<usize> = Vec::new();
    for (position, id) in ids.iter().enumerate() {
        match try_outcome!(probe(cx, session, &persister, id, options).await) {
            Probe::Found(entity) => results[position] = entity,
            Probe::Miss => unresolved.push(position),
        }
    }

    if unresolved.is_empty() {
        tracing::debug!("every identifier resolved without SQL");
        return Outcome::Ok(finish(results, options));
    }

    let loader = try_result!(factory.loaders().multi_load_loader(
        &factory,
        &persister,
        dialect,
        options.lock_options,
        &session.influencers,
    ));
    for chunk in unresolved.chunks(batch_size.max(1)) {
        let batch: Vec<Identifier> = chunk.iter().map(|&p| ids[p].clone()).collect();
        try_outcome!(load_chunk(cx, session, &loader, &persister, batch, options).await);
    }

    for &position in &unresolved {
        let key = persister.entity_key(ids[position].clone());
        let Some(entity) = session.context.get_entity(&key) else {
            continue;
        };
        let deleted = session
            .context
            .entry(&key)
            .is_some_and(|e| e.status.is_deleted_or_gone());
        if !deleted || options.return_deleted {
            results[position] = Some(entity.clone());
        }
    }
    Outcome::Ok(finish(results, options))
}

async fn load_chunk<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    loader: &EntityLoader,
    persister: &EntityPersister,
    batch: Vec<Identifier>,
    options: &MultiLoadOptions,
) -> Outcome<(), Error> {
    tracing::debug!(size = batch.len(), "multi-load batch");
    let parameters = QueryParameters::new(batch).lock_options(options.lock_options);
    try_outcome!(loader.load_batch(cx, session, persister, parameters).await);
    Outcome::Ok(())
}

async fn probe<C: Connection>(
    cx: &Cx,
    session: &mut Session<C>,
    persister: &EntityPersister,
    id: &Identifier,
    options: &MultiLoadOptions,
) -> Outcome<Probe, Error> {
    let key = persister.entity_key(id.clone());
    if options.session_checking {
        let entry = try_outcome!(
            load_from_session_cache(cx, session, persister, &key, options.lock_options, LoadType::GET)
                .await
        );
        match (entry.status, entry.entity) {
            (LookupStatus::Managed, Some(entity)) => return Outcome::Ok(Probe::Found(Some(entity))),
            (LookupStatus::RemovedEntityMarker, Some(entity)) => {
                return Outcome::Ok(Probe::Found(options.return_deleted.then_some(entity)));
            }
            (LookupStatus::InconsistentReturnClass, _) => return Outcome::Ok(Probe::Found(None)),
            _ => {}
        }
    } else if session
        .context
        .entry(&key)
        .is_some_and(|e| e.status.is_deleted_or_gone() && !options.return_deleted)
    {
        // Without session checking a pending delete still hides the row.
        return Outcome::Ok(Probe::Found(None));
    }

    if options.second_level_cache_checking {
        let request = LoadRequest::new(persister.entity_name(), id.clone())
            .lock_options(options.lock_options);
        if let Some(entity) =
            try_result!(load_from_second_level_cache(session, persister, &key, &request))
        {
            return Outcome::Ok(Probe::Found(Some(entity)));
        }
    }
    Outcome::Ok(Probe::Miss)
}

fn finish(results: Vec<Option<EntityRef>>, options: &MultiLoadOptions) -> Vec<Option<EntityRef>> {
    if options.ordered {
        results
    } else {
        results.into_iter().filter(Option::is_some).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence_context::EntityStatus;
    use crate::test_support::{MockConnection, factory, person_row};
    use asupersync::runtime::RuntimeBuilder;

    fn unwrap_outcome<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            other => std::panic::panic_any(format!("unexpected outcome: {other:?}")),
        }
    }

    #[test]
    fn defaults_are_ordered_and_cache_checking() {
        let options = MultiLoadOptions::new();
        assert!(options.ordered);
        assert!(!options.session_checking);
        assert!(options.second_level_cache_checking);
        assert!(!options.return_deleted);
        assert_eq!(options.batch_size, None);
        assert_eq!(MultiLoadOptions::new().batch_size(0).batch_size, Some(1));
    }

    #[test]
    fn unordered_results_drop_missing_entries() {
        let a = EntityRef::proxy("Person", Identifier::from(1_i64));
        let results = vec![Some(a.clone()), None, Some(a)];
        let unordered = finish(results.clone(), &MultiLoadOptions::new().ordered(false));
        assert_eq!(unordered.len(), 2);
        assert_eq!(finish(results, &MultiLoadOptions::new()).len(), 3);
    }

    #[test]
    fn gone_entries_hide_rows_without_session_checking() {
        let conn = MockConnection::new().with_rows("from people", vec![person_row(1, "Ada")]);
        let factory = factory(1);
        let mut session = factory.open_session(conn.clone());
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        rt.block_on(async {
            unwrap_outcome(session.load(&cx, "Person", 1_i64).await);
            let key = factory
                .metamodel()
                .persister("Person")
                .unwrap()
                .entity_key(Identifier::from(1_i64));
            session.context.set_status(&key, EntityStatus::Gone);

            let ids = [Identifier::from(1_i64)];
            let results =
                unwrap_outcome(session.multi_load(&cx, "Person", &ids, &MultiLoadOptions::new()).await);
            assert!(results[0].is_none());
            assert_eq!(conn.statements().len(), 1);
        });
    }
}
