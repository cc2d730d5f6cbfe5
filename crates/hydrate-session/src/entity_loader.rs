//! Loaders that run one template and assemble its rows.

use std::sync::{Arc, Mutex, PoisonError};

use hydrate_core::{
    Connection, Cx, EntityPersister, EntityRef, Error, Identifier, IntegrityErrorKind,
    LockOptions, Outcome, batch_info_string,
};
use hydrate_query::{BatchSize, LoadTemplate, StatementCache};

use crate::Session;
use crate::assembler::Assembly;
use crate::exec;

/// Per-invocation bindings of a load.
#[derive(Debug, Clone, Default)]
pub struct QueryParameters {
    /// One identifier per restriction slot.
    pub ids: Vec<Identifier>,
    /// Instance to populate instead of instantiating one.
    pub optional_object: Option<EntityRef>,
    /// Identifier the optional object stands for.
    pub optional_id: Option<Identifier>,
    pub lock_options: LockOptions,
    /// Overrides the session's default read-only setting.
    pub read_only: Option<bool>,
}

impl QueryParameters {
    pub fn new(ids: Vec<Identifier>) -> Self {
        Self {
            ids,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn optional_object(mut self, object: Option<EntityRef>, id: Option<Identifier>) -> Self {
        self.optional_object = object;
        self.optional_id = id;
        self
    }

    #[must_use]
    pub fn lock_options(mut self, lock_options: LockOptions) -> Self {
        self.lock_options = lock_options;
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: Option<bool>) -> Self {
        self.read_only = read_only;
        self
    }
}

/// Runs one load template: a fixed batch size, or a dynamic restriction
/// expanded to the number of keys per call.
#[derive(Debug)]
pub struct EntityLoader {
    template: Arc<LoadTemplate>,
    /// Expanded statements of a dynamic template, keyed by key count.
    statements: Mutex<StatementCache>,
}

impl EntityLoader {
    pub fn new(template: LoadTemplate, statement_cache_size: usize) -> Self {
        Self {
            template: Arc::new(template),
            statements: Mutex::new(StatementCache::new(statement_cache_size)),
        }
    }

    pub fn template(&self) -> &LoadTemplate {
        &self.template
    }

    pub fn batch_size(&self) -> BatchSize {
        self.template.batch_size()
    }

    fn sql_for(&self, count: usize) -> hydrate_core::Result<String> {
        if let BatchSize::Fixed(_) = self.template.batch_size() {
            return self.template.sql_for_count(count);
        }
        let mut statements = self
            .statements
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let key = count as u64;
        if let Some(sql) = statements.get(key) {
            return Ok(sql.to_string());
        }
        let sql = self.template.sql_for_count(count)?;
        Ok(statements.get_or_insert(key, || sql).to_string())
    }

    /// Load a single entity by identifier (or unique key).
    ///
    /// More than one row is only accepted when the template fetches a
    /// collection, since each element then repeats the owner.
    pub async fn load<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &EntityPersister,
        parameters: QueryParameters,
    ) -> Outcome<Option<EntityRef>, Error> {
        let Some(id) = parameters.ids.first().cloned() else {
            return Outcome::Ok(None);
        };
        let descriptor = format!(
            "could not load an entity: {}",
            persister.entity_key(id.clone())
        );
        let (rows, roots) =
            try_outcome!(self.execute(cx, session, &parameters, &descriptor).await);
        if rows > 1 && !self.template.has_collection_owners() {
            return Outcome::Err(Error::integrity(
                IntegrityErrorKind::NonUniqueResult,
                persister.entity_name(),
                Some(id.to_string()),
                "more than one row with the given identifier was found",
            ));
        }
        Outcome::Ok(roots.into_iter().next())
    }

    /// Load every key in `parameters.ids` with one statement. Results are
    /// distinct instances in row order.
    pub async fn load_batch<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        persister: &EntityPersister,
        parameters: QueryParameters,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let descriptor = format!(
            "could not load an entity batch: {}",
            batch_info_string(persister.entity_name(), &parameters.ids)
        );
        let (_, roots) = try_outcome!(self.execute(cx, session, &parameters, &descriptor).await);
        let mut distinct: Vec<EntityRef> = Vec::with_capacity(roots.len());
        for root in roots {
            if !distinct.iter().any(|e| e.same(&root)) {
                distinct.push(root);
            }
        }
        Outcome::Ok(distinct)
    }

    /// Run the statement and assemble; returns the row count and the root
    /// entity of every row.
    async fn execute<C: Connection>(
        &self,
        cx: &Cx,
        session: &mut Session<C>,
        parameters: &QueryParameters,
        descriptor: &str,
    ) -> Outcome<(usize, Vec<EntityRef>), Error> {
        let sql = try_result!(self.sql_for(parameters.ids.len()));
        let params = try_result!(self.template.bind(&parameters.ids));
        let factory = Arc::clone(&session.factory);
        let dialect = self.template.dialect();

        let rows = try_outcome!(exec::translated(
            exec::query(cx, &session.connection, factory.statistics(), &sql, &params).await,
            dialect,
            &sql,
            descriptor,
        ));
        factory.statistics().entity_fetched();
        tracing::debug!(
            entity = self.template.entity_name(),
            keys = parameters.ids.len(),
            rows = rows.len(),
            "loaded rows"
        );

        let assembly = Assembly {
            factory: &factory,
            context: &mut session.context,
            config: &session.config,
            template: &self.template,
            parameters,
        };
        let roots = try_result!(assembly.assemble(&rows));
        Outcome::Ok((rows.len(), roots))
    }
}
