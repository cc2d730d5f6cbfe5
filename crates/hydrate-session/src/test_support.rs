//! Mock connection and mappings shared by unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hydrate_core::{
    Connection, Cx, Dialect, EntityPersister, Error, Metamodel, Outcome, PreparedStatement,
    PropertyMapping, Row, Value,
};

use crate::factory::{SessionFactory, Settings};

#[derive(Debug, Default)]
struct MockState {
    /// `(sql fragment, rows)`; the first matching fragment answers.
    canned: Vec<(String, Vec<Row>)>,
    statements: Vec<(String, Vec<Value>)>,
    prepared: usize,
    released: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct MockConnection {
    state: Arc<Mutex<MockState>>,
    next_id: Arc<AtomicU64>,
    dialect: Dialect,
}

impl MockConnection {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            dialect: Dialect::Postgres,
        }
    }

    pub(crate) fn with_rows(self, fragment: &str, rows: Vec<Row>) -> Self {
        self.state
            .lock()
            .unwrap()
            .canned
            .push((fragment.to_string(), rows));
        self
    }

    /// Every statement run so far, with its parameters.
    pub(crate) fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().statements.clone()
    }

    pub(crate) fn open_statements(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.prepared - state.released
    }

    fn answer(&self, sql: &str, params: &[Value]) -> Vec<Row> {
        let mut state = self.state.lock().unwrap();
        state.statements.push((sql.to_string(), params.to_vec()));
        state
            .canned
            .iter()
            .find(|(fragment, _)| sql.contains(fragment.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default()
    }
}

impl Connection for MockConnection {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let rows = self.answer(sql, params);
        async move { Outcome::Ok(rows) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let rows = self.answer(sql, params);
        async move { Outcome::Ok(rows.len() as u64) }
    }

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        self.state.lock().unwrap().prepared += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let params = sql.matches('$').count();
        let statement = PreparedStatement::new(id, sql.to_string(), params);
        async move { Outcome::Ok(statement) }
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let rows = self.answer(stmt.sql(), params);
        async move { Outcome::Ok(rows) }
    }

    fn release(&self, _stmt: &PreparedStatement) {
        self.state.lock().unwrap().released += 1;
    }
}

fn person(batch_size: usize) -> hydrate_core::EntityPersisterBuilder {
    EntityPersister::builder("Person", "people")
        .property(PropertyMapping::basic("name", "name"))
        .batch_size(batch_size)
}

/// A factory mapping `Person(id, name)` on `people`.
pub(crate) fn factory(batch_size: usize) -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(person(batch_size))
        .build()
        .unwrap();
    SessionFactory::builder(metamodel)
        .settings(Settings::new())
        .build()
        .unwrap()
}

/// Like [`factory`], with `Person` cached in the `people` region.
pub(crate) fn cached_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(person(1).cache_region("people"))
        .build()
        .unwrap();
    SessionFactory::builder(metamodel).build().unwrap()
}

/// A `people` row as selected by the root alias `person0_`.
pub(crate) fn person_row(id: i64, name: &str) -> Row {
    Row::new(
        vec!["person0__id".to_string(), "person0__name".to_string()],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}
