//! Scripted connection and mappings shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hydrate::core::QueryError;
use hydrate::prelude::*;
use hydrate::{Dialect, FetchMode, PreparedStatement, SessionFactory};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn ids(values: &[i64]) -> Vec<Identifier> {
    values.iter().copied().map(Identifier::from).collect()
}

// ============================================================================
// Scripted connection
// ============================================================================

#[derive(Debug, Clone)]
struct Rule {
    fragment: String,
    rows: Vec<Row>,
    /// Only rows whose value under this column matches a parameter answer.
    key_alias: Option<String>,
}

#[derive(Debug)]
struct Failure {
    fragment: String,
    message: String,
    sqlstate: Option<String>,
}

#[derive(Debug, Default)]
struct ScriptState {
    rules: Vec<Rule>,
    failures: Vec<Failure>,
    statements: Vec<(String, Vec<Value>)>,
    prepared: usize,
    released: usize,
}

/// A connection answering statements from canned rows.
///
/// The first rule whose fragment occurs in the SQL answers it. Statements,
/// parameters and prepare/release counts are recorded.
#[derive(Debug, Clone)]
pub struct ScriptedConnection {
    state: Arc<Mutex<ScriptState>>,
    next_id: Arc<AtomicU64>,
}

impl ScriptedConnection {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Answer statements containing `fragment` with every row in `rows`.
    pub fn rows(self, fragment: &str, rows: Vec<Row>) -> Self {
        self.push(Rule {
            fragment: fragment.to_string(),
            rows,
            key_alias: None,
        })
    }

    /// Answer statements containing `fragment` with the rows of `table`
    /// whose `key_alias` column equals one of the bound parameters.
    pub fn table(self, fragment: &str, key_alias: &str, table: Vec<Row>) -> Self {
        self.push(Rule {
            fragment: fragment.to_string(),
            rows: table,
            key_alias: Some(key_alias.to_string()),
        })
    }

    /// Fail statements containing `fragment` the way a driver would.
    pub fn fail_on(self, fragment: &str, message: &str, sqlstate: Option<&str>) -> Self {
        self.state.lock().unwrap().failures.push(Failure {
            fragment: fragment.to_string(),
            message: message.to_string(),
            sqlstate: sqlstate.map(str::to_string),
        });
        self
    }

    fn push(self, rule: Rule) -> Self {
        self.state.lock().unwrap().rules.push(rule);
        self
    }

    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.state.lock().unwrap().statements.len()
    }

    pub fn last_statement(&self) -> (String, Vec<Value>) {
        self.statements().pop().expect("no statement was run")
    }

    pub fn open_statements(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.prepared - state.released
    }

    fn answer(&self, sql: &str, params: &[Value]) -> std::result::Result<Vec<Row>, Error> {
        let mut state = self.state.lock().unwrap();
        state.statements.push((sql.to_string(), params.to_vec()));
        if let Some(failure) = state.failures.iter().find(|f| sql.contains(&f.fragment)) {
            return Err(Error::Query(QueryError::database(
                failure.message.clone(),
                failure.sqlstate.as_deref(),
            )));
        }
        let Some(rule) = state.rules.iter().find(|r| sql.contains(&r.fragment)) else {
            return Ok(Vec::new());
        };
        let rows = match &rule.key_alias {
            None => rule.rows.clone(),
            Some(alias) => rule
                .rows
                .iter()
                .filter(|row| {
                    row.get_by_name(alias)
                        .is_some_and(|key| params.iter().any(|p| p.key_eq(key)))
                })
                .cloned()
                .collect(),
        };
        Ok(rows)
    }
}

fn into_outcome<T>(result: std::result::Result<T, Error>) -> Outcome<T, Error> {
    match result {
        Ok(v) => Outcome::Ok(v),
        Err(e) => Outcome::Err(e),
    }
}

impl Connection for ScriptedConnection {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn query(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let answer = into_outcome(self.answer(sql, params));
        async move { answer }
    }

    fn execute(
        &self,
        _cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let answer = into_outcome(self.answer(sql, params).map(|rows| rows.len() as u64));
        async move { answer }
    }

    fn prepare(
        &self,
        _cx: &Cx,
        sql: &str,
    ) -> impl Future<Output = Outcome<PreparedStatement, Error>> + Send {
        self.state.lock().unwrap().prepared += 1;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let statement = PreparedStatement::new(id, sql.to_string(), sql.matches('$').count());
        async move { Outcome::Ok(statement) }
    }

    fn query_prepared(
        &self,
        _cx: &Cx,
        stmt: &PreparedStatement,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let answer = into_outcome(self.answer(stmt.sql(), params));
        async move { answer }
    }

    fn release(&self, _stmt: &PreparedStatement) {
        self.state.lock().unwrap().released += 1;
    }
}

// ============================================================================
// Mappings
// ============================================================================

/// `Person(name, team -> Team)` on `people`, `Team(name)` on `teams`.
pub fn people_metamodel(batch_size: usize) -> Metamodel {
    Metamodel::builder()
        .entity(
            EntityPersister::builder("Person", "people")
                .property(PropertyMapping::basic("name", "name"))
                .property(PropertyMapping::many_to_one("team", "Team", &["team_id"]))
                .batch_size(batch_size),
        )
        .entity(
            EntityPersister::builder("Team", "teams")
                .property(PropertyMapping::basic("name", "name"))
                .batch_size(batch_size),
        )
        .build()
        .expect("valid people mapping")
}

pub fn factory_with(metamodel: Metamodel, settings: Settings) -> Arc<SessionFactory> {
    SessionFactory::builder(metamodel)
        .settings(settings.generate_statistics(true))
        .build()
        .expect("session factory")
}

pub fn people_factory(batch_size: usize, style: BatchFetchStyle) -> Arc<SessionFactory> {
    factory_with(
        people_metamodel(batch_size),
        Settings::new().batch_fetch_style(style),
    )
}

/// Like [`people_metamodel`], with `Person` cached in the `people` region.
pub fn cached_people_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Person", "people")
                .property(PropertyMapping::basic("name", "name"))
                .property(PropertyMapping::many_to_one("team", "Team", &["team_id"]))
                .cache_region("people"),
        )
        .entity(
            EntityPersister::builder("Team", "teams")
                .property(PropertyMapping::basic("name", "name")),
        )
        .build()
        .expect("valid cached mapping");
    factory_with(metamodel, Settings::new())
}

/// `Person` joining its team eagerly.
pub fn joined_team_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Person", "people")
                .property(PropertyMapping::basic("name", "name"))
                .property(
                    PropertyMapping::many_to_one("team", "Team", &["team_id"])
                        .fetch(FetchMode::Join),
                ),
        )
        .entity(
            EntityPersister::builder("Team", "teams")
                .property(PropertyMapping::basic("name", "name")),
        )
        .build()
        .expect("valid person mapping");
    factory_with(metamodel, Settings::new())
}

/// `Team` fetching its members in the same statement.
pub fn team_members_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Team", "teams")
                .property(PropertyMapping::basic("name", "name"))
                .property(
                    PropertyMapping::one_to_many("members", "Member", &["team_id"])
                        .fetch(FetchMode::Join),
                ),
        )
        .entity(
            EntityPersister::builder("Member", "members")
                .property(PropertyMapping::basic("name", "name")),
        )
        .build()
        .expect("valid team mapping");
    factory_with(metamodel, Settings::new())
}

/// `Animal` with `Dog` and `Cat` on one table, told apart by `kind`.
pub fn animal_factory() -> Arc<SessionFactory> {
    let animal = EntityPersister::builder("Animal", "animals")
        .property(PropertyMapping::basic("name", "name"))
        .discriminator("kind", "A");
    let dog = animal.subclass("Dog", "D");
    let cat = animal.subclass("Cat", "C");
    let metamodel = Metamodel::builder()
        .entity(animal)
        .entity(dog)
        .entity(cat)
        .build()
        .expect("valid animal mapping");
    factory_with(metamodel, Settings::new())
}

/// Like [`animal_factory`], with the hierarchy cached in the `animals` region.
pub fn cached_animal_factory() -> Arc<SessionFactory> {
    let animal = EntityPersister::builder("Animal", "animals")
        .property(PropertyMapping::basic("name", "name"))
        .discriminator("kind", "A")
        .cache_region("animals");
    let dog = animal.subclass("Dog", "D");
    let cat = animal.subclass("Cat", "C");
    let metamodel = Metamodel::builder()
        .entity(animal)
        .entity(dog)
        .entity(cat)
        .build()
        .expect("valid animal mapping");
    factory_with(metamodel, Settings::new())
}

/// Immutable `Country(name)` cached by reference in the `countries` region.
pub fn country_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Country", "countries")
                .property(PropertyMapping::basic("name", "name"))
                .immutable()
                .cache_region("countries")
                .reference_cache_entries(true),
        )
        .build()
        .expect("valid country mapping");
    factory_with(metamodel, Settings::new())
}

/// `Account(owner, version)` with an optimistic version column.
pub fn account_factory() -> Arc<SessionFactory> {
    let metamodel = Metamodel::builder()
        .entity(
            EntityPersister::builder("Account", "accounts")
                .property(PropertyMapping::basic("owner", "owner"))
                .property(PropertyMapping::basic("version", "version"))
                .version("version"),
        )
        .build()
        .expect("valid account mapping");
    factory_with(metamodel, Settings::new())
}

// ============================================================================
// Rows
// ============================================================================

fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| (*c).to_string()).collect(), values)
}

fn team_value(team: Option<i64>) -> Value {
    team.map_or(Value::Null, Value::BigInt)
}

/// A `people` row selected through `alias` (`person0_` for root loads).
pub fn person_row(id: i64, name: &str, team: Option<i64>) -> Row {
    row(
        &["person0__id", "person0__name", "person0__team_id"],
        vec![
            Value::BigInt(id),
            Value::Text(name.to_string()),
            team_value(team),
        ],
    )
}

pub fn team_row(id: i64, name: &str) -> Row {
    row(
        &["team0__id", "team0__name"],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}

/// A person joined with their team.
pub fn person_with_team_row(id: i64, name: &str, team: i64, team_name: &str) -> Row {
    row(
        &[
            "person0__id",
            "person0__name",
            "person0__team_id",
            "team1__id",
            "team1__name",
        ],
        vec![
            Value::BigInt(id),
            Value::Text(name.to_string()),
            Value::BigInt(team),
            Value::BigInt(team),
            Value::Text(team_name.to_string()),
        ],
    )
}

/// A team joined with one of its members.
pub fn team_member_row(team: i64, team_name: &str, member: i64, member_name: &str) -> Row {
    row(
        &["team0__id", "team0__name", "members1__id", "members1__name"],
        vec![
            Value::BigInt(team),
            Value::Text(team_name.to_string()),
            Value::BigInt(member),
            Value::Text(member_name.to_string()),
        ],
    )
}

/// An `animals` row as selected through `alias` (`dog0_`, `cat0_`, ...).
pub fn animal_row(alias: &str, id: i64, name: &str, kind: &str) -> Row {
    let columns = [
        format!("{alias}_id"),
        format!("{alias}_name"),
        format!("{alias}_kind"),
    ];
    Row::new(
        columns.to_vec(),
        vec![
            Value::BigInt(id),
            Value::Text(name.to_string()),
            Value::Text(kind.to_string()),
        ],
    )
}

pub fn account_row(id: i64, owner: &str, version: i64) -> Row {
    row(
        &["account0__id", "account0__owner", "account0__version"],
        vec![
            Value::BigInt(id),
            Value::Text(owner.to_string()),
            Value::BigInt(version),
        ],
    )
}

pub fn country_row(id: i64, name: &str) -> Row {
    row(
        &["country0__id", "country0__name"],
        vec![Value::BigInt(id), Value::Text(name.to_string())],
    )
}
