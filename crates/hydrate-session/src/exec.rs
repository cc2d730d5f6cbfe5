//! Statement execution at the loader boundary.

use hydrate_core::{
    Connection, Cx, Dialect, EntityPersister, Error, LockOptions, Outcome, PreparedStatement,
    QueryError, Row, Statistics, Value,
};

/// Releases a prepared statement when dropped, on every exit path.
struct StatementGuard<'a, C: Connection> {
    connection: &'a C,
    statistics: &'a Statistics,
    statement: PreparedStatement,
}

impl<C: Connection> Drop for StatementGuard<'_, C> {
    fn drop(&mut self) {
        self.connection.release(&self.statement);
        self.statistics.statement_closed();
    }
}

/// Prepare `sql`, run it with `params` and release the statement.
pub(crate) async fn query<C: Connection>(
    cx: &Cx,
    connection: &C,
    statistics: &Statistics,
    sql: &str,
    params: &[Value],
) -> Outcome<Vec<Row>, Error> {
    let statement = try_outcome!(connection.prepare(cx, sql).await);
    statistics.statement_prepared();
    let guard = StatementGuard {
        connection,
        statistics,
        statement,
    };
    tracing::debug!(sql = guard.statement.sql(), params = params.len(), "executing load");
    connection.query_prepared(cx, &guard.statement, params).await
}

/// Rewrap a database error raised while running `sql`.
///
/// The kind is reclassified for the dialect, the statement and `descriptor`
/// are attached and the driver's error is kept as the source. Other errors
/// pass through unchanged.
pub(crate) fn translate(error: Error, dialect: Dialect, sql: &str, descriptor: &str) -> Error {
    match error {
        Error::Query(original) => {
            let kind = dialect.classify_error(original.sqlstate.as_deref(), &original.message);
            let sqlstate = original.sqlstate.clone();
            let detail = Some(original.message.clone());
            let position = original.position;
            Error::Query(QueryError {
                kind,
                sql: Some(sql.to_string()),
                sqlstate,
                message: descriptor.to_string(),
                detail,
                hint: None,
                position,
                source: Some(Box::new(original)),
            })
        }
        other => other,
    }
}

/// Map the `Err` side of an outcome through [`translate`].
pub(crate) fn translated<T>(
    outcome: Outcome<T, Error>,
    dialect: Dialect,
    sql: &str,
    descriptor: &str,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(e) => Outcome::Err(translate(e, dialect, sql, descriptor)),
        other => other,
    }
}

/// `select <id>[, <version>] from <table> where <id> = ?[ and <version> = ?]`
/// with the dialect's row lock clause.
pub(crate) fn lock_sql(
    persister: &EntityPersister,
    dialect: Dialect,
    lock_options: &LockOptions,
) -> String {
    let id_columns = persister.identifier_columns();
    let mut selected: Vec<&str> = id_columns.clone();
    let mut restriction: Vec<String> = id_columns.iter().map(|c| format!("{c} = ?")).collect();
    if let Some(version) = persister.version_column() {
        selected.push(version);
        restriction.push(format!("{version} = ?"));
    }
    let mut sql = format!(
        "select {} from {} where {}",
        selected.join(", "),
        persister.table(),
        restriction.join(" and ")
    );
    if let Some(clause) = dialect.for_update_clause(lock_options) {
        sql.push_str(&clause);
    }
    dialect.render_placeholders(&sql)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hydrate_core::{LockMode, LockTimeout, PropertyMapping, QueryErrorKind};

    #[test]
    fn lock_statements_check_versions() {
        let person = EntityPersister::builder("Person", "people")
            .property(PropertyMapping::basic("version", "version"))
            .version("version")
            .build();
        let options = LockOptions::new(LockMode::PessimisticWrite).timeout(LockTimeout::NoWait);
        assert_eq!(
            lock_sql(&person, Dialect::Postgres, &options),
            "select id, version from people where id = $1 and version = $2 for update nowait"
        );
        assert_eq!(
            lock_sql(&person, Dialect::Sqlite, &options),
            "select id, version from people where id = ?1 and version = ?2"
        );

        let team = EntityPersister::builder("Team", "teams").build();
        assert_eq!(
            lock_sql(&team, Dialect::Mysql, &LockOptions::new(LockMode::PessimisticRead)),
            "select id from teams where id = ? for share"
        );
    }

    #[test]
    fn translation_keeps_the_driver_error() {
        let driver = Error::Query(QueryError::database("deadlock detected", Some("40P01")));
        let err = translate(
            driver,
            Dialect::Postgres,
            "select 1",
            "could not load an entity: [Person#42]",
        );
        let Error::Query(query) = &err else {
            panic!("expected a query error, got {err:?}");
        };
        assert_eq!(query.kind, QueryErrorKind::Deadlock);
        assert_eq!(query.sql.as_deref(), Some("select 1"));
        assert_eq!(query.message, "could not load an entity: [Person#42]");
        assert_eq!(query.detail.as_deref(), Some("deadlock detected"));
        assert!(err.is_retryable());
        assert!(std::error::Error::source(&err).is_some());

        let other = translate(Error::Cancelled, Dialect::Postgres, "select 1", "x");
        assert!(matches!(other, Error::Cancelled));
    }
}
