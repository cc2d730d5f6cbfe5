//! Error types for Hydrate operations.
//!
//! Soft misses (nothing in the session, nothing in the second-level cache,
//! zero rows) are never errors; they surface as `Option`/marker values.
//! This enum is reserved for mapping mistakes, integrity violations and
//! failures reported by the database.

use std::fmt;

/// The primary error type for all Hydrate operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors reported by the driver
    Connection(ConnectionError),
    /// Query execution errors, translated at the loader boundary
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Mapping/metadata errors, raised while building persisters and templates
    Mapping(MappingError),
    /// Configuration errors
    Config(ConfigError),
    /// Integrity violations detected while loading
    Integrity(IntegrityError),
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Statement handle could not be allocated or was already released
    Statement,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<usize>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Permission denied
    Permission,
    /// Data too large for column
    DataTruncation,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// A row lock could not be acquired (NOWAIT, SKIP LOCKED, lock timeout)
    LockAcquisition,
    /// Statement timeout
    Timeout,
    /// Cancelled
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
    pub rust_type: Option<&'static str>,
}

/// A problem with entity metadata or with a load template built from it.
#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    /// Entity the problem was found on, when known
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Entity name not registered in the metamodel
    UnknownEntity,
    /// Property or association path that does not exist
    UnknownProperty,
    /// Column name that is empty or not a plain SQL identifier
    InvalidColumn,
    /// Identifier shape the loader cannot bind
    IdentifierShape,
    /// Foreign key span does not match the referenced identifier
    ForeignKeySpan,
    /// Batch-size sequence does not start at the maximum and end at 1
    BatchSizes,
    /// Restriction columns do not match a mapped key
    InvalidRestriction,
    /// Fetch profile refers to a role that does not exist
    FetchProfile,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A hard failure discovered while resolving an entity.
///
/// These are never retried: the data (or the cache) contradicts an
/// assumption the load was built on.
#[derive(Debug, Clone)]
pub struct IntegrityError {
    pub kind: IntegrityErrorKind,
    pub entity: String,
    pub identifier: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityErrorKind {
    /// More than one row for a singular load without collection owners
    NonUniqueResult,
    /// Instance resolved for a key is not of the requested entity type
    WrongClass,
    /// A reference cache entry was found while an instance to populate was supplied
    ReferenceEntryWithInstance,
    /// Lock upgrade requested on an entity that is no longer managed
    ObjectDeleted,
    /// Version changed underneath an optimistic or pessimistic lock
    StaleObjectState,
    /// `load` found no row for the identifier
    ObjectNotFound,
}

impl Error {
    /// Is this a retryable error (deadlock, serialization, lock contention, timeouts)?
    ///
    /// The loading core never retries on its own; this is advice for callers.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock
                    | QueryErrorKind::Serialization
                    | QueryErrorKind::LockAcquisition
                    | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(c) => matches!(
                c.kind,
                ConnectionErrorKind::Connect | ConnectionErrorKind::Disconnected
            ),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "23505" for unique violation)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Integrity error kind, if this is an integrity violation.
    pub fn integrity_kind(&self) -> Option<IntegrityErrorKind> {
        match self {
            Error::Integrity(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Mapping error kind, if this is a mapping error.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Shorthand for a mapping error.
    pub fn mapping(
        kind: MappingErrorKind,
        entity: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError {
            kind,
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Shorthand for an integrity error.
    pub fn integrity(
        kind: IntegrityErrorKind,
        entity: impl Into<String>,
        identifier: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Integrity(IntegrityError {
            kind,
            entity: entity.into(),
            identifier,
            message: message.into(),
        })
    }

    /// Shorthand for a configuration error without a source.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
            source: None,
        })
    }
}

impl QueryError {
    /// A bare database error, as a driver would report it.
    pub fn database(message: impl Into<String>, sqlstate: Option<&str>) -> Self {
        Self {
            kind: QueryErrorKind::Database,
            sql: None,
            sqlstate: sqlstate.map(str::to_string),
            message: message.into(),
            detail: None,
            hint: None,
            position: None,
            source: None,
        }
    }

    /// Is this a unique constraint violation?
    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23505")
    }

    /// Is this a foreign key violation?
    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate.as_deref() == Some("23503")
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)?;
                } else {
                    write!(f, "Query error: {}", e.message)?;
                }
                if let Some(sql) = &e.sql {
                    write!(f, " [{}]", sql)?;
                }
                Ok(())
            }
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Integrity(e) => write!(f, "Integrity error: {}", e),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} (entity '{}')", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identifier {
            Some(id) => write!(f, "{}: [{}#{}]", self.message, self.entity, id),
            None => write!(f, "{}: [{}]", self.message, self.entity),
        }
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|err| err as &(dyn std::error::Error + 'static))
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<IntegrityError> for Error {
    fn from(err: IntegrityError) -> Self {
        Error::Integrity(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Hydrate operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_helpers() {
        let mut query = QueryError::database("unique violation", Some("23505"));
        query.kind = QueryErrorKind::Constraint;
        query.sql = Some("select 1".to_string());

        assert!(query.is_unique_violation());
        assert!(!query.is_foreign_key_violation());

        let err = Error::Query(query);
        assert_eq!(err.sqlstate(), Some("23505"));
        assert_eq!(err.sql(), Some("select 1"));
        assert!(err.to_string().ends_with("[select 1]"));
    }

    #[test]
    fn retryable_flags() {
        let mut lock = QueryError::database("could not obtain lock", Some("55P03"));
        lock.kind = QueryErrorKind::LockAcquisition;
        assert!(Error::Query(lock).is_retryable());

        let syntax = Error::Query(QueryError::database("syntax", Some("42601")));
        assert!(!syntax.is_retryable());

        let integrity = Error::integrity(
            IntegrityErrorKind::NonUniqueResult,
            "Person",
            Some("42".to_string()),
            "more than one row with the given identifier was found",
        );
        assert!(!integrity.is_retryable());
        assert_eq!(
            integrity.integrity_kind(),
            Some(IntegrityErrorKind::NonUniqueResult)
        );
    }

    #[test]
    fn integrity_display_names_entity_and_id() {
        let err = Error::integrity(
            IntegrityErrorKind::WrongClass,
            "Dog",
            Some("7".to_string()),
            "object resolved for key is not of the requested type",
        );
        assert_eq!(
            err.to_string(),
            "Integrity error: object resolved for key is not of the requested type: [Dog#7]"
        );
    }

    #[test]
    fn mapping_display_mentions_entity() {
        let err = Error::mapping(
            MappingErrorKind::BatchSizes,
            Some("Person"),
            "batch sizes must end at 1",
        );
        assert_eq!(err.mapping_kind(), Some(MappingErrorKind::BatchSizes));
        assert!(err.to_string().contains("entity 'Person'"));
    }
}
