//! Error types for write-path operations.

use std::fmt;

/// The primary error type for all save/delete operations.
#[derive(Debug)]
pub enum Error {
    /// The connection failed underneath a statement
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// A version-guarded update matched no row
    OptimisticLock(OptimisticLockError),
    /// A field or instance could not be read or written
    ModelAccess(ModelAccessError),
    /// The request graph cannot be completed
    Dependency(DependencyError),
    /// Entity metadata is inconsistent
    Mapping(MappingError),
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
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Row, table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

/// A versioned update or delete did not find the row at the expected version.
#[derive(Debug, Clone)]
pub struct OptimisticLockError {
    pub entity: String,
    pub table: String,
    /// Version the instance was loaded with.
    pub expected_version: i64,
    /// Number of instances in the failing statement.
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct ModelAccessError {
    pub kind: ModelAccessErrorKind,
    pub entity: String,
    pub field: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelAccessErrorKind {
    /// No metadata is registered for the type
    UnknownEntity,
    /// The type has no such property or inverse field
    UnknownField,
    /// The field holds a value of the wrong shape
    WrongShape,
    /// The instance needs an id but has none
    MissingId,
    /// The instance was already deleted
    Deleted,
}

#[derive(Debug, Clone)]
pub enum DependencyError {
    /// Adding the edge would close a cycle; `path` lists the requests involved.
    Cycle { path: Vec<String> },
    /// Requests remain that can never become ready.
    Stalled { pending: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub entity: String,
    pub field: Option<String>,
    pub message: String,
}

impl Error {
    /// Is this a retryable error (optimistic lock, deadlock, serialization, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::OptimisticLock(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock | QueryErrorKind::Serialization | QueryErrorKind::Timeout
            ),
            _ => false,
        }
    }

    /// Is this a defect in the model or its metadata rather than a store failure?
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            Error::ModelAccess(_) | Error::Mapping(_) | Error::Dependency(_) | Error::Config(_)
        )
    }

    /// Get SQLSTATE if available (e.g., "23503" for foreign key violation)
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

    pub fn model(
        kind: ModelAccessErrorKind,
        entity: &str,
        field: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Error::ModelAccess(ModelAccessError {
            kind,
            entity: entity.to_string(),
            field: field.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn mapping(entity: &str, field: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.to_string(),
            field: field.map(str::to_string),
            message: message.into(),
        })
    }
}

impl ModelAccessError {
    pub fn new(
        kind: ModelAccessErrorKind,
        entity: impl Into<String>,
        field: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            field: field.map(str::to_string),
            message: message.into(),
        }
    }
}

impl QueryError {
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
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::OptimisticLock(e) => write!(f, "Optimistic locking failure: {}", e),
            Error::ModelAccess(e) => write!(f, "Model access error: {}", e),
            Error::Dependency(e) => write!(f, "Dependency error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
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

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} row(s) of {} ({}) were modified concurrently, expected version {}",
            self.rows, self.entity, self.table, self.expected_version
        )
    }
}

impl fmt::Display for ModelAccessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}: {}", self.entity, field, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
    }
}

impl fmt::Display for DependencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyError::Cycle { path } => {
                write!(f, "cyclic dependency: {}", path.join(" -> "))
            }
            DependencyError::Stalled { pending } => {
                write!(f, "requests can never execute: {}", pending.join(", "))
            }
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}.{}: {}", self.entity, field, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
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

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<ModelAccessError> for Error {
    fn from(err: ModelAccessError) -> Self {
        Error::ModelAccess(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::Dependency(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

/// Result type alias for write-path operations.
pub type Result<T> = std::result::Result<T, Error>;
