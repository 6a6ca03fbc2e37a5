//! Core types and collaborator contracts for the relate write path.
//!
//! This crate provides the data model the operation scheduler works on:
//!
//! - `Value` and `Row` for column values and result rows
//! - `EntityType`, `PropertyInfo` and `MetadataRegistry` for entity metadata
//! - `EntityRef` and `EntityState` for instances and their persistence state
//! - `Connection` and `Dialect` for the statement executor
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod row;
pub mod state;
pub mod types;
pub mod value;

pub use connection::Connection;
pub use dialect::Dialect;
pub use entity::{EntityRef, FieldValue};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DependencyError, Error, MappingError,
    ModelAccessError, ModelAccessErrorKind, OptimisticLockError, QueryError, QueryErrorKind,
    Result, TypeError,
};
pub use metadata::{
    EntityType, ForeignKeyInfo, ForeignTableInfo, GeneratedValue, MetadataRegistry,
    MetadataRegistryBuilder, OnForeignDeleted, PropertyInfo,
};
pub use row::{ColumnInfo, Row};
pub use state::EntityState;
pub use types::SqlType;
pub use value::Value;
