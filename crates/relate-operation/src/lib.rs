//! Save and delete scheduling for relate.
//!
//! `relate-operation` is the **write-path coordinator**. Given the instances a
//! caller wants saved or deleted, it discovers every related instance that
//! must be written too, builds a dependency graph of the statements involved
//! and runs that graph against a `Connection` in waves.
//!
//! # Role In The Architecture
//!
//! - **Identity cache**: one request per stored row, however many handles
//!   point at it.
//! - **Cascades**: saves follow foreign keys and loaded inverse fields;
//!   deletes follow every link and pick the cheapest way to keep the store
//!   consistent (bulk null-out, criteria delete, or load and cascade).
//! - **Batching**: ready requests of one entity type share a statement.
//! - **Ordering**: a row is written only after every row it depends on.
//!
//! # Example
//!
//! ```ignore
//! let team = EntityRef::new(registry.entity("Team")?);
//! team.set("name", Value::Text("Core".into()))?;
//! let member = EntityRef::new(registry.entity("Member")?);
//! member.set("team", &team)?;
//!
//! // Team is inserted first; member.team holds its generated id
//! let result = relate_operation::save(&cx, &conn, &registry, &[member], OperationConfig::default()).await;
//! ```

pub mod cache;
pub mod config;
mod delete;
mod delete_without_loading;
mod instance;
mod loader;
pub mod operation;
mod property_updater;
pub mod request;
mod save;
mod statement;

pub use cache::InstanceCache;
pub use config::{OperationConfig, ZeroRowsPolicy};
pub use instance::InstanceRequests;
pub use operation::{Operation, OperationContext, OperationResult};
pub use request::{RequestGraph, RequestId, RequestKind};

use relate_core::{Connection, Cx, EntityRef, Error, MetadataRegistry, Outcome};
use std::sync::Arc;

/// Insert or update `instances` and everything their cascade reaches.
#[tracing::instrument(level = "debug", skip_all, fields(instances = instances.len()))]
pub async fn save<C: Connection>(
    cx: &Cx,
    conn: &C,
    registry: &Arc<MetadataRegistry>,
    instances: &[EntityRef],
    config: OperationConfig,
) -> Outcome<OperationResult, Error> {
    let mut operation = Operation::new(cx, conn, Arc::clone(registry), config);
    for instance in instances {
        if let Err(e) = operation.save(instance) {
            return Outcome::Err(e);
        }
    }
    operation.execute().await
}

/// Delete `instances` and everything their cascade reaches.
#[tracing::instrument(level = "debug", skip_all, fields(instances = instances.len()))]
pub async fn delete<C: Connection>(
    cx: &Cx,
    conn: &C,
    registry: &Arc<MetadataRegistry>,
    instances: &[EntityRef],
    config: OperationConfig,
) -> Outcome<OperationResult, Error> {
    let mut operation = Operation::new(cx, conn, Arc::clone(registry), config);
    for instance in instances {
        if let Err(e) = operation.delete(instance) {
            return Outcome::Err(e);
        }
    }
    operation.execute().await
}
