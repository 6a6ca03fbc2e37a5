//! The operation driver.
//!
//! An [`Operation`] owns every piece of state of one save or delete call:
//! the request graph, the identity cache and the processors. It drives the
//! graph to completion in waves:
//!
//! 1. process new requests until nothing new is discovered
//! 2. run pending reads, then start over
//! 3. collect the statements of every ready request and run them together
//! 4. apply the outputs, then start over
//!
//! A request and anything it depends on never run in the same wave.

use crate::cache::InstanceCache;
use crate::config::OperationConfig;
use crate::delete::DeleteProcessor;
use crate::delete_without_loading::{self, DeleteWithoutLoading};
use crate::instance::InstanceProcessor;
use crate::loader::{self, Loader};
use crate::property_updater::{self, PropertyUpdater};
use crate::request::RequestGraph;
use crate::save::SaveProcessor;
use crate::statement::{Statement, run_statement};
use futures_util::future::join_all;
use relate_core::{
    Connection, Cx, DependencyError, Dialect, EntityRef, Error, MetadataRegistry, Outcome, Result,
};
use serde::Serialize;
use std::sync::Arc;

/// Counts reported by a finished operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    /// Rows inserted
    pub inserted: usize,
    /// Instances updated
    pub updated: usize,
    /// Instances deleted one by one
    pub deleted: usize,
    /// Rows changed by bulk property updates
    pub bulk_updated: u64,
    /// Rows removed by criteria deletes
    pub bulk_deleted: u64,
    /// Statements sent to the connection
    pub statements: usize,
    /// Write waves
    pub waves: usize,
    /// Read statements issued to continue a cascade
    pub loads: usize,
}

/// Actions run once the last wave settled.
#[derive(Debug)]
pub(crate) enum Deferred {
    MarkDeleted(Vec<EntityRef>),
}

impl Deferred {
    fn run(self) {
        match self {
            Deferred::MarkDeleted(instances) => {
                for instance in instances {
                    instance.mark_deleted();
                }
            }
        }
    }
}

/// Shared state of one operation, handed to every processor.
#[derive(Debug)]
pub struct OperationContext {
    pub(crate) registry: Arc<MetadataRegistry>,
    pub(crate) config: OperationConfig,
    pub(crate) dialect: Dialect,
    pub(crate) graph: RequestGraph,
    pub(crate) cache: InstanceCache,
    pub(crate) saves: SaveProcessor,
    pub(crate) deletes: DeleteProcessor,
    pub(crate) updater: PropertyUpdater,
    pub(crate) criteria: DeleteWithoutLoading,
    pub(crate) loader: Loader,
    pub(crate) deferred: Vec<Deferred>,
    pub(crate) result: OperationResult,
}

impl OperationContext {
    pub(crate) fn new(
        registry: Arc<MetadataRegistry>,
        config: OperationConfig,
        dialect: Dialect,
    ) -> Self {
        Self {
            registry,
            config,
            dialect,
            graph: RequestGraph::new(),
            cache: InstanceCache::new(),
            saves: SaveProcessor::default(),
            deletes: DeleteProcessor::default(),
            updater: PropertyUpdater::default(),
            criteria: DeleteWithoutLoading::default(),
            loader: Loader::default(),
            deferred: Vec::new(),
            result: OperationResult::default(),
        }
    }

    /// The request graph of this operation.
    pub fn graph(&self) -> &RequestGraph {
        &self.graph
    }

    /// The identity cache of this operation.
    pub fn cache(&self) -> &InstanceCache {
        &self.cache
    }

    /// Process new requests until neither processor discovers more work.
    fn process_to_fixpoint(&mut self) -> Result<()> {
        loop {
            let saved = SaveProcessor::process_requests(self)?;
            let deleted = DeleteProcessor::process_requests(self)?;
            if !saved && !deleted {
                return Ok(());
            }
        }
    }

    /// Statements of every request that can execute now.
    fn ready_statements(&mut self) -> Result<Vec<Statement>> {
        let mut statements = property_updater::execute_requests(self)?;
        statements.extend(SaveProcessor::execute_requests(self)?);
        statements.extend(DeleteProcessor::execute_requests(self)?);
        statements.extend(delete_without_loading::execute_requests(self)?);
        Ok(statements)
    }

    fn run_deferred(&mut self) {
        for action in std::mem::take(&mut self.deferred) {
            action.run();
        }
    }
}

/// One save and/or delete call against a connection.
///
/// # Example
///
/// ```ignore
/// let mut op = Operation::new(&cx, &conn, Arc::clone(&registry), OperationConfig::default());
/// op.save(&team)?;
/// op.delete(&old_member)?;
/// let result = op.execute().await;
/// ```
pub struct Operation<'a, C: Connection> {
    cx: &'a Cx,
    conn: &'a C,
    ctx: OperationContext,
}

impl<'a, C: Connection> Operation<'a, C> {
    pub fn new(
        cx: &'a Cx,
        conn: &'a C,
        registry: Arc<MetadataRegistry>,
        config: OperationConfig,
    ) -> Self {
        let dialect = conn.dialect();
        Self {
            cx,
            conn,
            ctx: OperationContext::new(registry, config, dialect),
        }
    }

    /// Register `instance` to be inserted or updated, with its cascade.
    pub fn save(&mut self, instance: &EntityRef) -> Result<()> {
        self.ctx.registry.entity(instance.type_name())?;
        SaveProcessor::add_to_process(&mut self.ctx, instance)?;
        Ok(())
    }

    /// Register `instance` to be deleted, with its cascade.
    pub fn delete(&mut self, instance: &EntityRef) -> Result<()> {
        self.ctx.registry.entity(instance.type_name())?;
        DeleteProcessor::add_to_process(&mut self.ctx, instance)?;
        Ok(())
    }

    pub fn context(&self) -> &OperationContext {
        &self.ctx
    }

    /// Run every registered request and its cascade to completion.
    ///
    /// Instances deleted by statements that succeeded are marked deleted
    /// even when a later statement fails.
    #[tracing::instrument(level = "info", skip(self), fields(requests = self.ctx.graph.len()))]
    pub async fn execute(mut self) -> Outcome<OperationResult, Error> {
        let start = std::time::Instant::now();
        let outcome = self.drive().await;
        self.ctx.run_deferred();
        match outcome {
            Outcome::Ok(()) => {
                let result = self.ctx.result;
                tracing::info!(
                    elapsed_ms = start.elapsed().as_millis(),
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    bulk_updated = result.bulk_updated,
                    bulk_deleted = result.bulk_deleted,
                    property_updates = self.ctx.updater.len(),
                    criteria_deletes = self.ctx.criteria.len(),
                    statements = result.statements,
                    waves = result.waves,
                    "Operation complete"
                );
                Outcome::Ok(result)
            }
            Outcome::Err(e) => {
                tracing::debug!(error = %e, waves = self.ctx.result.waves, "Operation failed");
                Outcome::Err(e)
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    async fn drive(&mut self) -> Outcome<(), Error> {
        loop {
            if let Some(reason) = self.cx.cancel_reason() {
                return Outcome::Cancelled(reason);
            }
            if let Err(e) = self.ctx.process_to_fixpoint() {
                return Outcome::Err(e);
            }

            if self.ctx.loader.has_pending() {
                let statements = match loader::take_statements(&mut self.ctx) {
                    Ok(statements) => statements,
                    Err(e) => return Outcome::Err(e),
                };
                tracing::debug!(statements = statements.len(), "Running reads");
                match self.run_wave(statements).await {
                    Outcome::Ok(()) => continue,
                    other => return other,
                }
            }

            let statements = match self.ctx.ready_statements() {
                Ok(statements) => statements,
                Err(e) => return Outcome::Err(e),
            };
            if statements.is_empty() {
                let pending = self.ctx.graph.pending_labels();
                if pending.is_empty() {
                    return Outcome::Ok(());
                }
                return Outcome::Err(Error::Dependency(DependencyError::Stalled { pending }));
            }
            self.ctx.result.waves += 1;
            tracing::debug!(
                wave = self.ctx.result.waves,
                statements = statements.len(),
                "Running wave"
            );
            match self.run_wave(statements).await {
                Outcome::Ok(()) => {}
                other => return other,
            }
        }
    }

    /// Run statements concurrently, then apply every successful output.
    ///
    /// The first failure is returned once all outputs were applied.
    async fn run_wave(&mut self, statements: Vec<Statement>) -> Outcome<(), Error> {
        let (cx, conn) = (self.cx, self.conn);
        let outputs = join_all(
            statements
                .iter()
                .map(|statement| run_statement(cx, conn, statement)),
        )
        .await;
        self.ctx.result.statements += statements.len();

        let mut failure: Option<Outcome<(), Error>> = None;
        for (statement, output) in statements.into_iter().zip(outputs) {
            let completed = match output {
                Outcome::Ok(output) => statement.complete(&mut self.ctx, output),
                Outcome::Err(e) => Err(e),
                Outcome::Cancelled(r) => {
                    failure.get_or_insert(Outcome::Cancelled(r));
                    continue;
                }
                Outcome::Panicked(p) => {
                    failure.get_or_insert(Outcome::Panicked(p));
                    continue;
                }
            };
            if let Err(e) = completed {
                failure.get_or_insert(Outcome::Err(e));
            }
        }
        failure.unwrap_or(Outcome::Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_counts() {
        let result = OperationResult {
            inserted: 2,
            waves: 1,
            ..Default::default()
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["inserted"], 2);
        assert_eq!(json["waves"], 1);
        assert_eq!(json["bulk_deleted"], 0);
    }
}
