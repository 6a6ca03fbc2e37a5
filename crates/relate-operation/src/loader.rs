//! Batched reads needed to continue a cascade.
//!
//! The delete cascade sometimes cannot proceed from memory alone: a not
//! loaded instance must be read to follow its foreign keys, or the rows
//! referencing a deleted row must be fetched because they have links of
//! their own. Such reads are queued here and run by the driver before the
//! next wave, each with a continuation that resumes the cascade.

use crate::delete::DeleteProcessor;
use crate::instance::{InstanceProcessor, describe};
use crate::operation::OperationContext;
use crate::request::RequestId;
use crate::save::write_row_match;
use crate::statement::{Completion, Exec, SqlWriter, Statement, StatementOutput};
use relate_core::{EntityRef, EntityType, FieldValue, MetadataRegistry, Result, Row, Value};
use std::collections::HashSet;
use std::sync::Arc;

#[derive(Debug)]
struct Retrieve {
    entity: Arc<EntityType>,
    property: &'static str,
    value: Value,
    /// Delete request waiting for the rows
    request: RequestId,
}

#[derive(Debug, Default)]
pub(crate) struct Loader {
    loads: Vec<(RequestId, EntityRef)>,
    retrieves: Vec<Retrieve>,
    /// Requests whose instance is being read
    waiting: HashSet<RequestId>,
}

impl Loader {
    /// Queue a read of the row behind `instance`; `request` resumes once it
    /// is filled.
    pub(crate) fn load(&mut self, request: RequestId, instance: EntityRef) {
        if self.waiting.insert(request) {
            tracing::trace!(instance = %describe(&instance), "Load queued");
            self.loads.push((request, instance));
        }
    }

    /// Queue a read of every `entity` row where `property = value`.
    pub(crate) fn retrieve(
        &mut self,
        entity: &Arc<EntityType>,
        property: &'static str,
        value: Value,
        request: RequestId,
    ) {
        let duplicate = self.retrieves.iter().any(|r| {
            r.request == request
                && r.entity.name == entity.name
                && r.property == property
                && r.value.same_key(&value)
        });
        if !duplicate {
            self.retrieves.push(Retrieve {
                entity: Arc::clone(entity),
                property,
                value,
                request,
            });
        }
    }

    pub(crate) fn is_waiting(&self, request: RequestId) -> bool {
        self.waiting.contains(&request)
    }

    pub(crate) fn has_pending(&self) -> bool {
        !self.loads.is_empty() || !self.retrieves.is_empty()
    }
}

/// Drain the queued reads into SELECT statements.
pub(crate) fn take_statements(ctx: &mut OperationContext) -> Result<Vec<Statement>> {
    let loads = std::mem::take(&mut ctx.loader.loads);
    let retrieves = std::mem::take(&mut ctx.loader.retrieves);
    let chunk = ctx.config.chunk_size();
    let mut statements = Vec::new();

    let mut by_type: Vec<(Arc<EntityType>, Vec<(RequestId, EntityRef)>)> = Vec::new();
    for (request, instance) in loads {
        match by_type
            .iter_mut()
            .find(|(ty, _)| ty.name == instance.type_name())
        {
            Some((_, batch)) => batch.push((request, instance)),
            None => by_type.push((Arc::clone(instance.entity_type()), vec![(request, instance)])),
        }
    }
    for (ty, batch) in by_type {
        match ty.id_property() {
            Some(id_prop) => {
                for rows in batch.chunks(chunk) {
                    let ids: Vec<Value> = rows.iter().filter_map(|(_, e)| e.id()).collect();
                    let mut w = select(ctx, &ty);
                    w.push(" WHERE ").in_list(id_prop.column, &ids);
                    statements.push(w.build(
                        Exec::Query,
                        Completion::Load(LoadBatch {
                            entity: Arc::clone(&ty),
                            rows: rows.to_vec(),
                        }),
                    ));
                }
            }
            None => {
                // no id: each instance is matched on its known values
                for (request, instance) in batch {
                    let mut w = select(ctx, &ty);
                    w.push(" WHERE ");
                    write_row_match(&mut w, &ty, &instance)?;
                    statements.push(w.build(
                        Exec::Query,
                        Completion::Load(LoadBatch {
                            entity: Arc::clone(&ty),
                            rows: vec![(request, instance)],
                        }),
                    ));
                }
            }
        }
    }

    let mut groups: Vec<RetrieveBatch> = Vec::new();
    for retrieve in retrieves {
        let parent = (retrieve.request, retrieve.value);
        match groups
            .iter_mut()
            .find(|g| g.entity.name == retrieve.entity.name && g.property == retrieve.property)
        {
            Some(group) => group.parents.push(parent),
            None => groups.push(RetrieveBatch {
                entity: retrieve.entity,
                property: retrieve.property,
                parents: vec![parent],
            }),
        }
    }
    for group in groups {
        let prop = group.entity.require_property(group.property)?;
        for parents in group.parents.chunks(chunk) {
            let mut values: Vec<Value> = Vec::with_capacity(parents.len());
            for (_, value) in parents {
                if !values.iter().any(|v| v.same_key(value)) {
                    values.push(value.clone());
                }
            }
            let mut w = select(ctx, &group.entity);
            w.push(" WHERE ").in_list(prop.column, &values);
            statements.push(w.build(
                Exec::Query,
                Completion::Retrieve(RetrieveBatch {
                    entity: Arc::clone(&group.entity),
                    property: group.property,
                    parents: parents.to_vec(),
                }),
            ));
        }
    }
    Ok(statements)
}

fn select(ctx: &OperationContext, ty: &EntityType) -> SqlWriter {
    let mut w = SqlWriter::new(ctx.dialect);
    w.push("SELECT ");
    for (i, prop) in ty.properties.iter().enumerate() {
        if i > 0 {
            w.push(", ");
        }
        w.ident(prop.column);
    }
    w.push(" FROM ").ident(ty.table);
    w
}

/// Field values of one stored row. Foreign keys become instances through
/// the identity cache.
fn stored_values(
    ctx: &mut OperationContext,
    registry: &MetadataRegistry,
    ty: &EntityType,
    row: &Row,
) -> Result<Vec<(&'static str, FieldValue)>> {
    let mut values = Vec::with_capacity(ty.properties.len());
    for prop in &ty.properties {
        let value = row.require(prop.column)?.clone();
        let field = match prop.foreign_key {
            Some(fk) if !value.is_null() => {
                let target = registry.entity(fk.target)?;
                FieldValue::Entity(ctx.cache.reference(target, value)?)
            }
            _ => FieldValue::Value(value),
        };
        values.push((prop.name, field));
    }
    Ok(values)
}

/// Rows read for not loaded instances.
#[derive(Debug)]
pub(crate) struct LoadBatch {
    entity: Arc<EntityType>,
    rows: Vec<(RequestId, EntityRef)>,
}

impl LoadBatch {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: StatementOutput,
    ) -> Result<()> {
        let rows = output.into_rows(sql)?;
        let registry = Arc::clone(&ctx.registry);
        let id_prop = self.entity.id_property();
        ctx.result.loads += 1;

        for (request, instance) in self.rows {
            ctx.loader.waiting.remove(&request);
            let row = match id_prop {
                Some(id_prop) => {
                    let id = instance.id();
                    rows.iter().find(|row| {
                        row.get_by_name(id_prop.column)
                            .zip(id.as_ref())
                            .is_some_and(|(stored, id)| stored.same_key(id))
                    })
                }
                None => rows.first(),
            };
            let Some(row) = row else {
                // already gone: nothing left to delete
                tracing::debug!(instance = %describe(&instance), "Row not found");
                ctx.graph.set_processed(request);
                ctx.graph.set_to_process(request, false);
                continue;
            };
            let values = stored_values(ctx, &registry, &self.entity, row)?;
            instance.fill_from_store(values);
            tracing::trace!(instance = %describe(&instance), "Instance loaded");
        }
        Ok(())
    }
}

/// Rows referencing deleted rows, read so their own links can be cascaded.
#[derive(Debug)]
pub(crate) struct RetrieveBatch {
    entity: Arc<EntityType>,
    property: &'static str,
    /// (waiting delete request, referenced value)
    parents: Vec<(RequestId, Value)>,
}

impl RetrieveBatch {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: StatementOutput,
    ) -> Result<()> {
        let rows = output.into_rows(sql)?;
        let registry = Arc::clone(&ctx.registry);
        let prop = self.entity.require_property(self.property)?;
        ctx.result.loads += 1;
        tracing::debug!(
            entity = self.entity.name,
            property = self.property,
            rows = rows.len(),
            "Referencing rows retrieved"
        );

        for row in &rows {
            let stored_ref = row.require(prop.column)?.clone();
            let child = match self.entity.id_property() {
                Some(id_prop) => {
                    let id = row.require(id_prop.column)?.clone();
                    let child = ctx.cache.reference(&self.entity, id)?;
                    if !child.is_loaded() {
                        let values = stored_values(ctx, &registry, &self.entity, row)?;
                        child.fill_from_store(values);
                    }
                    child
                }
                None => {
                    let values = stored_values(ctx, &registry, &self.entity, row)?;
                    EntityRef::from_store(&self.entity, values)
                }
            };
            if child.is_deleted() {
                continue;
            }
            let current = child.get(prop.name)?;
            for (parent_request, parent_value) in &self.parents {
                if !stored_ref.same_key(parent_value) {
                    continue;
                }
                if current != FieldValue::Value(parent_value.clone()) {
                    // moved to another parent in memory
                    continue;
                }
                let delete = DeleteProcessor::add_to_process(ctx, &child)?;
                ctx.graph.depends_on(*parent_request, delete)?;
            }
        }
        Ok(())
    }
}
