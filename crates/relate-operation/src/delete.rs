//! Cascading delete.
//!
//! A delete request removes the stored row of a persisted instance. Before
//! that can happen every row referencing it is handled according to the
//! referencing foreign key: nulled in bulk ([`OnForeignDeleted::SetNull`]),
//! deleted by criteria when nothing else links to the child type, or loaded
//! and deleted one by one so the cascade can continue through the child.

use crate::instance::{InstanceProcessor, InstanceRequests, describe};
use crate::operation::{Deferred, OperationContext};
use crate::request::{RequestId, RequestKind};
use crate::save::write_row_match;
use crate::statement::{Completion, Exec, SqlWriter, Statement, StatementOutput};
use relate_core::{
    EntityRef, EntityType, Error, FieldValue, ForeignKeyInfo, ForeignTableInfo,
    ModelAccessErrorKind, OnForeignDeleted, PropertyInfo, Result, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub(crate) struct DeleteProcessor {
    pub(crate) requests: InstanceRequests,
    /// Stored values of instances without id, taken before any cascade
    /// could null one of them
    snapshots: HashMap<RequestId, Vec<(&'static str, Value)>>,
}

impl InstanceProcessor for DeleteProcessor {
    const KIND: RequestKind = RequestKind::Delete;

    fn requests(ctx: &OperationContext) -> &InstanceRequests {
        &ctx.deletes.requests
    }

    fn requests_mut(ctx: &mut OperationContext) -> &mut InstanceRequests {
        &mut ctx.deletes.requests
    }

    /// Rows without id are matched on their stored values; keep them before
    /// a cascade of this operation nulls a foreign key in memory.
    fn registered(ctx: &mut OperationContext, request: RequestId, instance: &EntityRef) {
        let keyless = instance.entity_type().id_property().is_none();
        if keyless && instance.is_persisted() && instance.is_loaded() {
            if let Ok(values) = stored_values(instance) {
                ctx.deletes.snapshots.insert(request, values);
            }
        }
    }

    /// Cascading through a foreign key needs its value.
    fn needs_load(ctx: &OperationContext, instance: &EntityRef) -> bool {
        if !instance.is_persisted() || instance.is_loaded() {
            return false;
        }
        let ty = instance.entity_type();
        ty.id_property().is_none()
            || ty.foreign_keys().any(|fk| {
                fk.foreign_key.is_some_and(|info| {
                    deletes_target(info, ctx.registry.foreign_table_for_key(ty, fk).copied())
                })
            })
    }

    fn do_process(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
    ) -> Result<bool> {
        if !instance.is_persisted() {
            return Ok(false);
        }
        let ty = Arc::clone(instance.entity_type());
        if ty.id_property().is_none() && !ctx.deletes.snapshots.contains_key(&request) {
            let values = stored_values(instance)?;
            ctx.deletes.snapshots.insert(request, values);
        }

        // foreign keys without an inverse field are only visible from here
        let registry = Arc::clone(&ctx.registry);
        for (child_ty, fk) in registry.inbound_foreign_keys(ty.name) {
            if registry.foreign_table_for_key(child_ty, fk).is_none() {
                cascade_children(ctx, request, instance, child_ty, fk, None)?;
            }
        }
        Ok(true)
    }

    fn process_foreign_key(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
        fk: &PropertyInfo,
        inverse: Option<ForeignTableInfo>,
    ) -> Result<()> {
        let Some(fk_info) = fk.foreign_key else {
            return Ok(());
        };
        let current = instance.get(fk.name)?;
        let target = match &current {
            FieldValue::Entity(e) => Some(ctx.cache.resolve(e)),
            FieldValue::Value(v) if !v.is_null() => ctx.cache.find(fk_info.target, v),
            _ => None,
        };
        if fk_info.on_foreign_deleted == OnForeignDeleted::SetNull {
            if let Some(stored) = instance.persisted_value(fk.name) {
                let stored = stored.column_value();
                let update =
                    ctx.updater
                        .find(instance.type_name(), fk.name, &stored, &Value::Null);
                if let Some(update) = update {
                    // the row goes before the bulk update rewrites its reference
                    ctx.graph.depends_on(update, request)?;
                }
            }
        }
        if let (Some(target), Some(ft)) = (&target, inverse) {
            if target.is_loaded() {
                target.detach_foreign_table(ft.field, instance)?;
            }
        }
        if !deletes_target(fk_info, inverse) {
            return Ok(());
        }
        let target = match (target, current) {
            (Some(target), _) => target,
            (None, FieldValue::Value(id)) if !id.is_null() => {
                let registry = Arc::clone(&ctx.registry);
                let target_ty = registry.entity(fk_info.target)?;
                ctx.cache.reference(target_ty, id)?
            }
            _ => return Ok(()),
        };
        if target.is_deleted() {
            return Ok(());
        }
        tracing::debug!(
            instance = %describe(instance),
            target = %describe(&target),
            property = fk.name,
            "Referenced instance deleted"
        );
        let delete = Self::add_to_process(ctx, &target)?;
        // the referencing row goes first
        ctx.graph.depends_on(delete, request)
    }

    fn process_foreign_table_field(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
        field: ForeignTableInfo,
        value: Option<FieldValue>,
    ) -> Result<()> {
        let registry = Arc::clone(&ctx.registry);
        let child_ty = registry.entity(field.target)?;
        let fk = child_ty.require_property(field.join_key)?;
        let loaded = value.map(|value| {
            let mut members = value.entities();
            // members removed in memory still reference this row in the store
            if let Some(stored) = instance.persisted_foreign_table(field.field) {
                for member in stored.entities() {
                    if !members.iter().any(|m| m.ptr_eq(&member)) {
                        members.push(member);
                    }
                }
            }
            members
        });
        cascade_children(ctx, request, instance, child_ty, fk, loaded)
    }

    fn do_requests(
        ctx: &mut OperationContext,
        ty: &Arc<EntityType>,
        batch: Vec<(RequestId, EntityRef)>,
    ) -> Result<Vec<Statement>> {
        let chunk = ctx.config.chunk_size();
        let mut statements = Vec::new();
        if let Some(id_prop) = ty.id_property() {
            let mut rows = Vec::with_capacity(batch.len());
            for (request, instance) in batch {
                let id = stored_id(&instance).ok_or_else(|| {
                    Error::model(
                        ModelAccessErrorKind::MissingId,
                        ty.name,
                        Some(id_prop.name),
                        "persisted instance has no id",
                    )
                })?;
                rows.push((request, instance, id));
            }
            for chunk_rows in rows.chunks(chunk) {
                let ids: Vec<Value> = chunk_rows.iter().map(|(_, _, id)| id.clone()).collect();
                let mut w = SqlWriter::new(ctx.dialect);
                w.push("DELETE FROM ")
                    .ident(ty.table)
                    .push(" WHERE ")
                    .in_list(id_prop.column, &ids);
                statements.push(w.build(
                    Exec::Execute,
                    Completion::Delete(DeleteBatch {
                        entity: Arc::clone(ty),
                        rows: chunk_rows
                            .iter()
                            .map(|(request, instance, _)| (*request, instance.clone()))
                            .collect(),
                    }),
                ));
            }
            return Ok(statements);
        }

        for chunk_rows in batch.chunks(chunk) {
            let mut w = SqlWriter::new(ctx.dialect);
            w.push("DELETE FROM ").ident(ty.table).push(" WHERE ");
            for (i, (request, instance)) in chunk_rows.iter().enumerate() {
                if i > 0 {
                    w.push(" OR ");
                }
                w.push("(");
                match ctx.deletes.snapshots.get(request) {
                    Some(values) => {
                        for (j, (column, value)) in values.iter().enumerate() {
                            if j > 0 {
                                w.push(" AND ");
                            }
                            w.equals(column, value.clone());
                        }
                    }
                    None => write_row_match(&mut w, ty, instance)?,
                }
                w.push(")");
            }
            statements.push(w.build(
                Exec::Execute,
                Completion::Delete(DeleteBatch {
                    entity: Arc::clone(ty),
                    rows: chunk_rows.to_vec(),
                }),
            ));
        }
        Ok(statements)
    }
}

/// Whether deleting a referencing row also deletes the row it references.
///
/// A collection inverse only loses a member. A scalar inverse takes the
/// referenced row with it unless it is optional and no cascade is forced.
fn deletes_target(fk_info: ForeignKeyInfo, inverse: Option<ForeignTableInfo>) -> bool {
    match inverse {
        Some(ft) if ft.collection => false,
        Some(ft) => fk_info.cascade_delete || !ft.optional,
        None => fk_info.cascade_delete,
    }
}

/// Id of the stored row of `instance`.
pub(crate) fn stored_id(instance: &EntityRef) -> Option<Value> {
    let id_prop = instance.entity_type().id_property()?;
    instance
        .persisted_value(id_prop.name)
        .map(|v| v.column_value())
        .filter(|v| !v.is_null())
        .or_else(|| instance.id())
}

/// Handle the rows of `child_ty` whose foreign key `fk` references `parent`.
///
/// `loaded` holds the children known in memory when the inverse field is
/// loaded; `None` means they are unknown.
fn cascade_children(
    ctx: &mut OperationContext,
    request: RequestId,
    parent: &EntityRef,
    child_ty: &Arc<EntityType>,
    fk: &PropertyInfo,
    loaded: Option<Vec<EntityRef>>,
) -> Result<()> {
    let Some(fk_info) = fk.foreign_key else {
        return Ok(());
    };
    let Some(parent_id) = stored_id(parent) else {
        return Ok(());
    };
    let parent_ref = FieldValue::Value(parent_id.clone());

    match fk_info.on_foreign_deleted {
        OnForeignDeleted::SetNull => {
            let update =
                ctx.updater
                    .update(&mut ctx.graph, child_ty, fk.name, parent_id.clone(), Value::Null);
            ctx.graph.depends_on(request, update)?;
            depend_on_pending_deletes(ctx, update, child_ty, fk, &parent_id)?;
            for child in loaded.unwrap_or_default() {
                if child.is_loaded() && !child.is_modified(fk.name) && child.get(fk.name)? == parent_ref
                {
                    child.assign_persisted(fk.name, FieldValue::NULL)?;
                }
            }
        }
        OnForeignDeleted::Delete => {
            if let Some(children) = loaded {
                for child in children {
                    if child.is_deleted() {
                        continue;
                    }
                    if child.is_loaded() && child.get(fk.name)? != parent_ref {
                        // moved to another parent
                        continue;
                    }
                    let delete = DeleteProcessor::add_to_process(ctx, &child)?;
                    ctx.graph.depends_on(request, delete)?;
                }
            } else if ctx.registry.has_other_links(child_ty, fk.name) {
                tracing::debug!(
                    parent = %describe(parent),
                    child = child_ty.name,
                    property = fk.name,
                    "Children must be loaded to cascade"
                );
                ctx.loader
                    .retrieve(child_ty, fk.name, parent_id.clone(), request);
            } else {
                let delete =
                    ctx.criteria
                        .add_request(&mut ctx.graph, child_ty, fk.name, parent_id.clone());
                ctx.graph.depends_on(request, delete)?;
                depend_on_pending_saves(ctx, delete, child_ty, fk, &parent_id)?;
            }
        }
    }
    depend_on_pending_saves(ctx, request, child_ty, fk, &parent_id)
}

/// Pending saves of rows still stored as referencing `parent_id` must be
/// written before `request` removes or rewrites those references.
fn depend_on_pending_saves(
    ctx: &mut OperationContext,
    request: RequestId,
    child_ty: &EntityType,
    fk: &PropertyInfo,
    parent_id: &Value,
) -> Result<()> {
    let pending: Vec<RequestId> = ctx
        .saves
        .requests
        .iter()
        .filter(|(id, instance)| {
            instance.type_name() == child_ty.name
                && !ctx.graph.is_done(*id)
                && instance
                    .persisted_value(fk.name)
                    .is_some_and(|v| v.column_value().same_key(parent_id))
        })
        .map(|(id, _)| id)
        .collect();
    for save in pending {
        ctx.graph.depends_on(request, save)?;
    }
    Ok(())
}

/// Rows of `child_ty` being deleted while still stored as referencing
/// `parent_id` go before `update` rewrites that reference.
fn depend_on_pending_deletes(
    ctx: &mut OperationContext,
    update: RequestId,
    child_ty: &EntityType,
    fk: &PropertyInfo,
    parent_id: &Value,
) -> Result<()> {
    let pending: Vec<RequestId> = ctx
        .deletes
        .requests
        .iter()
        .filter(|(id, instance)| {
            instance.type_name() == child_ty.name
                && !ctx.graph.is_done(*id)
                && instance
                    .persisted_value(fk.name)
                    .is_some_and(|v| v.column_value().same_key(parent_id))
        })
        .map(|(id, _)| id)
        .collect();
    for delete in pending {
        ctx.graph.depends_on(update, delete)?;
    }
    Ok(())
}

/// Stored column values of an instance, current values where none is stored.
fn stored_values(instance: &EntityRef) -> Result<Vec<(&'static str, Value)>> {
    let ty = instance.entity_type();
    let mut values = Vec::with_capacity(ty.properties.len());
    for prop in &ty.properties {
        let value = match instance.persisted_value(prop.name) {
            Some(stored) => stored.column_value(),
            None => instance.get_value(prop.name)?,
        };
        values.push((prop.column, value));
    }
    Ok(values)
}

/// Instances removed by one DELETE.
#[derive(Debug)]
pub(crate) struct DeleteBatch {
    entity: Arc<EntityType>,
    rows: Vec<(RequestId, EntityRef)>,
}

impl DeleteBatch {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: &StatementOutput,
    ) -> Result<()> {
        let affected = output.affected(sql)?;
        if usize::try_from(affected).ok() != Some(self.rows.len()) {
            tracing::debug!(
                entity = self.entity.name,
                expected = self.rows.len(),
                affected,
                "Delete affected a different number of rows"
            );
        }
        let mut instances = Vec::with_capacity(self.rows.len());
        for (request, instance) in self.rows {
            ctx.graph.mark_executed(request);
            instances.push(instance);
        }
        ctx.result.deleted += instances.len();
        tracing::debug!(entity = self.entity.name, rows = instances.len(), "Rows deleted");
        ctx.deferred.push(Deferred::MarkDeleted(instances));
        Ok(())
    }
}
