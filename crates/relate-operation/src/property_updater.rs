//! Bulk redirection of a property without loading rows.
//!
//! `update(type, property, where_value, new_value)` schedules
//! `UPDATE t SET property = new_value WHERE property = where_value`. Ready
//! requests sharing `(type, property, new_value)` are coalesced into one
//! statement with an `IN` list. Rows that are also the target of a pending
//! save in the same operation are excluded; that save writes the property
//! itself.

use crate::delete::stored_id;
use crate::instance::describe;
use crate::operation::OperationContext;
use crate::request::{RequestGraph, RequestId, RequestKind};
use crate::statement::{Completion, Exec, SqlWriter, Statement, StatementOutput};
use relate_core::{EntityType, FieldValue, Result, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug)]
struct UpdateRequest {
    entity: Arc<EntityType>,
    property: &'static str,
    where_value: Value,
    new_value: Value,
}

#[derive(Debug, Default)]
pub(crate) struct PropertyUpdater {
    requests: BTreeMap<RequestId, UpdateRequest>,
    /// (type, property, where hash) -> candidates
    index: HashMap<(&'static str, &'static str, u64), Vec<RequestId>>,
}

impl PropertyUpdater {
    /// The request updating `property` from `where_value` to `new_value`,
    /// created if absent.
    pub(crate) fn update(
        &mut self,
        graph: &mut RequestGraph,
        entity: &Arc<EntityType>,
        property: &'static str,
        where_value: Value,
        new_value: Value,
    ) -> RequestId {
        if let Some(id) = self.find(entity.name, property, &where_value, &new_value) {
            return id;
        }
        let key = (entity.name, property, where_value.key_hash());
        let label = format!(
            "{} {}.{} {:?} -> {:?}",
            RequestKind::PropertyUpdate,
            entity.name,
            property,
            where_value,
            new_value
        );
        let id = graph.add(RequestKind::PropertyUpdate, label);
        self.index.entry(key).or_default().push(id);
        self.requests.insert(
            id,
            UpdateRequest {
                entity: Arc::clone(entity),
                property,
                where_value,
                new_value,
            },
        );
        id
    }

    /// The existing request updating `property` from `where_value` to `new_value`.
    pub(crate) fn find(
        &self,
        entity: &'static str,
        property: &'static str,
        where_value: &Value,
        new_value: &Value,
    ) -> Option<RequestId> {
        let candidates = self.index.get(&(entity, property, where_value.key_hash()))?;
        candidates.iter().copied().find(|id| {
            let existing = &self.requests[id];
            existing.where_value.same_key(where_value) && existing.new_value.same_key(new_value)
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

/// One coalesced statement in the making.
#[derive(Debug)]
struct UpdateGroup {
    entity: Arc<EntityType>,
    property: &'static str,
    new_value: Value,
    where_values: Vec<Value>,
    requests: Vec<RequestId>,
}

/// Render statements for every ready property update.
pub(crate) fn execute_requests(ctx: &mut OperationContext) -> Result<Vec<Statement>> {
    let ids: Vec<RequestId> = ctx.updater.requests.keys().copied().collect();
    let mut groups: Vec<UpdateGroup> = Vec::new();
    for id in ids {
        if !ctx.graph.can_execute_request(id) {
            continue;
        }
        let request = &ctx.updater.requests[&id];
        let group = groups.iter_mut().find(|g| {
            g.entity.name == request.entity.name
                && g.property == request.property
                && g.new_value.same_key(&request.new_value)
        });
        match group {
            Some(group) => {
                group.where_values.push(request.where_value.clone());
                group.requests.push(id);
            }
            None => groups.push(UpdateGroup {
                entity: Arc::clone(&request.entity),
                property: request.property,
                new_value: request.new_value.clone(),
                where_values: vec![request.where_value.clone()],
                requests: vec![id],
            }),
        }
    }

    let mut statements = Vec::with_capacity(groups.len());
    for group in groups {
        statements.push(render(ctx, group)?);
    }
    Ok(statements)
}

fn render(ctx: &mut OperationContext, group: UpdateGroup) -> Result<Statement> {
    let ty = &group.entity;
    let prop = ty.require_property(group.property)?;

    // rows a pending save is about to write are left to that save
    let mut excluded = Vec::new();
    let pending: Vec<_> = ctx
        .saves
        .requests
        .iter()
        .filter(|(id, instance)| {
            instance.type_name() == ty.name && instance.is_persisted() && !ctx.graph.is_done(*id)
        })
        .map(|(_, instance)| instance.clone())
        .collect();
    for instance in pending {
        let Some(stored) = instance.persisted_value(prop.name) else {
            continue;
        };
        let stored = stored.column_value();
        if !group.where_values.iter().any(|v| v.same_key(&stored)) {
            continue;
        }
        if !instance.is_modified(prop.name) {
            instance.set(prop.name, group.new_value.clone())?;
        }
        if let Some(id) = stored_id(&instance) {
            tracing::trace!(instance = %describe(&instance), "Excluded from bulk update");
            excluded.push(id);
        }
    }

    let mut w = SqlWriter::new(ctx.dialect);
    w.push("UPDATE ")
        .ident(ty.table)
        .push(" SET ")
        .ident(prop.column)
        .push(" = ")
        .bind(group.new_value.clone());
    if let Some(vp) = ty.version_property() {
        w.push(", ")
            .ident(vp.column)
            .push(" = ")
            .ident(vp.column)
            .push(" + 1");
    }
    w.push(" WHERE ").in_list(prop.column, &group.where_values);
    if let Some(id_prop) = ty.id_property().filter(|_| !excluded.is_empty()) {
        w.push(" AND NOT (").in_list(id_prop.column, &excluded).push(")");
    }

    tracing::debug!(
        entity = ty.name,
        property = prop.name,
        values = group.where_values.len(),
        excluded = excluded.len(),
        "Bulk property update"
    );
    Ok(w.build(
        Exec::Execute,
        Completion::PropertyUpdate(BulkUpdate {
            entity: Arc::clone(ty),
            property: prop.name,
            where_values: group.where_values,
            new_value: group.new_value,
            excluded,
            requests: group.requests,
        }),
    ))
}

/// Rows redirected by one bulk UPDATE.
#[derive(Debug)]
pub(crate) struct BulkUpdate {
    entity: Arc<EntityType>,
    property: &'static str,
    where_values: Vec<Value>,
    new_value: Value,
    excluded: Vec<Value>,
    requests: Vec<RequestId>,
}

impl BulkUpdate {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: &StatementOutput,
    ) -> Result<()> {
        let affected = output.affected(sql)?;
        ctx.result.bulk_updated += affected;
        for request in &self.requests {
            ctx.graph.mark_executed(*request);
        }

        // keep loaded instances in line with the rows just written
        let version = self.entity.version_property();
        for instance in ctx.cache.instances_of(self.entity.name) {
            if !instance.is_loaded() || instance.is_modified(self.property) {
                continue;
            }
            let matched = instance
                .persisted_value(self.property)
                .is_some_and(|v| self.where_values.iter().any(|w| w.same_key(&v.column_value())));
            let excluded = instance
                .id()
                .is_some_and(|id| self.excluded.iter().any(|e| e.same_key(&id)));
            if !matched || excluded {
                continue;
            }
            instance.assign_persisted(self.property, FieldValue::Value(self.new_value.clone()))?;
            if let Some(vp) = version {
                if !instance.is_modified(vp.name) {
                    let bumped = instance
                        .persisted_value(vp.name)
                        .and_then(|v| v.column_value().as_i64())
                        .map(|v| vp.sql_type.integer_value(v + 1))
                        .transpose()?;
                    if let Some(bumped) = bumped {
                        instance.assign_persisted(vp.name, bumped)?;
                    }
                }
            }
        }
        tracing::debug!(
            entity = self.entity.name,
            property = self.property,
            affected,
            "Rows redirected"
        );
        Ok(())
    }
}
