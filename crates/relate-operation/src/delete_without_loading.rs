//! Delete rows by criteria, without reading them first.
//!
//! Used when the children of a deleted row have nothing else that must be
//! cascaded: `DELETE FROM t WHERE property IN (...)` removes them all.

use crate::operation::{Deferred, OperationContext};
use crate::request::{RequestGraph, RequestId, RequestKind};
use crate::statement::{Completion, Exec, SqlWriter, Statement, StatementOutput};
use relate_core::{EntityType, Result, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Debug)]
struct CriteriaRequest {
    entity: Arc<EntityType>,
    property: &'static str,
    value: Value,
}

#[derive(Debug, Default)]
pub(crate) struct DeleteWithoutLoading {
    requests: BTreeMap<RequestId, CriteriaRequest>,
    index: HashMap<(&'static str, &'static str, u64), Vec<RequestId>>,
}

impl DeleteWithoutLoading {
    /// The request deleting rows of `entity` where `property = value`,
    /// created if absent.
    pub(crate) fn add_request(
        &mut self,
        graph: &mut RequestGraph,
        entity: &Arc<EntityType>,
        property: &'static str,
        value: Value,
    ) -> RequestId {
        let key = (entity.name, property, value.key_hash());
        if let Some(candidates) = self.index.get(&key) {
            if let Some(id) = candidates
                .iter()
                .find(|id| self.requests[*id].value.same_key(&value))
            {
                return *id;
            }
        }
        let label = format!(
            "{} {}.{} = {:?}",
            RequestKind::DeleteWithoutLoading,
            entity.name,
            property,
            value
        );
        let id = graph.add(RequestKind::DeleteWithoutLoading, label);
        self.index.entry(key).or_default().push(id);
        self.requests.insert(
            id,
            CriteriaRequest {
                entity: Arc::clone(entity),
                property,
                value,
            },
        );
        id
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Render one DELETE per `(type, property)` for the ready requests.
pub(crate) fn execute_requests(ctx: &mut OperationContext) -> Result<Vec<Statement>> {
    let ids: Vec<RequestId> = ctx.criteria.requests.keys().copied().collect();
    let mut groups: Vec<CriteriaBatch> = Vec::new();
    for id in ids {
        if !ctx.graph.can_execute_request(id) {
            continue;
        }
        let request = &ctx.criteria.requests[&id];
        match groups
            .iter_mut()
            .find(|g| g.entity.name == request.entity.name && g.property == request.property)
        {
            Some(group) => {
                group.values.push(request.value.clone());
                group.requests.push(id);
            }
            None => groups.push(CriteriaBatch {
                entity: Arc::clone(&request.entity),
                property: request.property,
                values: vec![request.value.clone()],
                requests: vec![id],
            }),
        }
    }

    let chunk = ctx.config.chunk_size();
    let mut statements = Vec::new();
    for group in groups {
        let prop = group.entity.require_property(group.property)?;
        let column = prop.column;
        let mut requests = group.requests.into_iter();
        for values in group.values.chunks(chunk) {
            let mut w = SqlWriter::new(ctx.dialect);
            w.push("DELETE FROM ")
                .ident(group.entity.table)
                .push(" WHERE ")
                .in_list(column, values);
            tracing::debug!(
                entity = group.entity.name,
                property = group.property,
                values = values.len(),
                "Delete by criteria"
            );
            statements.push(w.build(
                Exec::Execute,
                Completion::CriteriaDelete(CriteriaBatch {
                    entity: Arc::clone(&group.entity),
                    property: group.property,
                    values: values.to_vec(),
                    requests: requests.by_ref().take(values.len()).collect(),
                }),
            ));
        }
    }
    Ok(statements)
}

/// Rows removed by one criteria DELETE.
#[derive(Debug)]
pub(crate) struct CriteriaBatch {
    entity: Arc<EntityType>,
    property: &'static str,
    values: Vec<Value>,
    requests: Vec<RequestId>,
}

impl CriteriaBatch {
    pub(crate) fn complete(
        self,
        ctx: &mut OperationContext,
        sql: &str,
        output: &StatementOutput,
    ) -> Result<()> {
        let affected = output.affected(sql)?;
        ctx.result.bulk_deleted += affected;
        for request in &self.requests {
            ctx.graph.mark_executed(*request);
        }

        // cached instances of the removed rows are deleted too
        let removed: Vec<_> = ctx
            .cache
            .instances_of(self.entity.name)
            .into_iter()
            .filter(|instance| {
                instance.is_loaded()
                    && !instance.is_deleted()
                    && instance.persisted_value(self.property).is_some_and(|v| {
                        let v = v.column_value();
                        self.values.iter().any(|w| w.same_key(&v))
                    })
            })
            .collect();
        tracing::debug!(
            entity = self.entity.name,
            affected,
            cached = removed.len(),
            "Rows deleted by criteria"
        );
        if !removed.is_empty() {
            ctx.deferred.push(Deferred::MarkDeleted(removed));
        }
        Ok(())
    }
}
