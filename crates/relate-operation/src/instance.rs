//! Shared lifecycle of per-instance requests.
//!
//! [`InstanceProcessor`] holds the machinery common to saves and deletes:
//! deduplication through the identity cache, graph discovery (walking every
//! foreign key and inverse field of a request's instance exactly once) and
//! batching ready requests per entity type. Implementors inject the cascade
//! rules through the `process_*` hooks and render statements in
//! `do_requests`.

use crate::operation::OperationContext;
use crate::request::{RequestId, RequestKind};
use crate::statement::Statement;
use relate_core::{
    EntityRef, EntityType, Error, FieldValue, ForeignTableInfo, ModelAccessErrorKind, PropertyInfo,
    Result,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Requests of one processor, keyed by instance.
#[derive(Debug, Default)]
pub struct InstanceRequests {
    /// Canonical instance address -> request
    by_instance: HashMap<usize, RequestId>,
    /// Registration order
    requests: BTreeMap<RequestId, EntityRef>,
}

impl InstanceRequests {
    pub fn get(&self, instance: &EntityRef) -> Option<RequestId> {
        self.by_instance.get(&instance.key()).copied()
    }

    pub fn instance(&self, id: RequestId) -> Option<&EntityRef> {
        self.requests.get(&id)
    }

    fn insert(&mut self, id: RequestId, instance: EntityRef) {
        self.by_instance.insert(instance.key(), id);
        self.requests.insert(id, instance);
    }

    pub fn iter(&self) -> impl Iterator<Item = (RequestId, &EntityRef)> {
        self.requests.iter().map(|(id, e)| (*id, e))
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn snapshot(&self) -> Vec<(RequestId, EntityRef)> {
        self.requests
            .iter()
            .map(|(id, e)| (*id, e.clone()))
            .collect()
    }
}

/// Short human readable description used in request labels.
pub(crate) fn describe(instance: &EntityRef) -> String {
    match instance.id() {
        Some(id) => format!("{}({:?})", instance.type_name(), id),
        None => format!("{}(new@{:x})", instance.type_name(), instance.key()),
    }
}

pub(crate) trait InstanceProcessor {
    const KIND: RequestKind;

    fn requests(ctx: &OperationContext) -> &InstanceRequests;

    fn requests_mut(ctx: &mut OperationContext) -> &mut InstanceRequests;

    /// Whether a new request for `instance` has anything to write.
    fn initially_to_process(_instance: &EntityRef) -> bool {
        true
    }

    /// Whether the instance row must be read before it can be processed.
    fn needs_load(_ctx: &OperationContext, _instance: &EntityRef) -> bool {
        false
    }

    /// Called once when a request is created, before any cascade ran.
    fn registered(_ctx: &mut OperationContext, _request: RequestId, _instance: &EntityRef) {}

    /// Decide whether the request needs processing at all.
    fn do_process(ctx: &mut OperationContext, request: RequestId, instance: &EntityRef)
    -> Result<bool>;

    fn process_foreign_key(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
        fk: &PropertyInfo,
        inverse: Option<ForeignTableInfo>,
    ) -> Result<()>;

    /// `value` is `None` when the inverse field is not loaded.
    fn process_foreign_table_field(
        ctx: &mut OperationContext,
        request: RequestId,
        instance: &EntityRef,
        field: ForeignTableInfo,
        value: Option<FieldValue>,
    ) -> Result<()>;

    /// Render statements for ready requests of one entity type.
    ///
    /// Requests that turn out to need no statement are marked executed here.
    fn do_requests(
        ctx: &mut OperationContext,
        ty: &Arc<EntityType>,
        batch: Vec<(RequestId, EntityRef)>,
    ) -> Result<Vec<Statement>>;

    /// The request for `instance`, created if absent.
    fn add_to_process(ctx: &mut OperationContext, instance: &EntityRef) -> Result<RequestId> {
        Self::add(ctx, instance, true)
    }

    /// Register `instance` as context only; nothing is written for it.
    fn add_to_not_process(ctx: &mut OperationContext, instance: &EntityRef) -> Result<RequestId> {
        Self::add(ctx, instance, false)
    }

    fn add(ctx: &mut OperationContext, instance: &EntityRef, to_process: bool) -> Result<RequestId> {
        if instance.is_deleted() {
            return Err(Error::model(
                ModelAccessErrorKind::Deleted,
                instance.type_name(),
                None,
                format!("cannot {} a deleted instance", Self::KIND),
            ));
        }
        let instance = ctx.cache.resolve(instance);
        if let Some(id) = Self::requests(ctx).get(&instance) {
            let upgrade = to_process
                && !ctx.graph.to_process(id)
                && !ctx.graph.is_processed(id)
                && Self::initially_to_process(&instance);
            if upgrade {
                ctx.graph.set_to_process(id, true);
            }
            return Ok(id);
        }
        let to_process = to_process && Self::initially_to_process(&instance);
        let label = format!("{} {}", Self::KIND, describe(&instance));
        let id = ctx.graph.add_instance(Self::KIND, label, to_process);
        tracing::trace!(request = %ctx.graph.label(id), to_process, "Request registered");
        Self::requests_mut(ctx).insert(id, instance.clone());
        Self::registered(ctx, id, &instance);
        Ok(id)
    }

    /// Process every new request; returns whether anything was processed.
    fn process_requests(ctx: &mut OperationContext) -> Result<bool> {
        let pending: Vec<(RequestId, EntityRef)> = Self::requests(ctx)
            .snapshot()
            .into_iter()
            .filter(|(id, _)| {
                ctx.graph.to_process(*id) && !ctx.graph.is_processed(*id) && !ctx.loader.is_waiting(*id)
            })
            .collect();
        let mut processed = false;
        for (id, instance) in pending {
            if ctx.graph.is_processed(id) || !ctx.graph.to_process(id) {
                continue;
            }
            Self::process(ctx, id, &instance)?;
            processed = true;
        }
        Ok(processed)
    }

    /// Walk foreign keys and inverse fields of one request.
    fn process(ctx: &mut OperationContext, request: RequestId, instance: &EntityRef) -> Result<()> {
        if Self::needs_load(ctx, instance) {
            ctx.loader.load(request, instance.clone());
            return Ok(());
        }
        ctx.graph.set_processed(request);
        if !Self::do_process(ctx, request, instance)? {
            ctx.graph.set_to_process(request, false);
            tracing::trace!(request = %ctx.graph.label(request), "Nothing to do");
            return Ok(());
        }
        let registry = Arc::clone(&ctx.registry);
        let ty = Arc::clone(instance.entity_type());
        for fk in ty.foreign_keys() {
            let inverse = registry.foreign_table_for_key(&ty, fk).copied();
            Self::process_foreign_key(ctx, request, instance, fk, inverse)?;
        }
        for field in &ty.foreign_tables {
            let value = instance.foreign_table(field.field)?;
            Self::process_foreign_table_field(ctx, request, instance, *field, value)?;
        }
        Ok(())
    }

    /// Render statements for every processed, ready request, per entity type.
    fn execute_requests(ctx: &mut OperationContext) -> Result<Vec<Statement>> {
        let candidates = Self::requests(ctx).snapshot();
        let mut groups: Vec<(Arc<EntityType>, Vec<(RequestId, EntityRef)>)> = Vec::new();
        let mut index: HashMap<&'static str, usize> = HashMap::new();
        for (id, instance) in candidates {
            if !ctx.graph.is_processed(id) || !ctx.graph.can_execute_request(id) {
                continue;
            }
            let slot = *index.entry(instance.type_name()).or_insert_with(|| {
                groups.push((Arc::clone(instance.entity_type()), Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push((id, instance));
        }

        let mut statements = Vec::new();
        for (ty, batch) in groups {
            tracing::debug!(
                kind = %Self::KIND,
                entity = ty.name,
                requests = batch.len(),
                "Executing requests"
            );
            statements.extend(Self::do_requests(ctx, &ty, batch)?);
        }
        Ok(statements)
    }
}
