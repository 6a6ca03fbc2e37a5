//! Identity cache for one operation.
//!
//! The cache ensures each stored row corresponds to exactly one
//! [`EntityRef`] within an operation:
//!
//! - **Uniqueness**: two handles carrying the same type and id resolve to the
//!   first one seen, so the row gets a single request
//! - **Stubs**: foreign key columns read from the store resolve to a cached
//!   instance, or to a new not loaded reference
//!
//! Instances without an id (not inserted yet) are not cached; their handle
//! is their identity.

use relate_core::{EntityRef, EntityType, Result, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct InstanceCache {
    /// (type name, id hash) -> instances; buckets hold hash collisions
    by_id: HashMap<(&'static str, u64), Vec<EntityRef>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached instance of `type_name` with the given id.
    pub fn find(&self, type_name: &'static str, id: &Value) -> Option<EntityRef> {
        let bucket = self.by_id.get(&(type_name, id.key_hash()))?;
        bucket
            .iter()
            .find(|e| e.id().is_some_and(|v| v.same_key(id)))
            .cloned()
    }

    /// The canonical handle for `instance`, registering it if its row is new
    /// to the cache.
    pub fn resolve(&mut self, instance: &EntityRef) -> EntityRef {
        let Some(id) = instance.id() else {
            return instance.clone();
        };
        let bucket = self
            .by_id
            .entry((instance.type_name(), id.key_hash()))
            .or_default();
        if let Some(existing) = bucket
            .iter()
            .find(|e| e.id().is_some_and(|v| v.same_key(&id)))
        {
            return existing.clone();
        }
        bucket.push(instance.clone());
        instance.clone()
    }

    /// Cached instance for `id`, or a new not loaded reference to it.
    pub fn reference(&mut self, ty: &Arc<EntityType>, id: Value) -> Result<EntityRef> {
        if let Some(existing) = self.find(ty.name, &id) {
            return Ok(existing);
        }
        let stub = EntityRef::reference(ty, id)?;
        tracing::trace!(entity = ty.name, id = ?stub.id(), "Reference created");
        Ok(self.resolve(&stub))
    }

    /// Record an instance whose id just became known.
    pub fn register(&mut self, instance: &EntityRef) {
        let canonical = self.resolve(instance);
        if !canonical.ptr_eq(instance) {
            tracing::warn!(
                entity = instance.type_name(),
                id = ?instance.id(),
                "Another instance already holds this id"
            );
        }
    }

    /// All cached instances of one type.
    pub fn instances_of(&self, type_name: &str) -> Vec<EntityRef> {
        self.by_id
            .iter()
            .filter(|((name, _), _)| *name == type_name)
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_id.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
