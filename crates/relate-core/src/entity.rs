//! Entity instances as shared handles.
//!
//! An [`EntityRef`] stands for one domain object. Clones share the same
//! fields and [`EntityState`], so a reference held by a parent's collection
//! and the handle the caller keeps observe the same writes. Handle identity
//! (pointer equality) is instance identity.

use crate::error::{Error, ModelAccessErrorKind, Result};
use crate::metadata::{EntityType, GeneratedValue};
use crate::state::EntityState;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Value of a property or inverse field.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// A plain column value (also a foreign key given as a raw id, or NULL)
    Value(Value),
    /// A reference to another instance
    Entity(EntityRef),
    /// The members of a one-to-many inverse field
    Collection(Vec<EntityRef>),
}

impl FieldValue {
    pub const NULL: FieldValue = FieldValue::Value(Value::Null);

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Value(Value::Null))
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            FieldValue::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Instances held by this value: none, one, or the collection members.
    pub fn entities(&self) -> Vec<EntityRef> {
        match self {
            FieldValue::Value(_) => Vec::new(),
            FieldValue::Entity(e) => vec![e.clone()],
            FieldValue::Collection(items) => items.clone(),
        }
    }

    /// The column value: a referenced instance contributes its id.
    pub fn column_value(&self) -> Value {
        match self {
            FieldValue::Value(v) => v.clone(),
            FieldValue::Entity(e) => e.id().unwrap_or(Value::Null),
            FieldValue::Collection(_) => Value::Null,
        }
    }
}

impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Value(a), FieldValue::Value(b)) => a.same_key(b),
            (FieldValue::Entity(a), FieldValue::Entity(b)) => a.same_row(b),
            (FieldValue::Collection(a), FieldValue::Collection(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_row(y))
            }
            // a raw id and a reference to the row with that id
            (FieldValue::Value(v), FieldValue::Entity(e))
            | (FieldValue::Entity(e), FieldValue::Value(v)) => {
                !v.is_null() && e.id().is_some_and(|id| id.same_key(v))
            }
            _ => false,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

impl From<EntityRef> for FieldValue {
    fn from(e: EntityRef) -> Self {
        FieldValue::Entity(e)
    }
}

impl From<&EntityRef> for FieldValue {
    fn from(e: &EntityRef) -> Self {
        FieldValue::Entity(e.clone())
    }
}

impl From<Option<EntityRef>> for FieldValue {
    fn from(e: Option<EntityRef>) -> Self {
        e.map_or(FieldValue::NULL, FieldValue::Entity)
    }
}

impl From<Vec<EntityRef>> for FieldValue {
    fn from(items: Vec<EntityRef>) -> Self {
        FieldValue::Collection(items)
    }
}

struct EntityData {
    fields: HashMap<&'static str, FieldValue>,
    /// Loaded inverse fields; a missing entry means "not loaded"
    foreign_tables: HashMap<&'static str, FieldValue>,
    state: EntityState,
}

struct Entity {
    ty: Arc<EntityType>,
    data: Mutex<EntityData>,
}

/// Shared handle to one entity instance.
///
/// A loaded inverse field and the foreign keys of its members point at each
/// other through strong handles, so a linked graph stays alive as long as
/// both sides hold on. Drop the links with
/// [`unload_foreign_tables`](EntityRef::unload_foreign_tables) once the
/// owner is no longer needed.
#[derive(Clone)]
pub struct EntityRef {
    inner: Arc<Entity>,
}

impl fmt::Debug for EntityRef {
    // Instances form cycles through inverse fields; print identity only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("type", &self.inner.ty.name)
            .field("id", &self.id())
            .finish()
    }
}

impl EntityRef {
    /// A new instance that does not exist in the store yet.
    pub fn new(ty: &Arc<EntityType>) -> Self {
        Self::with_state(ty, HashMap::new(), EntityState::transient())
    }

    /// A persisted, not loaded instance known only by its id.
    pub fn reference(ty: &Arc<EntityType>, id: impl Into<Value>) -> Result<Self> {
        let id_prop = ty.id_property().ok_or_else(|| {
            Error::model(
                ModelAccessErrorKind::MissingId,
                ty.name,
                None,
                "type has no identifier property",
            )
        })?;
        let id = FieldValue::Value(id.into());
        let mut fields = HashMap::new();
        fields.insert(id_prop.name, id.clone());
        Ok(Self::with_state(
            ty,
            fields,
            EntityState::reference(id_prop.name, id),
        ))
    }

    /// A persisted, loaded instance built from stored column values.
    pub fn from_store(ty: &Arc<EntityType>, values: Vec<(&'static str, FieldValue)>) -> Self {
        let fields: HashMap<_, _> = values.into_iter().collect();
        let state = EntityState::stored(fields.clone());
        Self::with_state(ty, fields, state)
    }

    fn with_state(
        ty: &Arc<EntityType>,
        fields: HashMap<&'static str, FieldValue>,
        state: EntityState,
    ) -> Self {
        Self {
            inner: Arc::new(Entity {
                ty: Arc::clone(ty),
                data: Mutex::new(EntityData {
                    fields,
                    foreign_tables: HashMap::new(),
                    state,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EntityData> {
        self.inner.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity_type(&self) -> &Arc<EntityType> {
        &self.inner.ty
    }

    pub fn type_name(&self) -> &'static str {
        self.inner.ty.name
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Address-based identity, stable for the life of the instance.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Current identifier value, if the type has one and it is set.
    pub fn id(&self) -> Option<Value> {
        let id_prop = self.inner.ty.id_property()?;
        let field = self.lock().fields.get(id_prop.name).cloned()?;
        let value = field.column_value();
        (!value.is_null()).then_some(value)
    }

    /// Same instance, or same type and same non-null id.
    pub fn same_row(&self, other: &EntityRef) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        if self.type_name() != other.type_name() {
            return false;
        }
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a.same_key(&b),
            _ => false,
        }
    }

    fn property_name(&self, name: &str) -> Result<&'static str> {
        self.inner.ty.require_property(name).map(|p| p.name)
    }

    fn foreign_table_name(&self, name: &str) -> Result<&'static str> {
        self.inner
            .ty
            .foreign_table_named(name)
            .map(|f| f.field)
            .ok_or_else(|| {
                Error::model(
                    ModelAccessErrorKind::UnknownField,
                    self.type_name(),
                    Some(name),
                    "no such inverse field",
                )
            })
    }

    /// Current value of a property; unset properties are NULL.
    pub fn get(&self, name: &str) -> Result<FieldValue> {
        let name = self.property_name(name)?;
        Ok(self
            .lock()
            .fields
            .get(name)
            .cloned()
            .unwrap_or(FieldValue::NULL))
    }

    /// Current column value of a property.
    pub fn get_value(&self, name: &str) -> Result<Value> {
        Ok(self.get(name)?.column_value())
    }

    /// The instance referenced by a foreign key property, if any.
    pub fn get_entity(&self, name: &str) -> Result<Option<EntityRef>> {
        match self.get(name)? {
            FieldValue::Entity(e) => Ok(Some(e)),
            FieldValue::Value(_) => Ok(None),
            FieldValue::Collection(_) => Err(Error::model(
                ModelAccessErrorKind::WrongShape,
                self.type_name(),
                Some(name),
                "property holds a collection",
            )),
        }
    }

    /// Set a property and mark it modified.
    pub fn set(&self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let name = self.property_name(name)?;
        let value = value.into();
        if matches!(value, FieldValue::Collection(_)) {
            return Err(Error::model(
                ModelAccessErrorKind::WrongShape,
                self.type_name(),
                Some(name),
                "a property cannot hold a collection",
            ));
        }
        let mut data = self.lock();
        data.fields.insert(name, value);
        data.state.mark_modified(name);
        Ok(())
    }

    /// Loaded value of an inverse field; `None` when it was never loaded.
    pub fn foreign_table(&self, name: &str) -> Result<Option<FieldValue>> {
        let name = self.foreign_table_name(name)?;
        Ok(self.lock().foreign_tables.get(name).cloned())
    }

    /// Replace the contents of an inverse field and mark it modified.
    pub fn set_foreign_table(&self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let name = self.foreign_table_name(name)?;
        let value = value.into();
        let collection = self
            .inner
            .ty
            .foreign_table_named(name)
            .is_some_and(|f| f.collection);
        if collection != matches!(value, FieldValue::Collection(_)) && !value.is_null() {
            return Err(Error::model(
                ModelAccessErrorKind::WrongShape,
                self.type_name(),
                Some(name),
                "value does not match the inverse field shape",
            ));
        }
        let mut data = self.lock();
        data.foreign_tables.insert(name, value);
        data.state.mark_modified(name);
        Ok(())
    }

    pub fn is_persisted(&self) -> bool {
        self.lock().state.is_persisted()
    }

    pub fn is_loaded(&self) -> bool {
        self.lock().state.is_loaded()
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().state.is_deleted()
    }

    pub fn is_modified(&self, name: &str) -> bool {
        self.lock().state.is_field_modified(name)
    }

    pub fn modified_fields(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.lock().state.modified_fields().collect();
        names.sort_unstable();
        names
    }

    pub fn persisted_value(&self, name: &str) -> Option<FieldValue> {
        self.lock().state.persisted_value(name).cloned()
    }

    pub fn persisted_foreign_table(&self, name: &str) -> Option<FieldValue> {
        self.lock().state.persisted_foreign_table(name).cloned()
    }

    /// Snapshot of the state, for inspection.
    pub fn state(&self) -> EntityState {
        self.lock().state.clone()
    }

    // Hooks used by the write path. They change values without recording
    // a user modification.

    /// Set a property without marking it modified.
    pub fn assign(&self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let name = self.property_name(name)?;
        self.lock().fields.insert(name, value.into());
        Ok(())
    }

    /// Set a property and its stored baseline, e.g. after a bulk UPDATE.
    pub fn assign_persisted(&self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let name = self.property_name(name)?;
        let value = value.into();
        let mut data = self.lock();
        data.fields.insert(name, value.clone());
        data.state.set_persisted_value(name, value);
        data.state.clear_modified(name);
        Ok(())
    }

    /// Roll a property back to its stored value.
    pub fn restore_persisted(&self, name: &str) -> Result<()> {
        let name = self.property_name(name)?;
        let mut data = self.lock();
        let value = data
            .state
            .persisted_value(name)
            .cloned()
            .unwrap_or(FieldValue::NULL);
        data.fields.insert(name, value);
        data.state.clear_modified(name);
        Ok(())
    }

    /// Remove `member` from a loaded inverse field, in memory only.
    ///
    /// The stored baseline is updated too, so a later save of this instance
    /// does not treat the member as removed by the user.
    pub fn detach_foreign_table(&self, name: &str, member: &EntityRef) -> Result<()> {
        let name = self.foreign_table_name(name)?;
        let mut data = self.lock();
        if let Some(current) = data.foreign_tables.get_mut(name) {
            detach(current, member);
        }
        if let Some(persisted) = data.state.persisted_foreign_table_mut(name) {
            detach(persisted, member);
        }
        Ok(())
    }

    /// Forget every loaded inverse field, releasing the member handles.
    ///
    /// The fields read as not loaded afterwards; nothing is written.
    pub fn unload_foreign_tables(&self) {
        let mut data = self.lock();
        data.foreign_tables.clear();
        for ft in &self.inner.ty.foreign_tables {
            data.state.forget_foreign_table(ft.field);
        }
    }

    /// Make the current values the stored baseline after an INSERT or UPDATE.
    ///
    /// For an instance that was never loaded only the fields it holds become
    /// known; it stays not loaded.
    pub fn mark_saved(&self) {
        let mut data = self.lock();
        if !data.state.is_loaded() {
            let values = data.fields.clone();
            data.state.saved_fields(values);
            return;
        }
        let mut values = data.fields.clone();
        for prop in &self.inner.ty.properties {
            values.entry(prop.name).or_insert(FieldValue::NULL);
        }
        let foreign_tables = data.foreign_tables.clone();
        data.state.saved(values, foreign_tables);
    }

    /// Fill properties from a stored row.
    ///
    /// Properties the user changed before the load keep their new value.
    pub fn fill_from_store(&self, values: Vec<(&'static str, FieldValue)>) {
        let mut data = self.lock();
        for (name, value) in values {
            if !data.state.is_field_modified(name) {
                data.fields.insert(name, value.clone());
            }
            data.state.set_persisted_value(name, value);
        }
        data.state.loaded();
    }

    /// Terminal transition after a successful DELETE.
    ///
    /// A store-generated id is cleared: it no longer identifies a row.
    pub fn mark_deleted(&self) {
        let mut data = self.lock();
        data.state.deleted();
        if let Some(id) = self.inner.ty.id_property() {
            if matches!(
                id.generated,
                Some(GeneratedValue::AutoIncrement | GeneratedValue::Sequence(_))
            ) {
                data.fields.insert(id.name, FieldValue::NULL);
            }
        }
    }
}

fn detach(value: &mut FieldValue, member: &EntityRef) {
    match value {
        FieldValue::Collection(items) => items.retain(|e| !e.ptr_eq(member)),
        FieldValue::Entity(e) if e.ptr_eq(member) => *value = FieldValue::NULL,
        _ => {}
    }
}
