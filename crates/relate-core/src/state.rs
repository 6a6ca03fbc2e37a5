//! Per-instance persistence state.

use crate::entity::FieldValue;
use std::collections::{HashMap, HashSet};

/// Persistence status of one entity instance.
///
/// A state is owned by exactly one [`EntityRef`](crate::EntityRef). It knows
/// whether the row exists in the store, whether the instance reflects the
/// stored row, the last known stored values and which fields were changed
/// since then.
#[derive(Debug, Clone, Default)]
pub struct EntityState {
    persisted: bool,
    loaded: bool,
    deleted: bool,
    /// Last known database values of properties
    persisted_values: HashMap<&'static str, FieldValue>,
    /// Inverse field contents as of the last load or save
    persisted_foreign_tables: HashMap<&'static str, FieldValue>,
    modified: HashSet<&'static str>,
}

impl EntityState {
    /// State of an instance that does not exist in the store yet.
    pub fn transient() -> Self {
        Self {
            loaded: true,
            ..Self::default()
        }
    }

    /// State of a row known only by its identifier.
    pub fn reference(id_name: &'static str, id: FieldValue) -> Self {
        let mut persisted_values = HashMap::new();
        persisted_values.insert(id_name, id);
        Self {
            persisted: true,
            persisted_values,
            ..Self::default()
        }
    }

    /// State of an instance read from a stored row.
    pub fn stored(values: HashMap<&'static str, FieldValue>) -> Self {
        Self {
            persisted: true,
            loaded: true,
            persisted_values: values,
            ..Self::default()
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// A non-persisted instance is always considered loaded.
    pub fn is_loaded(&self) -> bool {
        !self.persisted || self.loaded
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_field_modified(&self, name: &str) -> bool {
        self.modified.contains(name)
    }

    pub fn modified_fields(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modified.iter().copied()
    }

    /// Last known stored value; `None` if the field was never loaded or saved.
    pub fn persisted_value(&self, name: &str) -> Option<&FieldValue> {
        self.persisted_values.get(name)
    }

    pub fn persisted_foreign_table(&self, name: &str) -> Option<&FieldValue> {
        self.persisted_foreign_tables.get(name)
    }

    pub(crate) fn mark_modified(&mut self, name: &'static str) {
        self.modified.insert(name);
    }

    pub(crate) fn clear_modified(&mut self, name: &str) {
        self.modified.remove(name);
    }

    pub(crate) fn set_persisted_value(&mut self, name: &'static str, value: FieldValue) {
        self.persisted_values.insert(name, value);
    }

    pub(crate) fn persisted_foreign_table_mut(&mut self, name: &str) -> Option<&mut FieldValue> {
        self.persisted_foreign_tables.get_mut(name)
    }

    pub(crate) fn forget_foreign_table(&mut self, name: &str) {
        self.persisted_foreign_tables.remove(name);
        self.modified.remove(name);
    }

    /// The row was written; current values become the baseline.
    pub(crate) fn saved(
        &mut self,
        values: HashMap<&'static str, FieldValue>,
        foreign_tables: HashMap<&'static str, FieldValue>,
    ) {
        self.persisted = true;
        self.loaded = true;
        self.persisted_values = values;
        self.persisted_foreign_tables = foreign_tables;
        self.modified.clear();
    }

    /// Only the written fields of a not loaded instance are known now.
    pub(crate) fn saved_fields(&mut self, values: HashMap<&'static str, FieldValue>) {
        self.persisted = true;
        self.persisted_values.extend(values);
        self.modified.clear();
    }

    pub(crate) fn loaded(&mut self) {
        self.loaded = true;
    }

    /// Terminal transition after a successful DELETE.
    pub(crate) fn deleted(&mut self) {
        self.deleted = true;
        self.modified.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Value;

    #[test]
    fn transient_state_is_loaded() {
        let state = EntityState::transient();
        assert!(!state.is_persisted());
        assert!(state.is_loaded());
        assert!(state.persisted_value("id").is_none());
    }

    #[test]
    fn reference_state_is_not_loaded() {
        let state = EntityState::reference("id", FieldValue::Value(Value::BigInt(4)));
        assert!(state.is_persisted());
        assert!(!state.is_loaded());
        assert_eq!(
            state.persisted_value("id"),
            Some(&FieldValue::Value(Value::BigInt(4)))
        );
    }

    #[test]
    fn saved_clears_modifications() {
        let mut state = EntityState::transient();
        state.mark_modified("name");
        assert!(state.is_field_modified("name"));

        let mut values = HashMap::new();
        values.insert("name", FieldValue::Value(Value::Text("a".into())));
        state.saved(values, HashMap::new());

        assert!(state.is_persisted());
        assert!(!state.is_field_modified("name"));
        assert_eq!(state.modified_fields().count(), 0);
    }
}
